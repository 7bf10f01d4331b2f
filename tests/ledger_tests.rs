mod common;

use chrono::Duration;
use common::{
    config_with, product_intent, start_time, user, Harness, ADMIN, BUYER, OUTSIDER, SELLER,
};
use escrow_engine::models::{
    Address, HistoryAction, LineItem, NewTransaction, PaymentMethod, ShippingInfo,
    TransactionId, TransactionStatus, TransactionType,
};
use escrow_engine::notify::NotificationKind;
use escrow_engine::{CoreError, TransactionFilter};
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_create_transaction() {
    let h = Harness::new();
    let transaction = h.product_transaction().await;

    assert_eq!(transaction.status, TransactionStatus::Pending);
    assert_eq!(transaction.total, dec!(500.00));
    assert_eq!(transaction.history.len(), 1);
    assert_eq!(transaction.history[0].action, HistoryAction::Created);
    assert!(transaction.escrow_id.is_none());

    let notices = h.sink.of_kind(NotificationKind::TransactionCreated);
    assert_eq!(notices.len(), 2);
    assert!(notices.iter().any(|n| n.user_id == user(BUYER)));
    assert!(notices.iter().any(|n| n.user_id == user(SELLER)));
}

#[tokio::test]
async fn test_shipping_cost_is_not_added_to_total() {
    let h = Harness::new();
    let mut intent = product_intent(BUYER, SELLER);
    intent.shipping = Some(ShippingInfo {
        address: Address {
            city: "Curitiba".into(),
            ..Address::default()
        },
        cost: dec!(35.90),
    });
    let transaction = h.ledger().create_transaction(intent).await.unwrap();
    assert_eq!(transaction.total, dec!(500.00));
    assert_eq!(transaction.shipping_info.unwrap().cost, dec!(35.90));
}

#[tokio::test]
async fn test_create_rejects_invalid_input() {
    let h = Harness::new();

    let same_party = product_intent(BUYER, BUYER);
    let mut no_items = product_intent(BUYER, SELLER);
    no_items.items.clear();
    let mut negative = product_intent(BUYER, SELLER);
    negative.items.push(LineItem::new("sku-3", dec!(-1), dec!(10)));
    let mut negative_price = product_intent(BUYER, SELLER);
    negative_price.items[0].unit_price = dec!(-0.01);

    for intent in [same_party, no_items, negative, negative_price] {
        let err = h.ledger().create_transaction(intent).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)), "{err}");
    }
    assert!(h.sink.sent().is_empty());
}

#[tokio::test]
async fn test_service_without_items_is_allowed() {
    let h = Harness::new();
    let intent = NewTransaction {
        tx_type: TransactionType::Service,
        item_id: "service-7".into(),
        buyer_id: user(BUYER),
        seller_id: user(SELLER),
        items: vec![],
        shipping: None,
    };
    let transaction = h.ledger().create_transaction(intent).await.unwrap();
    assert_eq!(transaction.total, dec!(0));
}

#[tokio::test]
async fn test_first_message_starts_negotiation() {
    let h = Harness::new();
    let transaction = h.product_transaction().await;

    h.ledger()
        .post_message(transaction.id, user(SELLER), "Hi, still available")
        .await
        .unwrap();
    let stored = h.ledger().get_transaction(&transaction.id).await.unwrap();
    assert_eq!(stored.status, TransactionStatus::Negotiating);
    assert_eq!(
        stored.history.last().map(|e| e.action),
        Some(HistoryAction::NegotiationStarted)
    );

    h.clock.advance(Duration::minutes(1));
    h.ledger()
        .post_message(transaction.id, user(BUYER), "Great, can you ship Monday?")
        .await
        .unwrap();
    let again = h.ledger().get_transaction(&transaction.id).await.unwrap();
    assert_eq!(again.status, TransactionStatus::Negotiating);
    assert_eq!(again.history.len(), stored.history.len());
    assert!(again.updated_at > stored.updated_at);

    let thread = h.ledger().messages(&transaction.id).await.unwrap();
    let senders: Vec<_> = thread.iter().map(|m| m.sender_id.clone()).collect();
    assert_eq!(senders, vec![user(SELLER), user(BUYER)]);
}

#[tokio::test]
async fn test_post_message_errors() {
    let h = Harness::new();
    let transaction = h.product_transaction().await;

    let err = h
        .ledger()
        .post_message(TransactionId::new(), user(BUYER), "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));

    let err = h
        .ledger()
        .post_message(transaction.id, user(OUTSIDER), "psst")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));

    let err = h
        .ledger()
        .post_message(transaction.id, user(BUYER), "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));

    h.ledger()
        .update_status(transaction.id, TransactionStatus::Cancelled, user(BUYER), "")
        .await
        .unwrap();
    let err = h
        .ledger()
        .post_message(transaction.id, user(BUYER), "wait")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidState(_)));
}

#[tokio::test]
async fn test_agree_requires_both_parties() {
    let h = Harness::new();
    let transaction = h.product_transaction().await;
    h.ledger()
        .post_message(transaction.id, user(BUYER), "offer 450?")
        .await
        .unwrap();

    let err = h
        .ledger()
        .update_status(transaction.id, TransactionStatus::Agreed, user(BUYER), "")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidState(_)));

    h.ledger()
        .post_message(transaction.id, user(SELLER), "deal")
        .await
        .unwrap();
    let agreed = h
        .ledger()
        .update_status(transaction.id, TransactionStatus::Agreed, user(SELLER), "deal at 450")
        .await
        .unwrap();
    assert_eq!(agreed.status, TransactionStatus::Agreed);
    let last = agreed.history.last().unwrap();
    assert_eq!(last.action, HistoryAction::StatusChanged);
    assert_eq!(last.description, "deal at 450");
    assert_eq!(last.actor, Some(user(SELLER)));
}

#[tokio::test]
async fn test_single_party_agreement_when_policy_relaxed() {
    let h = Harness::with_config(config_with(|c| c.ledger.require_both_parties_to_agree = false));
    let transaction = h.product_transaction().await;
    h.ledger()
        .post_message(transaction.id, user(BUYER), "I accept")
        .await
        .unwrap();
    let agreed = h
        .ledger()
        .update_status(transaction.id, TransactionStatus::Agreed, user(BUYER), "")
        .await
        .unwrap();
    assert_eq!(agreed.status, TransactionStatus::Agreed);
}

#[tokio::test]
async fn test_invalid_transitions() {
    let h = Harness::new();
    let transaction = h.product_transaction().await;

    for target in [
        TransactionStatus::Agreed,
        TransactionStatus::Completed,
        TransactionStatus::Negotiating,
        TransactionStatus::Pending,
    ] {
        let err = h
            .ledger()
            .update_status(transaction.id, target, user(BUYER), "")
            .await
            .unwrap_err();
        assert!(
            matches!(err, CoreError::InvalidTransition { .. }),
            "PENDING -> {target}: {err}"
        );
    }
}

#[tokio::test]
async fn test_complete_only_after_agreement() {
    let h = Harness::new();
    let transaction = h.product_transaction().await;
    h.ledger()
        .post_message(transaction.id, user(BUYER), "hi")
        .await
        .unwrap();
    h.ledger()
        .post_message(transaction.id, user(SELLER), "hello")
        .await
        .unwrap();

    let err = h
        .ledger()
        .update_status(transaction.id, TransactionStatus::Completed, user(SELLER), "")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));

    h.ledger()
        .update_status(transaction.id, TransactionStatus::Agreed, user(BUYER), "")
        .await
        .unwrap();
    let done = h
        .ledger()
        .update_status(transaction.id, TransactionStatus::Completed, user(SELLER), "")
        .await
        .unwrap();
    assert_eq!(done.status, TransactionStatus::Completed);

    let err = h
        .ledger()
        .update_status(transaction.id, TransactionStatus::Cancelled, user(BUYER), "")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_status_update_authorization() {
    let h = Harness::new();
    let transaction = h.product_transaction().await;

    let err = h
        .ledger()
        .update_status(transaction.id, TransactionStatus::Cancelled, user(OUTSIDER), "")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));

    let cancelled = h
        .ledger()
        .update_status(
            transaction.id,
            TransactionStatus::Cancelled,
            user(ADMIN),
            "fraud report",
        )
        .await
        .unwrap();
    assert_eq!(cancelled.status, TransactionStatus::Cancelled);
}

#[tokio::test]
async fn test_list_for_user_newest_first() {
    let h = Harness::new();
    let first = h.product_transaction().await;
    h.clock.advance(Duration::hours(1));
    let second = h
        .ledger()
        .create_transaction(NewTransaction {
            tx_type: TransactionType::Freight,
            item_id: "route-9".into(),
            buyer_id: user(BUYER),
            seller_id: user(OUTSIDER),
            items: vec![LineItem::new("leg-1", dec!(1), dec!(800))],
            shipping: None,
        })
        .await
        .unwrap();

    let all = h.ledger().list_for_user(&user(BUYER), None).await.unwrap();
    let ids: Vec<_> = all.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);

    let freight = h
        .ledger()
        .list_for_user(&user(BUYER), Some(TransactionType::Freight))
        .await
        .unwrap();
    assert_eq!(freight.len(), 1);

    let seller_view = h.ledger().list_for_user(&user(SELLER), None).await.unwrap();
    assert_eq!(seller_view.len(), 1);
    assert_eq!(seller_view[0].id, first.id);
}

#[tokio::test]
async fn test_list_all_filters_and_stats() {
    let h = Harness::new();
    let start = start_time();
    let first = h.product_transaction().await;
    h.clock.advance(Duration::days(2));
    h.product_transaction().await;
    h.ledger()
        .update_status(first.id, TransactionStatus::Cancelled, user(SELLER), "")
        .await
        .unwrap();

    let cancelled = h
        .ledger()
        .list_all(&TransactionFilter {
            status: Some(TransactionStatus::Cancelled),
            ..TransactionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 1);

    let early = h
        .ledger()
        .list_all(&TransactionFilter {
            to: Some(start + Duration::days(1)),
            ..TransactionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(early.len(), 1);
    assert_eq!(early[0].id, first.id);

    let stats = h.ledger().stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_status.get(&TransactionStatus::Pending), Some(&1));
    assert_eq!(stats.by_status.get(&TransactionStatus::Cancelled), Some(&1));
    assert_eq!(stats.by_type.get(&TransactionType::Product), Some(&2));
    assert_eq!(stats.total_value, dec!(1000.00));
}

#[tokio::test]
async fn test_messages_for_unknown_transaction() {
    let h = Harness::new();
    let err = h.ledger().messages(&TransactionId::new()).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound { kind: "transaction", .. }));
}

#[tokio::test]
async fn test_open_escrow_blocks_manual_close() {
    let h = Harness::new();
    let (transaction, escrow) = h.linked_escrow().await;
    h.escrow()
        .fund_escrow(escrow.id, PaymentMethod::Pix)
        .await
        .unwrap();

    for actor in [BUYER, ADMIN] {
        let err = h
            .ledger()
            .update_status(transaction.id, TransactionStatus::Cancelled, user(actor), "")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)), "{actor}: {err}");
    }
    let stored = h.ledger().get_transaction(&transaction.id).await.unwrap();
    assert_eq!(stored.status, TransactionStatus::Pending);

    // Cancelling the escrow refunds the buyer and closes the transaction
    h.escrow().cancel_escrow(escrow.id, "deal off").await.unwrap();
    let stored = h.ledger().get_transaction(&transaction.id).await.unwrap();
    assert_eq!(stored.status, TransactionStatus::Cancelled);
    assert_eq!(h.processor.count("refund"), 1);
}
