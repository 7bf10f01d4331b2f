mod common;

use chrono::Duration;
use common::{config_with, user, Harness, ADMIN, BUYER, SELLER};
use escrow_engine::models::{
    Currency, EscrowStatus, PaymentMethod, Resolution, ResolutionAction, TransactionStatus,
};
use escrow_engine::store::{RecordKey, Store};
use escrow_engine::CoreError;
use rust_decimal_macros::dec;

/// Release and refund racing on one funded escrow: exactly one applies
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_release_and_refund_race_single_winner() {
    let h = Harness::new();
    let escrow = h.funded_escrow(dec!(500)).await;

    let mut handles = vec![];
    for i in 0..20 {
        let engine = h.market.escrow.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                engine.release_escrow(escrow.id, "release").await
            } else {
                engine.refund_escrow(escrow.id, "refund").await
            }
        }));
    }

    let mut wins = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => assert!(matches!(e, CoreError::InvalidState(_)), "{e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(h.processor.count("payout") + h.processor.count("refund"), 1);

    let stored = h.escrow().get_escrow(&escrow.id).await.unwrap();
    assert!(stored.released_at.is_none() || stored.refunded_at.is_none());
    assert!(matches!(
        stored.status,
        EscrowStatus::Released | EscrowStatus::Refunded
    ));
}

/// Several sweep instances plus a manual release pay out once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sweeps_and_manual_release() {
    let h = Harness::new();
    let escrow = h.funded_escrow(dec!(100)).await;
    h.clock.advance(Duration::days(8));

    let mut sweeps = vec![];
    for _ in 0..5 {
        let engine = h.market.escrow.clone();
        sweeps.push(tokio::spawn(
            async move { engine.process_auto_releases().await },
        ));
    }
    let engine = h.market.escrow.clone();
    let manual = tokio::spawn(async move { engine.release_escrow(escrow.id, "buyer confirmed").await });

    let mut released = 0;
    for sweep in sweeps {
        released += sweep.await.unwrap().unwrap().len();
    }
    if manual.await.unwrap().is_ok() {
        released += 1;
    }

    assert_eq!(released, 1);
    assert_eq!(h.processor.count("payout"), 1);
    let stored = h.escrow().get_escrow(&escrow.id).await.unwrap();
    assert_eq!(stored.status, EscrowStatus::Released);
}

/// Only one of many simultaneous disputes opens
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_disputes_single_open() {
    let h = Harness::new();
    let escrow = h.funded_escrow(dec!(100)).await;

    let mut handles = vec![];
    for i in 0..10 {
        let engine = h.market.escrow.clone();
        let initiator = if i % 2 == 0 { BUYER } else { SELLER };
        handles.push(tokio::spawn(async move {
            engine
                .initiate_dispute(escrow.id, user(initiator), "conflict", vec![])
                .await
        }));
    }

    let mut opened = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => opened += 1,
            Err(e) => assert!(matches!(e, CoreError::DuplicateDispute(_)), "{e}"),
        }
    }
    assert_eq!(opened, 1);
}

/// Cancel racing fund never leaves a partial state
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_fund() {
    let h = Harness::new();
    let escrow = h.pending_escrow(dec!(100)).await;

    let fund = {
        let engine = h.market.escrow.clone();
        tokio::spawn(async move {
            engine
                .fund_escrow(escrow.id, PaymentMethod::Pix)
                .await
        })
    };
    let cancel = {
        let engine = h.market.escrow.clone();
        tokio::spawn(async move { engine.cancel_escrow(escrow.id, "abort").await })
    };
    let funded = fund.await.unwrap();
    cancel.await.unwrap().unwrap();

    let stored = h.escrow().get_escrow(&escrow.id).await.unwrap();
    assert_eq!(stored.status, EscrowStatus::Cancelled);
    // Cancel after fund refunds; cancel before fund makes fund fail
    match funded {
        Ok(_) => assert!(stored.refunded_at.is_some()),
        Err(e) => {
            assert!(matches!(e, CoreError::InvalidState(_)));
            assert!(stored.refunded_at.is_none());
        }
    }
}

/// Independent escrows proceed in parallel
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_many_escrows_in_parallel() {
    let h = Harness::new();

    let mut handles = vec![];
    for i in 0..50 {
        let engine = h.market.escrow.clone();
        handles.push(tokio::spawn(async move {
            let escrow = engine
                .create_escrow(
                    None,
                    user(&format!("buyer-{i}")),
                    user(SELLER),
                    dec!(100),
                    Currency::Brl,
                )
                .await?;
            engine
                .fund_escrow(escrow.id, PaymentMethod::Pix)
                .await?;
            engine.release_escrow(escrow.id, "done").await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stats = h.escrow().stats().await.unwrap();
    assert_eq!(stats.total, 50);
    assert_eq!(stats.released, 50);
    assert_eq!(h.processor.count("payout"), 50);
}

/// A held record lock surfaces as a retryable conflict, not a domain error
#[tokio::test]
async fn test_lock_contention_surfaces_conflict() {
    let h = Harness::with_config(config_with(|c| {
        c.runtime.lock_wait_ms = 20;
        c.runtime.lock_attempts = 2;
    }));
    let escrow = h.funded_escrow(dec!(100)).await;

    let held = h.store.lock(RecordKey::Escrow(escrow.id)).await.unwrap();
    let err = h.escrow().release_escrow(escrow.id, "x").await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
    assert!(!err.is_domain());
    drop(held);

    let released = h.escrow().release_escrow(escrow.id, "x").await.unwrap();
    assert_eq!(released.status, EscrowStatus::Released);
}

/// Resolution and a stale manual refund on the same escrow
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resolution_racing_refund() {
    let h = Harness::new();
    let escrow = h.funded_escrow(dec!(100)).await;
    let dispute = h
        .escrow()
        .initiate_dispute(escrow.id, user(BUYER), "late", vec![])
        .await
        .unwrap();

    let resolve = {
        let engine = h.market.escrow.clone();
        tokio::spawn(async move {
            engine
                .resolve_dispute(
                    dispute.id,
                    Resolution::new(ResolutionAction::Release, "ok"),
                    user(ADMIN),
                )
                .await
        })
    };
    let refund = {
        let engine = h.market.escrow.clone();
        tokio::spawn(async move { engine.refund_escrow(escrow.id, "stale").await })
    };

    resolve.await.unwrap().unwrap();
    let err = refund.await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::InvalidState(_)));

    let stored = h.escrow().get_escrow(&escrow.id).await.unwrap();
    assert_eq!(stored.status, EscrowStatus::Released);
    assert!(stored.refunded_at.is_none());
}

/// A held transaction lock stops a linked release before the payout is sent
#[tokio::test]
async fn test_linked_release_conflict_moves_no_money() {
    let h = Harness::with_config(config_with(|c| {
        c.runtime.lock_wait_ms = 20;
        c.runtime.lock_attempts = 2;
    }));
    let (transaction, escrow) = h.linked_escrow().await;
    h.escrow()
        .fund_escrow(escrow.id, PaymentMethod::Pix)
        .await
        .unwrap();

    let held = h
        .store
        .lock(RecordKey::Transaction(transaction.id))
        .await
        .unwrap();
    let err = h.escrow().release_escrow(escrow.id, "x").await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
    assert_eq!(h.processor.count("payout"), 0);
    let stored = h.escrow().get_escrow(&escrow.id).await.unwrap();
    assert_eq!(stored.status, EscrowStatus::Funded);
    drop(held);

    h.escrow().release_escrow(escrow.id, "x").await.unwrap();
    assert_eq!(h.processor.count("payout"), 1);
    let stored = h.ledger().get_transaction(&transaction.id).await.unwrap();
    assert_eq!(stored.status, TransactionStatus::Completed);
}

/// Same for funded cancellation and dispute resolution: no refund goes out
#[tokio::test]
async fn test_linked_refunds_wait_for_transaction_lock() {
    let h = Harness::with_config(config_with(|c| {
        c.runtime.lock_wait_ms = 20;
        c.runtime.lock_attempts = 2;
    }));
    let (transaction, escrow) = h.linked_escrow().await;
    h.escrow()
        .fund_escrow(escrow.id, PaymentMethod::Pix)
        .await
        .unwrap();

    let held = h
        .store
        .lock(RecordKey::Transaction(transaction.id))
        .await
        .unwrap();
    let err = h.escrow().cancel_escrow(escrow.id, "abort").await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
    drop(held);

    let dispute = h
        .escrow()
        .initiate_dispute(escrow.id, user(BUYER), "damaged", vec![])
        .await
        .unwrap();
    let held = h
        .store
        .lock(RecordKey::Transaction(transaction.id))
        .await
        .unwrap();
    let err = h
        .escrow()
        .resolve_dispute(
            dispute.id,
            Resolution::new(ResolutionAction::Refund, "damaged"),
            user(ADMIN),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
    assert_eq!(h.processor.count("refund"), 0);
    assert!(h.escrow().get_dispute(&dispute.id).await.unwrap().is_open());
    drop(held);

    h.escrow()
        .resolve_dispute(
            dispute.id,
            Resolution::new(ResolutionAction::Refund, "damaged"),
            user(ADMIN),
        )
        .await
        .unwrap();
    assert_eq!(h.processor.count("refund"), 1);
}
