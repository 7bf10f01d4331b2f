#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use escrow_engine::auth::StaticAdmins;
use escrow_engine::clock::ManualClock;
use escrow_engine::models::{
    Currency, EscrowTransaction, LineItem, NewTransaction, PaymentMethod, Transaction,
    TransactionType, UserId,
};
use escrow_engine::notify::{DeliveryError, MemorySink, Notification, NotificationSink, Notifier};
use escrow_engine::payment::{
    PaymentProcessor, PaymentReceipt, PaymentRequest, ProcessorError, ProcessorResult,
};
use escrow_engine::store::MemoryStore;
use escrow_engine::{Collaborators, Config, EscrowEngine, Marketplace, TransactionLedger};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub const BUYER: &str = "buyer-1";
pub const SELLER: &str = "seller-1";
pub const OUTSIDER: &str = "outsider-1";
pub const ADMIN: &str = "admin-1";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn user(id: &str) -> UserId {
    UserId::new(id)
}

/// One processor call as seen by [`RecordingProcessor`]
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorCall {
    pub operation: &'static str,
    pub counterparty: UserId,
    pub amount: Decimal,
}

/// Processor double that records calls and can be told to fail or stall
#[derive(Default)]
pub struct RecordingProcessor {
    calls: Mutex<Vec<ProcessorCall>>,
    failing: Mutex<HashSet<&'static str>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingProcessor {
    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().insert(operation);
    }

    pub fn heal(&self, operation: &'static str) {
        self.failing.lock().remove(operation);
    }

    pub fn stall(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<ProcessorCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    async fn handle(&self, operation: &'static str, request: &PaymentRequest) -> ProcessorResult {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(operation) {
            return Err(ProcessorError::Declined(format!("{operation} refused")));
        }
        self.calls.lock().push(ProcessorCall {
            operation,
            counterparty: request.counterparty.clone(),
            amount: request.amount,
        });
        Ok(PaymentReceipt {
            reference: format!("test-{operation}-{}", request.escrow_id),
        })
    }
}

#[async_trait]
impl PaymentProcessor for RecordingProcessor {
    async fn collect(&self, request: &PaymentRequest) -> ProcessorResult {
        self.handle("collect", request).await
    }

    async fn payout(&self, request: &PaymentRequest) -> ProcessorResult {
        self.handle("payout", request).await
    }

    async fn refund(&self, request: &PaymentRequest) -> ProcessorResult {
        self.handle("refund", request).await
    }
}

/// Sink whose every delivery fails
pub struct FailingSink;

#[async_trait]
impl NotificationSink for FailingSink {
    async fn deliver(&self, _notification: &Notification) -> Result<(), DeliveryError> {
        Err(DeliveryError("mail server down".into()))
    }
}

/// Fully wired marketplace over in-memory collaborators
pub struct Harness {
    pub market: Marketplace,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub processor: Arc<RecordingProcessor>,
    pub sink: Arc<MemorySink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::enabled())
    }

    pub fn with_config(config: Config) -> Self {
        let sink = Arc::new(MemorySink::new());
        Self::build(config, Arc::new(MemoryStore::new()), sink.clone(), sink)
    }

    pub fn with_failing_notifications() -> Self {
        Self::build(
            Config::enabled(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemorySink::new()),
            Arc::new(FailingSink),
        )
    }

    pub fn with_store(config: Config, store: Arc<MemoryStore>) -> Self {
        let sink = Arc::new(MemorySink::new());
        Self::build(config, store, sink.clone(), sink)
    }

    fn build(
        config: Config,
        store: Arc<MemoryStore>,
        sink: Arc<MemorySink>,
        delivery: Arc<dyn NotificationSink>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let processor = Arc::new(RecordingProcessor::default());
        let collaborators = Collaborators {
            store: store.clone(),
            clock: clock.clone(),
            admins: Arc::new(StaticAdmins::new([ADMIN])),
            processor: processor.clone(),
            notifier: Notifier::new(delivery),
        };
        let market = Marketplace::new(config, collaborators).unwrap();
        Self {
            market,
            clock,
            store,
            processor,
            sink,
        }
    }

    pub fn escrow(&self) -> &EscrowEngine {
        &self.market.escrow
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.market.ledger
    }

    pub async fn pending_escrow(&self, amount: Decimal) -> EscrowTransaction {
        self.escrow()
            .create_escrow(None, user(BUYER), user(SELLER), amount, Currency::Brl)
            .await
            .unwrap()
    }

    pub async fn funded_escrow(&self, amount: Decimal) -> EscrowTransaction {
        let escrow = self.pending_escrow(amount).await;
        self.escrow()
            .fund_escrow(escrow.id, PaymentMethod::Pix)
            .await
            .unwrap()
    }

    pub async fn product_transaction(&self) -> Transaction {
        self.ledger()
            .create_transaction(product_intent(BUYER, SELLER))
            .await
            .unwrap()
    }

    /// Transaction with an escrow linked to it, escrow still PENDING
    pub async fn linked_escrow(&self) -> (Transaction, EscrowTransaction) {
        let transaction = self.product_transaction().await;
        let escrow = self
            .escrow()
            .create_escrow(
                Some(transaction.id),
                user(BUYER),
                user(SELLER),
                transaction.total,
                Currency::Brl,
            )
            .await
            .unwrap();
        (transaction, escrow)
    }
}

pub fn product_intent(buyer: &str, seller: &str) -> NewTransaction {
    NewTransaction {
        tx_type: TransactionType::Product,
        item_id: "item-42".into(),
        buyer_id: user(buyer),
        seller_id: user(seller),
        items: vec![
            LineItem::new("sku-1", dec!(2), dec!(150.00)),
            LineItem::new("sku-2", dec!(1), dec!(200.00)),
        ],
        shipping: None,
    }
}

pub fn config_with(edit: impl FnOnce(&mut Config)) -> Config {
    let mut config = Config::enabled();
    edit(&mut config);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_intent_totals() {
        let intent = product_intent(BUYER, SELLER);
        let total: Decimal = intent.items.iter().map(|i| i.subtotal()).sum();
        assert_eq!(total, dec!(500.00));
    }

    #[test]
    fn test_config_with_keeps_escrow_enabled() {
        let config = config_with(|c| c.escrow.auto_release_days = 2);
        assert!(config.escrow.enabled);
        assert_eq!(config.escrow.auto_release_days, 2);
    }
}
