//! Notification emitter
//!
//! Converts lifecycle events into notification intents for the external
//! delivery collaborator. Emission happens after the state change is
//! committed and is fire-and-forget: a failed delivery is logged and never
//! undoes or fails the transition. Retrying is the sink's business.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::models::{Dispute, EscrowTransaction, ResolutionAction, Transaction, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    #[serde(rename = "transaction.created")]
    TransactionCreated,
    #[serde(rename = "escrow.funded")]
    EscrowFunded,
    #[serde(rename = "escrow.released")]
    EscrowReleased,
    #[serde(rename = "escrow.refunded")]
    EscrowRefunded,
    #[serde(rename = "dispute.opened")]
    DisputeOpened,
    #[serde(rename = "dispute.resolved")]
    DisputeResolved,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::TransactionCreated => "transaction.created",
            NotificationKind::EscrowFunded => "escrow.funded",
            NotificationKind::EscrowReleased => "escrow.released",
            NotificationKind::EscrowRefunded => "escrow.refunded",
            NotificationKind::DisputeOpened => "dispute.opened",
            NotificationKind::DisputeResolved => "dispute.resolved",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound notification intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
}

impl Notification {
    fn new(
        user_id: &UserId,
        kind: NotificationKind,
        title: &str,
        message: String,
        data: serde_json::Value,
    ) -> Self {
        Self {
            user_id: user_id.clone(),
            kind,
            title: title.to_string(),
            message,
            data,
        }
    }
}

#[derive(Error, Debug)]
#[error("notification delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Delivery collaborator (email, push, in-app)
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Sink that only logs each intent
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        tracing::info!(
            user = %notification.user_id,
            kind = %notification.kind,
            title = %notification.title,
            "notification intent"
        );
        Ok(())
    }
}

/// Sink that keeps every intent in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    sent: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect()
    }

    /// Drain collected intents
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

/// Stateless event-to-intent converter bound to a sink
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Deliver every intent; failures are logged, not returned
    pub async fn emit(&self, notifications: Vec<Notification>) {
        let deliveries = notifications.iter().map(|n| async move {
            if let Err(e) = self.sink.deliver(n).await {
                tracing::warn!(
                    user = %n.user_id,
                    kind = %n.kind,
                    error = %e,
                    "dropping notification after delivery failure"
                );
            }
        });
        futures::future::join_all(deliveries).await;
    }

    pub fn transaction_created(transaction: &Transaction) -> Vec<Notification> {
        let data = json!({ "transactionId": transaction.id, "type": transaction.tx_type });
        vec![
            Notification::new(
                &transaction.buyer_id,
                NotificationKind::TransactionCreated,
                "Purchase intent registered",
                format!(
                    "Your {} request for item {} was registered. The seller will get in touch.",
                    transaction.tx_type.as_str().to_lowercase(),
                    transaction.item_id
                ),
                data.clone(),
            ),
            Notification::new(
                &transaction.seller_id,
                NotificationKind::TransactionCreated,
                "New purchase intent received",
                format!(
                    "You received a new {} request for item {}. Contact the buyer to negotiate.",
                    transaction.tx_type.as_str().to_lowercase(),
                    transaction.item_id
                ),
                data,
            ),
        ]
    }

    pub fn escrow_funded(escrow: &EscrowTransaction) -> Vec<Notification> {
        let data = escrow_data(escrow);
        let total = escrow.currency.format(escrow.total_amount);
        vec![
            Notification::new(
                &escrow.payer_id,
                NotificationKind::EscrowFunded,
                "Payment held in escrow",
                format!("Your deposit of {total} is now held in custody."),
                data.clone(),
            ),
            Notification::new(
                &escrow.payee_id,
                NotificationKind::EscrowFunded,
                "Buyer funded the escrow",
                format!("{total} is in custody. You can proceed with delivery."),
                data,
            ),
        ]
    }

    pub fn escrow_released(escrow: &EscrowTransaction) -> Vec<Notification> {
        let data = escrow_data(escrow);
        let amount = escrow.currency.format(escrow.amount);
        vec![
            Notification::new(
                &escrow.payee_id,
                NotificationKind::EscrowReleased,
                "Escrow released",
                format!("{amount} was released to you."),
                data.clone(),
            ),
            Notification::new(
                &escrow.payer_id,
                NotificationKind::EscrowReleased,
                "Escrow released",
                format!("{amount} held in custody was released to the seller."),
                data,
            ),
        ]
    }

    pub fn escrow_refunded(escrow: &EscrowTransaction) -> Vec<Notification> {
        let data = escrow_data(escrow);
        let total = escrow.currency.format(escrow.total_amount);
        vec![
            Notification::new(
                &escrow.payer_id,
                NotificationKind::EscrowRefunded,
                "Escrow refunded",
                format!("{total} was returned to you."),
                data.clone(),
            ),
            Notification::new(
                &escrow.payee_id,
                NotificationKind::EscrowRefunded,
                "Escrow refunded",
                "The funds held in custody were returned to the buyer.".to_string(),
                data,
            ),
        ]
    }

    pub fn dispute_opened(dispute: &Dispute, escrow: &EscrowTransaction) -> Vec<Notification> {
        let data = json!({ "escrowId": escrow.id, "disputeId": dispute.id });
        [&escrow.payer_id, &escrow.payee_id]
            .into_iter()
            .map(|user| {
                Notification::new(
                    user,
                    NotificationKind::DisputeOpened,
                    "Dispute opened",
                    format!(
                        "A dispute was opened by {}: {}. Funds stay frozen until an admin decides.",
                        dispute.initiator_id, dispute.reason
                    ),
                    data.clone(),
                )
            })
            .collect()
    }

    pub fn dispute_resolved(dispute: &Dispute, escrow: &EscrowTransaction) -> Vec<Notification> {
        let data = json!({ "escrowId": escrow.id, "disputeId": dispute.id });
        let outcome = match dispute.resolution.as_ref().map(|r| r.action) {
            Some(ResolutionAction::Release) => "funds released to the seller",
            Some(ResolutionAction::Refund) => "funds refunded to the buyer",
            None => "resolved",
        };
        [&escrow.payer_id, &escrow.payee_id]
            .into_iter()
            .map(|user| {
                Notification::new(
                    user,
                    NotificationKind::DisputeResolved,
                    "Dispute resolved",
                    format!("The dispute was resolved: {outcome}."),
                    data.clone(),
                )
            })
            .collect()
    }
}

fn escrow_data(escrow: &EscrowTransaction) -> serde_json::Value {
    json!({
        "escrowId": escrow.id,
        "transactionId": escrow.transaction_id,
        "amount": escrow.amount,
        "totalAmount": escrow.total_amount,
        "currency": escrow.currency,
    })
}
