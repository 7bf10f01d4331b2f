use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ids::{EscrowId, MessageId, TransactionId, UserId};

/// Kind of marketplace interaction being brokered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Product,
    Freight,
    Service,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Product => "PRODUCT",
            TransactionType::Freight => "FREIGHT",
            TransactionType::Service => "SERVICE",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiation lifecycle of a transaction
///
/// ```text
/// PENDING -> NEGOTIATING -> AGREED -> COMPLETED
///    \___________\____________\_____> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Negotiating,
    Agreed,
    Cancelled,
    Completed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Negotiating => "NEGOTIATING",
            TransactionStatus::Agreed => "AGREED",
            TransactionStatus::Cancelled => "CANCELLED",
            TransactionStatus::Completed => "COMPLETED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Cancelled | TransactionStatus::Completed
        )
    }

    /// Transitions reachable through an explicit status update
    ///
    /// PENDING -> NEGOTIATING is not listed; only the first posted message
    /// causes it.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Negotiating, Agreed)
                | (Agreed, Completed)
                | (Pending, Cancelled)
                | (Negotiating, Cancelled)
                | (Agreed, Cancelled)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the negotiated order (informational, never moves money)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub reference_id: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

impl LineItem {
    pub fn new(reference_id: impl Into<String>, quantity: Decimal, unit_price: Decimal) -> Self {
        Self {
            reference_id: reference_id.into(),
            quantity,
            unit_price,
        }
    }

    pub fn subtotal(&self) -> Decimal {
        self.quantity * self.unit_price
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub number: String,
    pub complement: Option<String>,
    pub neighborhood: Option<String>,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub country: String,
}

/// Delivery address plus the computed shipping cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingInfo {
    pub address: Address,
    pub cost: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    NegotiationStarted,
    StatusChanged,
    EscrowLinked,
    EscrowReleased,
    EscrowClosed,
    Expired,
}

/// Audit trail entry; never modified once appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: HistoryAction,
    pub status: TransactionStatus,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub actor: Option<UserId>,
}

/// Buyer/seller intermediation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub item_id: String,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub status: TransactionStatus,
    pub items: Vec<LineItem>,
    pub total: Decimal,
    pub shipping_info: Option<ShippingInfo>,
    pub escrow_id: Option<EscrowId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<HistoryEntry>,
}

impl Transaction {
    pub fn is_party(&self, user: &UserId) -> bool {
        &self.buyer_id == user || &self.seller_id == user
    }

    /// Move to `status` and append the matching history entry
    pub(crate) fn record(
        &mut self,
        action: HistoryAction,
        status: TransactionStatus,
        at: DateTime<Utc>,
        description: impl Into<String>,
        actor: Option<UserId>,
    ) {
        self.status = status;
        self.updated_at = at;
        self.history.push(HistoryEntry {
            action,
            status,
            timestamp: at,
            description: description.into(),
            actor,
        });
    }
}

/// Input of `TransactionLedger::create_transaction`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub item_id: String,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub items: Vec<LineItem>,
    pub shipping: Option<ShippingInfo>,
}

/// Negotiation message; the thread is append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub transaction_id: TransactionId,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}
