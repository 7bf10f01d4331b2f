//! Transaction ledger
//!
//! CRUD and negotiation state machine for buyer/seller intermediation
//! records, plus the append-only message thread attached to each record.
//! Money is never moved here; see [`crate::escrow`] for custody.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::auth::AdminDirectory;
use crate::clock::Clock;
use crate::config::{LedgerSettings, RuntimeSettings};
use crate::error::{CoreError, Result};
use crate::models::{
    EscrowStatus, EscrowTransaction, HistoryAction, Message, MessageId, NewTransaction,
    Transaction, TransactionId, TransactionStatus, TransactionType, UserId,
};
use crate::notify::Notifier;
use crate::service::Collaborators;
use crate::store::{self, RecordKey, RecordLock, Store, WriteBatch};

/// Admin listing filter; `None` fields match everything
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub status: Option<TransactionStatus>,
    pub tx_type: Option<TransactionType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TransactionFilter {
    fn matches(&self, transaction: &Transaction) -> bool {
        self.status.map_or(true, |s| transaction.status == s)
            && self.tx_type.map_or(true, |t| transaction.tx_type == t)
            && self.from.map_or(true, |from| transaction.created_at >= from)
            && self.to.map_or(true, |to| transaction.created_at <= to)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionStats {
    pub total: usize,
    pub by_status: HashMap<TransactionStatus, usize>,
    pub by_type: HashMap<TransactionType, usize>,
    pub total_value: Decimal,
}

pub struct TransactionLedger {
    settings: LedgerSettings,
    runtime: RuntimeSettings,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    admins: Arc<dyn AdminDirectory>,
    notifier: Notifier,
}

impl TransactionLedger {
    pub fn new(
        settings: LedgerSettings,
        runtime: RuntimeSettings,
        collaborators: &Collaborators,
    ) -> Self {
        Self {
            settings,
            runtime,
            store: collaborators.store.clone(),
            clock: collaborators.clock.clone(),
            admins: collaborators.admins.clone(),
            notifier: collaborators.notifier.clone(),
        }
    }

    /// Register a buyer's intent
    pub async fn create_transaction(&self, new: NewTransaction) -> Result<Transaction> {
        validate_new(&new)?;

        let now = self.clock.now();
        let total: Decimal = new.items.iter().map(|item| item.subtotal()).sum();
        let mut transaction = Transaction {
            id: TransactionId::new(),
            tx_type: new.tx_type,
            item_id: new.item_id,
            buyer_id: new.buyer_id,
            seller_id: new.seller_id,
            status: TransactionStatus::Pending,
            items: new.items,
            total,
            shipping_info: new.shipping,
            escrow_id: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        };
        let buyer = transaction.buyer_id.clone();
        transaction.record(
            HistoryAction::Created,
            TransactionStatus::Pending,
            now,
            "transaction created",
            Some(buyer),
        );

        let mut batch = WriteBatch::new();
        batch.put_transaction(transaction.clone());
        self.store.commit(batch).await?;

        tracing::info!(
            transaction = %transaction.id,
            tx_type = %transaction.tx_type,
            buyer = %transaction.buyer_id,
            seller = %transaction.seller_id,
            total = %transaction.total,
            "transaction created"
        );
        self.notifier
            .emit(Notifier::transaction_created(&transaction))
            .await;

        Ok(transaction)
    }

    /// Append to the negotiation thread
    ///
    /// The first message moves a PENDING transaction to NEGOTIATING in the
    /// same commit as the message itself.
    pub async fn post_message(
        &self,
        transaction_id: TransactionId,
        sender_id: UserId,
        body: impl Into<String>,
    ) -> Result<Message> {
        let body = body.into();
        if body.trim().is_empty() {
            return Err(CoreError::InvalidInput("message body is empty".into()));
        }

        let _lock = self.lock(transaction_id).await?;
        let mut transaction = self.load(&transaction_id).await?;
        if transaction.status.is_terminal() {
            return Err(CoreError::InvalidState(format!(
                "transaction {} is {}",
                transaction.id, transaction.status
            )));
        }
        if !transaction.is_party(&sender_id) {
            return Err(CoreError::Forbidden(format!(
                "{sender_id} is not a party to transaction {transaction_id}"
            )));
        }

        let now = self.clock.now();
        let message = Message {
            id: MessageId::new(),
            transaction_id,
            sender_id: sender_id.clone(),
            body,
            created_at: now,
        };

        if transaction.status == TransactionStatus::Pending {
            transaction.record(
                HistoryAction::NegotiationStarted,
                TransactionStatus::Negotiating,
                now,
                "negotiation started",
                Some(sender_id),
            );
        } else {
            transaction.updated_at = now;
        }

        let mut batch = WriteBatch::new();
        batch
            .append_message(message.clone())
            .put_transaction(transaction);
        self.store.commit(batch).await?;

        tracing::debug!(transaction = %transaction_id, sender = %message.sender_id, "message posted");
        Ok(message)
    }

    /// Explicit status change by a party or an admin
    pub async fn update_status(
        &self,
        transaction_id: TransactionId,
        new_status: TransactionStatus,
        actor_id: UserId,
        notes: &str,
    ) -> Result<Transaction> {
        let _lock = self.lock(transaction_id).await?;
        let mut transaction = self.load(&transaction_id).await?;

        if !transaction.is_party(&actor_id) && !self.admins.is_admin(&actor_id).await {
            return Err(CoreError::Forbidden(format!(
                "{actor_id} may not change transaction {transaction_id}"
            )));
        }
        if !transaction.status.can_transition_to(new_status) {
            return Err(CoreError::InvalidTransition {
                from: transaction.status.to_string(),
                to: new_status.to_string(),
            });
        }
        if new_status == TransactionStatus::Agreed && self.settings.require_both_parties_to_agree {
            self.ensure_both_parties_posted(&transaction).await?;
        }
        if new_status.is_terminal() {
            if let Some(escrow) = self.open_escrow(&transaction).await? {
                return Err(CoreError::InvalidState(format!(
                    "transaction {transaction_id} is held by escrow {} in status {}; \
                     it closes when the escrow settles",
                    escrow.id, escrow.status
                )));
            }
        }

        let from = transaction.status;
        let description = if notes.trim().is_empty() {
            format!("status changed from {from} to {new_status}")
        } else {
            notes.to_string()
        };
        transaction.record(
            HistoryAction::StatusChanged,
            new_status,
            self.clock.now(),
            description,
            Some(actor_id.clone()),
        );

        let mut batch = WriteBatch::new();
        batch.put_transaction(transaction.clone());
        self.store.commit(batch).await?;

        tracing::info!(
            transaction = %transaction_id,
            %from,
            to = %new_status,
            actor = %actor_id,
            "transaction status updated"
        );
        Ok(transaction)
    }

    /// Transactions where `user_id` is buyer or seller, newest first
    pub async fn list_for_user(
        &self,
        user_id: &UserId,
        tx_type: Option<TransactionType>,
    ) -> Result<Vec<Transaction>> {
        let mut transactions: Vec<_> = self
            .store
            .transactions()
            .await?
            .into_iter()
            .filter(|t| t.is_party(user_id) && tx_type.map_or(true, |ty| t.tx_type == ty))
            .collect();
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(transactions)
    }

    pub async fn list_all(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        let mut transactions: Vec<_> = self
            .store
            .transactions()
            .await?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(transactions)
    }

    pub async fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Transaction> {
        self.load(transaction_id).await
    }

    /// Negotiation thread ordered by `created_at`, then insertion order
    pub async fn messages(&self, transaction_id: &TransactionId) -> Result<Vec<Message>> {
        self.load(transaction_id).await?;
        let mut messages = self.store.messages(transaction_id).await?;
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    pub async fn stats(&self) -> Result<TransactionStats> {
        let mut stats = TransactionStats::default();
        for transaction in self.store.transactions().await? {
            stats.total += 1;
            *stats.by_status.entry(transaction.status).or_default() += 1;
            *stats.by_type.entry(transaction.tx_type).or_default() += 1;
            stats.total_value += transaction.total;
        }
        Ok(stats)
    }

    /// Cancel PENDING transactions that outlived the negotiation timeout
    ///
    /// Each candidate is re-checked under its lock; one failure is logged and
    /// does not stop the pass. A transaction whose escrow is still open is
    /// left for the escrow to settle.
    pub async fn expire_stale_transactions(&self) -> Result<Vec<TransactionId>> {
        let timeout = Duration::days(i64::from(self.settings.negotiation_timeout_days));
        let now = self.clock.now();
        let candidates: Vec<_> = self
            .store
            .transactions()
            .await?
            .into_iter()
            .filter(|t| t.status == TransactionStatus::Pending && now >= t.created_at + timeout)
            .map(|t| t.id)
            .collect();

        let mut expired = Vec::new();
        for id in candidates {
            match self.expire_one(id, timeout).await {
                Ok(true) => expired.push(id),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(transaction = %id, error = %e, "failed to expire transaction")
                }
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired stale transactions");
        }
        Ok(expired)
    }

    async fn expire_one(&self, id: TransactionId, timeout: Duration) -> Result<bool> {
        let _lock = self.lock(id).await?;
        let mut transaction = self.load(&id).await?;
        let now = self.clock.now();
        if transaction.status != TransactionStatus::Pending || now < transaction.created_at + timeout
        {
            return Ok(false);
        }
        if let Some(escrow) = self.open_escrow(&transaction).await? {
            tracing::debug!(
                transaction = %id,
                escrow = %escrow.id,
                status = %escrow.status,
                "stale transaction held by open escrow, not expiring"
            );
            return Ok(false);
        }
        transaction.record(
            HistoryAction::Expired,
            TransactionStatus::Cancelled,
            now,
            "negotiation timeout expired",
            None,
        );
        let mut batch = WriteBatch::new();
        batch.put_transaction(transaction);
        self.store.commit(batch).await?;
        Ok(true)
    }

    /// The linked escrow, when it has not reached a terminal state
    ///
    /// Read without the escrow lock: terminal escrow states never change, so
    /// a stale read can only report an escrow as open.
    async fn open_escrow(&self, transaction: &Transaction) -> Result<Option<EscrowTransaction>> {
        let Some(escrow_id) = transaction.escrow_id else {
            return Ok(None);
        };
        Ok(self
            .store
            .escrow(&escrow_id)
            .await?
            .filter(|escrow| !escrow.status.is_terminal()))
    }

    async fn ensure_both_parties_posted(&self, transaction: &Transaction) -> Result<()> {
        let messages = self.store.messages(&transaction.id).await?;
        let buyer_posted = messages.iter().any(|m| m.sender_id == transaction.buyer_id);
        let seller_posted = messages.iter().any(|m| m.sender_id == transaction.seller_id);
        if buyer_posted && seller_posted {
            Ok(())
        } else {
            Err(CoreError::InvalidState(format!(
                "both parties must post in transaction {} before agreeing",
                transaction.id
            )))
        }
    }

    async fn lock(&self, id: TransactionId) -> Result<RecordLock> {
        store::acquire(self.store.as_ref(), RecordKey::Transaction(id), &self.runtime).await
    }

    async fn load(&self, id: &TransactionId) -> Result<Transaction> {
        self.store
            .transaction(id)
            .await?
            .ok_or_else(|| CoreError::not_found("transaction", id))
    }
}

fn validate_new(new: &NewTransaction) -> Result<()> {
    if new.buyer_id == new.seller_id {
        return Err(CoreError::InvalidInput(
            "buyer and seller must be different parties".into(),
        ));
    }
    if new.item_id.trim().is_empty() {
        return Err(CoreError::InvalidInput("item id is required".into()));
    }
    if new.tx_type == TransactionType::Product && new.items.is_empty() {
        return Err(CoreError::InvalidInput(
            "product transactions need at least one line item".into(),
        ));
    }
    if let Some(item) = new
        .items
        .iter()
        .find(|i| i.quantity < Decimal::ZERO || i.unit_price < Decimal::ZERO)
    {
        return Err(CoreError::InvalidInput(format!(
            "line item {} has a negative quantity or price",
            item.reference_id
        )));
    }
    if new
        .shipping
        .as_ref()
        .is_some_and(|s| s.cost < Decimal::ZERO)
    {
        return Err(CoreError::InvalidInput("shipping cost is negative".into()));
    }
    Ok(())
}

/// Record that `escrow` now guards `transaction`
pub(crate) fn link_escrow(
    transaction: &mut Transaction,
    escrow: &EscrowTransaction,
    now: DateTime<Utc>,
) {
    transaction.escrow_id = Some(escrow.id);
    let status = transaction.status;
    transaction.record(
        HistoryAction::EscrowLinked,
        status,
        now,
        format!("escrow {} created", escrow.id),
        Some(escrow.payer_id.clone()),
    );
}

/// Propagate a terminal escrow state to its transaction
///
/// RELEASED completes the transaction from any open state; REFUNDED and
/// CANCELLED cancel it. Returns false when nothing changed.
pub(crate) fn settle_from_escrow(
    transaction: &mut Transaction,
    escrow: &EscrowTransaction,
    now: DateTime<Utc>,
) -> bool {
    if transaction.status.is_terminal() {
        return false;
    }
    match escrow.status {
        EscrowStatus::Released => transaction.record(
            HistoryAction::EscrowReleased,
            TransactionStatus::Completed,
            now,
            format!("escrow {} released", escrow.id),
            None,
        ),
        EscrowStatus::Refunded | EscrowStatus::Cancelled => transaction.record(
            HistoryAction::EscrowClosed,
            TransactionStatus::Cancelled,
            now,
            format!("escrow {} {}", escrow.id, escrow.status.as_str().to_lowercase()),
            None,
        ),
        _ => return false,
    }
    true
}
