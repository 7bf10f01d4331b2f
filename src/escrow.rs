//! Escrow engine
//!
//! Custody state machine for escrows linked to marketplace transactions:
//!
//! ```text
//! PENDING --fund--> FUNDED --release--> RELEASED
//!    |                 |----refund---> REFUNDED
//!    |                 |----cancel---> CANCELLED (refund recorded first)
//!    |----cancel-----> CANCELLED
//!    '----dispute----> DISPUTED <--dispute-- FUNDED
//!                         '--resolve--> RELEASED | REFUNDED
//! ```
//!
//! Every mutation follows the store's locking protocol: lock every record it
//! touches, re-read, validate and stage the batch, call the processor, then
//! commit. Once the processor has moved money only the commit can fail.
//! Dispute operations live in [`crate::dispute`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::auth::AdminDirectory;
use crate::clock::Clock;
use crate::config::{EscrowSettings, RuntimeSettings};
use crate::error::{CoreError, Result};
use crate::ledger;
use crate::models::{
    Currency, EscrowId, EscrowStatus, EscrowTransaction, PaymentMethod, Transaction,
    TransactionId, UserId,
};
use crate::notify::Notifier;
use crate::payment::{self, PaymentProcessor, PaymentReceipt, PaymentRequest};
use crate::service::Collaborators;
use crate::store::{self, RecordKey, RecordLock, Store, WriteBatch};

pub const AUTO_RELEASE_REASON: &str = "auto-release by policy";
pub const EXPIRY_REASON: &str = "expired before funding";
const CANCEL_REFUND_REASON: &str = "cancellation - automatic refund";
const DEFAULT_DESCRIPTION: &str = "Marketplace escrow";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EscrowStats {
    pub total: usize,
    pub pending: usize,
    pub funded: usize,
    pub disputed: usize,
    pub released: usize,
    pub refunded: usize,
    pub cancelled: usize,
    pub total_amount: Decimal,
    pub total_fees: Decimal,
}

/// Linked transaction locked and read before any money moves
pub(crate) struct LinkedTransaction {
    _lock: Option<RecordLock>,
    transaction: Option<Transaction>,
}

impl LinkedTransaction {
    /// Stage the transaction's closing update for `escrow`'s new state
    pub(crate) fn stage(
        &mut self,
        escrow: &EscrowTransaction,
        batch: &mut WriteBatch,
        now: DateTime<Utc>,
    ) {
        if let Some(mut transaction) = self.transaction.take() {
            if ledger::settle_from_escrow(&mut transaction, escrow, now) {
                batch.put_transaction(transaction);
            }
        }
    }
}

pub struct EscrowEngine {
    pub(crate) settings: EscrowSettings,
    pub(crate) runtime: RuntimeSettings,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) processor: Arc<dyn PaymentProcessor>,
    pub(crate) admins: Arc<dyn AdminDirectory>,
    pub(crate) notifier: Notifier,
}

impl EscrowEngine {
    pub fn new(
        settings: EscrowSettings,
        runtime: RuntimeSettings,
        collaborators: &Collaborators,
    ) -> Self {
        Self {
            settings,
            runtime,
            store: collaborators.store.clone(),
            clock: collaborators.clock.clone(),
            processor: collaborators.processor.clone(),
            admins: collaborators.admins.clone(),
            notifier: collaborators.notifier.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Open a PENDING escrow, freezing fee, total and terms
    ///
    /// When `transaction_id` is given, payer and payee must be that
    /// transaction's buyer and seller, and the link is recorded on the
    /// transaction in the same commit.
    pub async fn create_escrow(
        &self,
        transaction_id: Option<TransactionId>,
        payer_id: UserId,
        payee_id: UserId,
        amount: Decimal,
        currency: Currency,
    ) -> Result<EscrowTransaction> {
        self.ensure_enabled()?;
        if payer_id == payee_id {
            return Err(CoreError::InvalidInput(
                "payer and payee must be different parties".into(),
            ));
        }
        if amount < self.settings.min_amount || amount > self.settings.max_amount {
            return Err(CoreError::AmountOutOfRange {
                amount,
                min: self.settings.min_amount,
                max: self.settings.max_amount,
            });
        }

        let now = self.clock.now();
        let escrow = EscrowTransaction::open(
            transaction_id,
            payer_id,
            payee_id,
            amount,
            currency,
            DEFAULT_DESCRIPTION.to_string(),
            self.settings.terms(),
            now,
            self.settings.expiry_days,
        );

        let mut batch = WriteBatch::new();
        batch.put_escrow(escrow.clone());

        let _transaction_lock = match transaction_id {
            Some(id) => {
                let lock = self.lock(RecordKey::Transaction(id)).await?;
                let mut transaction = self
                    .store
                    .transaction(&id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("transaction", id))?;
                if transaction.status.is_terminal() {
                    return Err(CoreError::InvalidState(format!(
                        "transaction {id} is {}",
                        transaction.status
                    )));
                }
                if let Some(existing) = transaction.escrow_id {
                    return Err(CoreError::InvalidState(format!(
                        "transaction {id} already has escrow {existing}"
                    )));
                }
                if transaction.buyer_id != escrow.payer_id || transaction.seller_id != escrow.payee_id
                {
                    return Err(CoreError::InvalidInput(format!(
                        "escrow parties do not match buyer and seller of transaction {id}"
                    )));
                }
                ledger::link_escrow(&mut transaction, &escrow, now);
                batch.put_transaction(transaction);
                Some(lock)
            }
            None => None,
        };

        self.store.commit(batch).await?;

        tracing::info!(
            escrow = %escrow.id,
            transaction = ?escrow.transaction_id,
            amount = %escrow.amount,
            fee = %escrow.fee,
            total = %escrow.total_amount,
            currency = %escrow.currency,
            "escrow created"
        );
        Ok(escrow)
    }

    /// Collect the payer's deposit and move PENDING -> FUNDED
    ///
    /// A processor failure or timeout returns `PaymentFailed` and leaves the
    /// escrow PENDING.
    pub async fn fund_escrow(
        &self,
        escrow_id: EscrowId,
        payment_method: PaymentMethod,
    ) -> Result<EscrowTransaction> {
        self.ensure_enabled()?;
        let _lock = self.lock(RecordKey::Escrow(escrow_id)).await?;
        let mut escrow = self.load_escrow(&escrow_id).await?;
        escrow.require_status(&[EscrowStatus::Pending], "fund")?;

        let request = PaymentRequest {
            escrow_id,
            counterparty: escrow.payer_id.clone(),
            amount: escrow.total_amount,
            currency: escrow.currency,
            method: Some(payment_method),
        };
        let receipt = self
            .call("collect", escrow_id, self.processor.collect(&request))
            .await?;

        escrow.fund(payment_method, receipt.reference.clone(), self.clock.now())?;
        let mut batch = WriteBatch::new();
        batch.put_escrow(escrow.clone());
        self.commit_after_payment(batch, &escrow, &receipt).await?;

        tracing::info!(
            escrow = %escrow_id,
            method = ?payment_method,
            auto_release_at = ?escrow.auto_release_at,
            "escrow funded"
        );
        self.notifier.emit(Notifier::escrow_funded(&escrow)).await;
        Ok(escrow)
    }

    /// Pay the principal to the payee, FUNDED -> RELEASED
    pub async fn release_escrow(&self, escrow_id: EscrowId, reason: &str) -> Result<EscrowTransaction> {
        self.ensure_enabled()?;
        self.release_inner(escrow_id, reason, None).await
    }

    /// Return the deposit to the payer, FUNDED -> REFUNDED
    pub async fn refund_escrow(&self, escrow_id: EscrowId, reason: &str) -> Result<EscrowTransaction> {
        self.ensure_enabled()?;
        let _lock = self.lock(RecordKey::Escrow(escrow_id)).await?;
        let mut escrow = self.load_escrow(&escrow_id).await?;
        escrow.require_status(&[EscrowStatus::Funded], "refund")?;
        let mut linked = self.lock_linked(&escrow).await?;

        let now = self.clock.now();
        escrow.refund(reason, now)?;
        let mut batch = WriteBatch::new();
        batch.put_escrow(escrow.clone());
        linked.stage(&escrow, &mut batch, now);

        let receipt = self.refund_payment(&escrow).await?;
        self.commit_after_payment(batch, &escrow, &receipt).await?;

        tracing::info!(escrow = %escrow_id, reason, "escrow refunded");
        self.notifier.emit(Notifier::escrow_refunded(&escrow)).await;
        Ok(escrow)
    }

    /// Cancel a PENDING or FUNDED escrow
    ///
    /// A FUNDED escrow is refunded first; the refund and the cancellation are
    /// committed together, so CANCELLED is never observable without
    /// `refunded_at`.
    pub async fn cancel_escrow(&self, escrow_id: EscrowId, reason: &str) -> Result<EscrowTransaction> {
        self.ensure_enabled()?;
        self.cancel_inner(escrow_id, reason, None).await
    }

    pub async fn get_escrow(&self, escrow_id: &EscrowId) -> Result<EscrowTransaction> {
        self.ensure_enabled()?;
        self.load_escrow(escrow_id).await
    }

    /// Escrows where `user_id` is payer or payee, newest first
    pub async fn list_for_user(
        &self,
        user_id: &UserId,
        status: Option<EscrowStatus>,
    ) -> Result<Vec<EscrowTransaction>> {
        self.ensure_enabled()?;
        let mut escrows: Vec<_> = self
            .store
            .escrows()
            .await?
            .into_iter()
            .filter(|e| e.is_party(user_id) && status.map_or(true, |s| e.status == s))
            .collect();
        escrows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(escrows)
    }

    pub async fn stats(&self) -> Result<EscrowStats> {
        self.ensure_enabled()?;
        let mut stats = EscrowStats::default();
        for escrow in self.store.escrows().await? {
            stats.total += 1;
            match escrow.status {
                EscrowStatus::Pending => stats.pending += 1,
                EscrowStatus::Funded => stats.funded += 1,
                EscrowStatus::Disputed => stats.disputed += 1,
                EscrowStatus::Released => stats.released += 1,
                EscrowStatus::Refunded => stats.refunded += 1,
                EscrowStatus::Cancelled => stats.cancelled += 1,
            }
            stats.total_amount += escrow.amount;
            stats.total_fees += escrow.fee;
        }
        Ok(stats)
    }

    /// Release every FUNDED escrow whose auto-release instant has passed
    ///
    /// Safe to run concurrently with manual actions and with other sweeps:
    /// each release re-checks status and due time under the record lock, so
    /// an escrow already released (or refunded, or disputed) is skipped.
    /// Returns the escrows this pass released.
    pub async fn process_auto_releases(&self) -> Result<Vec<EscrowId>> {
        self.ensure_enabled()?;
        let now = self.clock.now();
        let due: Vec<_> = self
            .store
            .escrows_with_status(EscrowStatus::Funded)
            .await?
            .into_iter()
            .filter(|e| e.can_auto_release(now))
            .map(|e| e.id)
            .collect();

        let attempts = due.iter().map(|&id| async move {
            let outcome = self.release_inner(id, AUTO_RELEASE_REASON, Some(now)).await;
            (id, outcome)
        });
        let released = collect_swept(futures::future::join_all(attempts).await, "auto-release");
        if !released.is_empty() {
            tracing::info!(count = released.len(), "auto-released escrows");
        }
        Ok(released)
    }

    /// Cancel PENDING escrows whose `expires_at` has passed
    ///
    /// A no-op when `expire_unfunded` is off.
    pub async fn process_expirations(&self) -> Result<Vec<EscrowId>> {
        self.ensure_enabled()?;
        if !self.settings.expire_unfunded {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let expired: Vec<_> = self
            .store
            .escrows_with_status(EscrowStatus::Pending)
            .await?
            .into_iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.id)
            .collect();

        let attempts = expired.iter().map(|&id| async move {
            let outcome = self.cancel_inner(id, EXPIRY_REASON, Some(now)).await;
            (id, outcome)
        });
        let cancelled = collect_swept(futures::future::join_all(attempts).await, "expiry");
        if !cancelled.is_empty() {
            tracing::info!(count = cancelled.len(), "cancelled expired escrows");
        }
        Ok(cancelled)
    }

    /// `due` set means a sweep: skip unless still FUNDED and due at that instant
    async fn release_inner(
        &self,
        escrow_id: EscrowId,
        reason: &str,
        due: Option<DateTime<Utc>>,
    ) -> Result<EscrowTransaction> {
        let _lock = self.lock(RecordKey::Escrow(escrow_id)).await?;
        let mut escrow = self.load_escrow(&escrow_id).await?;
        escrow.require_status(&[EscrowStatus::Funded], "release")?;
        if let Some(at) = due {
            if !escrow.can_auto_release(at) {
                return Err(CoreError::InvalidState(format!(
                    "escrow {escrow_id} is not due for auto-release"
                )));
            }
        }

        let mut linked = self.lock_linked(&escrow).await?;

        let now = self.clock.now();
        escrow.release(reason, now)?;
        let mut batch = WriteBatch::new();
        batch.put_escrow(escrow.clone());
        linked.stage(&escrow, &mut batch, now);

        let receipt = self.payout_payment(&escrow).await?;
        self.commit_after_payment(batch, &escrow, &receipt).await?;

        tracing::info!(escrow = %escrow_id, reason, "escrow released");
        self.notifier.emit(Notifier::escrow_released(&escrow)).await;
        Ok(escrow)
    }

    /// `expired_at` set means a sweep: skip unless still PENDING and expired
    async fn cancel_inner(
        &self,
        escrow_id: EscrowId,
        reason: &str,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<EscrowTransaction> {
        let _lock = self.lock(RecordKey::Escrow(escrow_id)).await?;
        let mut escrow = self.load_escrow(&escrow_id).await?;
        escrow.require_status(&[EscrowStatus::Pending, EscrowStatus::Funded], "cancel")?;
        if let Some(at) = expired_at {
            if !escrow.is_expired(at) {
                return Err(CoreError::InvalidState(format!(
                    "escrow {escrow_id} has not expired"
                )));
            }
        }

        let mut linked = self.lock_linked(&escrow).await?;

        let was_funded = escrow.status == EscrowStatus::Funded;
        let now = self.clock.now();
        if was_funded {
            escrow.refund_and_cancel(CANCEL_REFUND_REASON, reason, now)?;
        } else {
            escrow.cancel(reason, now)?;
        }
        let mut batch = WriteBatch::new();
        batch.put_escrow(escrow.clone());
        linked.stage(&escrow, &mut batch, now);

        if was_funded {
            let receipt = self.refund_payment(&escrow).await?;
            self.commit_after_payment(batch, &escrow, &receipt).await?;
        } else {
            self.store.commit(batch).await?;
        }

        tracing::info!(escrow = %escrow_id, reason, refunded = was_funded, "escrow cancelled");
        if was_funded {
            self.notifier.emit(Notifier::escrow_refunded(&escrow)).await;
        }
        Ok(escrow)
    }

    pub(crate) fn ensure_enabled(&self) -> Result<()> {
        if self.settings.enabled {
            Ok(())
        } else {
            Err(CoreError::EscrowDisabled)
        }
    }

    pub(crate) async fn lock(&self, key: RecordKey) -> Result<RecordLock> {
        store::acquire(self.store.as_ref(), key, &self.runtime).await
    }

    pub(crate) async fn load_escrow(&self, escrow_id: &EscrowId) -> Result<EscrowTransaction> {
        self.store
            .escrow(escrow_id)
            .await?
            .ok_or_else(|| CoreError::not_found("escrow", escrow_id))
    }

    pub(crate) async fn call<F>(
        &self,
        operation: &'static str,
        escrow_id: EscrowId,
        call: F,
    ) -> Result<PaymentReceipt>
    where
        F: std::future::Future<Output = payment::ProcessorResult>,
    {
        payment::call_processor(operation, escrow_id, self.runtime.processor_timeout(), call).await
    }

    pub(crate) async fn payout_payment(&self, escrow: &EscrowTransaction) -> Result<PaymentReceipt> {
        let request = PaymentRequest {
            escrow_id: escrow.id,
            counterparty: escrow.payee_id.clone(),
            amount: escrow.amount,
            currency: escrow.currency,
            method: escrow.payment_method,
        };
        self.call("payout", escrow.id, self.processor.payout(&request))
            .await
    }

    pub(crate) async fn refund_payment(&self, escrow: &EscrowTransaction) -> Result<PaymentReceipt> {
        let request = PaymentRequest {
            escrow_id: escrow.id,
            counterparty: escrow.payer_id.clone(),
            amount: escrow.total_amount,
            currency: escrow.currency,
            method: escrow.payment_method,
        };
        self.call("refund", escrow.id, self.processor.refund(&request))
            .await
    }

    /// Lock and read the escrow's linked transaction
    ///
    /// Taken last in the lock order and before any processor call; the
    /// caller holds the result until its batch is committed.
    pub(crate) async fn lock_linked(
        &self,
        escrow: &EscrowTransaction,
    ) -> Result<LinkedTransaction> {
        let Some(transaction_id) = escrow.transaction_id else {
            return Ok(LinkedTransaction {
                _lock: None,
                transaction: None,
            });
        };
        let lock = self.lock(RecordKey::Transaction(transaction_id)).await?;
        let transaction = self.store.transaction(&transaction_id).await?;
        if transaction.is_none() {
            tracing::warn!(
                escrow = %escrow.id,
                transaction = %transaction_id,
                "linked transaction missing, nothing to settle"
            );
        }
        Ok(LinkedTransaction {
            _lock: Some(lock),
            transaction,
        })
    }

    /// Commit a batch whose money movement already happened
    ///
    /// A failure here means the processor moved funds that the store does
    /// not reflect; it is logged with the receipt for reconciliation.
    pub(crate) async fn commit_after_payment(
        &self,
        batch: WriteBatch,
        escrow: &EscrowTransaction,
        receipt: &PaymentReceipt,
    ) -> Result<()> {
        if let Err(e) = self.store.commit(batch).await {
            tracing::error!(
                escrow = %escrow.id,
                reference = %receipt.reference,
                error = %e,
                "payment confirmed but state commit failed; needs reconciliation"
            );
            return Err(e.into());
        }
        Ok(())
    }
}

/// Keep the ids that succeeded; lost races are expected, other errors logged
fn collect_swept(
    outcomes: Vec<(EscrowId, Result<EscrowTransaction>)>,
    sweep: &'static str,
) -> Vec<EscrowId> {
    outcomes
        .into_iter()
        .filter_map(|(id, outcome)| match outcome {
            Ok(_) => Some(id),
            Err(CoreError::InvalidState(reason)) => {
                tracing::debug!(escrow = %id, sweep, %reason, "skipped by sweep");
                None
            }
            Err(e) => {
                tracing::warn!(escrow = %id, sweep, error = %e, "sweep failed for escrow");
                None
            }
        })
        .collect()
}
