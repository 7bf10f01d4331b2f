//! Storage seam for the ledger and escrow engine
//!
//! Engines depend only on the [`Store`] trait: point reads, scans, a
//! per-record lock, and an atomic [`WriteBatch`] commit. Any engine (a SQL
//! database with row locks, a KV store with leases) can sit behind it; the
//! crate ships [`memory::MemoryStore`] with a write-ahead [`journal`].
//!
//! # Locking protocol
//!
//! 1. Acquire the [`RecordLock`] for every record the operation mutates, in
//!    the fixed order escrow, dispute, transaction.
//! 2. Re-read the records *after* acquiring and validate preconditions.
//! 3. Stage all changes into one [`WriteBatch`] and [`Store::commit`] it.
//! 4. Drop the locks.

pub mod journal;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::config::RuntimeSettings;
use crate::error::{CoreError, Result, StoreResult};
use crate::models::{
    Dispute, DisputeId, EscrowId, EscrowStatus, EscrowTransaction, Message, Transaction,
    TransactionId,
};

pub use journal::{FileJournal, Journal, MemoryJournal};
pub use memory::MemoryStore;

/// Unit of mutual exclusion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Transaction(TransactionId),
    Escrow(EscrowId),
    Dispute(DisputeId),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Transaction(id) => write!(f, "transaction/{id}"),
            RecordKey::Escrow(id) => write!(f, "escrow/{id}"),
            RecordKey::Dispute(id) => write!(f, "dispute/{id}"),
        }
    }
}

/// Exclusive hold on one record, released on drop
#[derive(Debug)]
pub struct RecordLock {
    key: RecordKey,
    _guard: OwnedMutexGuard<()>,
}

impl RecordLock {
    pub fn new(key: RecordKey, guard: OwnedMutexGuard<()>) -> Self {
        Self { key, _guard: guard }
    }

    pub fn key(&self) -> RecordKey {
        self.key
    }
}

/// Set of record writes applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub transactions: Vec<Transaction>,
    pub escrows: Vec<EscrowTransaction>,
    pub disputes: Vec<Dispute>,
    pub messages: Vec<Message>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_transaction(&mut self, transaction: Transaction) -> &mut Self {
        self.transactions.push(transaction);
        self
    }

    pub fn put_escrow(&mut self, escrow: EscrowTransaction) -> &mut Self {
        self.escrows.push(escrow);
        self
    }

    pub fn put_dispute(&mut self, dispute: Dispute) -> &mut Self {
        self.disputes.push(dispute);
        self
    }

    pub fn append_message(&mut self, message: Message) -> &mut Self {
        self.messages.push(message);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
            && self.escrows.is_empty()
            && self.disputes.is_empty()
            && self.messages.is_empty()
    }
}

/// Repository interface consumed by the engines
#[async_trait]
pub trait Store: Send + Sync {
    /// Wait for exclusive access to `key`
    async fn lock(&self, key: RecordKey) -> StoreResult<RecordLock>;

    async fn transaction(&self, id: &TransactionId) -> StoreResult<Option<Transaction>>;

    async fn transactions(&self) -> StoreResult<Vec<Transaction>>;

    /// Negotiation thread of a transaction in insertion order
    async fn messages(&self, transaction_id: &TransactionId) -> StoreResult<Vec<Message>>;

    async fn escrow(&self, id: &EscrowId) -> StoreResult<Option<EscrowTransaction>>;

    async fn escrows(&self) -> StoreResult<Vec<EscrowTransaction>>;

    async fn escrows_with_status(&self, status: EscrowStatus)
        -> StoreResult<Vec<EscrowTransaction>>;

    async fn dispute(&self, id: &DisputeId) -> StoreResult<Option<Dispute>>;

    async fn open_dispute_for(&self, escrow_id: &EscrowId) -> StoreResult<Option<Dispute>>;

    /// Apply every write in `batch` atomically
    async fn commit(&self, batch: WriteBatch) -> StoreResult<()>;
}

/// Acquire a record lock with bounded waiting
///
/// Each attempt waits at most `lock_wait`; after `lock_attempts` failed
/// attempts the caller gets `Conflict` and may retry later. The caller must
/// re-validate its preconditions once the lock is held.
pub(crate) async fn acquire(
    store: &dyn Store,
    key: RecordKey,
    runtime: &RuntimeSettings,
) -> Result<RecordLock> {
    for attempt in 1..=runtime.lock_attempts {
        match tokio::time::timeout(runtime.lock_wait(), store.lock(key)).await {
            Ok(lock) => return Ok(lock?),
            Err(_) => {
                tracing::warn!(
                    record = %key,
                    attempt,
                    max_attempts = runtime.lock_attempts,
                    "timed out waiting for record lock"
                );
            }
        }
    }
    Err(CoreError::Conflict(key.to_string()))
}
