use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use super::journal::{Journal, MemoryJournal};
use super::{RecordKey, RecordLock, Store, WriteBatch};
use crate::error::StoreResult;
use crate::models::{
    Dispute, DisputeId, EscrowId, EscrowStatus, EscrowTransaction, Message, Transaction,
    TransactionId,
};

#[derive(Debug, Default)]
struct Tables {
    transactions: HashMap<TransactionId, Transaction>,
    escrows: HashMap<EscrowId, EscrowTransaction>,
    disputes: HashMap<DisputeId, Dispute>,
    messages: HashMap<TransactionId, Vec<Message>>,
}

impl Tables {
    fn apply(&mut self, batch: WriteBatch) {
        for transaction in batch.transactions {
            self.transactions.insert(transaction.id, transaction);
        }
        for escrow in batch.escrows {
            self.escrows.insert(escrow.id, escrow);
        }
        for dispute in batch.disputes {
            self.disputes.insert(dispute.id, dispute);
        }
        for message in batch.messages {
            self.messages
                .entry(message.transaction_id)
                .or_default()
                .push(message);
        }
    }
}

/// In-process store with per-record locks and a write-ahead journal
///
/// Reads take the table read lock, commits take the write lock, so a reader
/// sees either none or all of a batch. Record locks are independent async
/// mutexes: operations on different records never wait on each other.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    locks: parking_lot::Mutex<HashMap<RecordKey, Arc<AsyncMutex<()>>>>,
    journal: Arc<dyn Journal>,
}

impl MemoryStore {
    /// Empty store journaling into memory
    pub fn new() -> Self {
        Self::with_journal(Arc::new(MemoryJournal::new()))
    }

    /// Empty store journaling into `journal`
    ///
    /// Starts with empty state. Use [`MemoryStore::recover`] to restore from
    /// an existing journal.
    pub fn with_journal(journal: Arc<dyn Journal>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            locks: parking_lot::Mutex::new(HashMap::new()),
            journal,
        }
    }

    /// Rebuild state by replaying every batch in `journal`, then keep
    /// appending to it
    pub fn recover(journal: Arc<dyn Journal>) -> StoreResult<Self> {
        let mut tables = Tables::default();
        let batches = journal.replay()?;
        let count = batches.len();
        for batch in batches {
            tables.apply(batch);
        }
        tracing::info!(batches = count, "store recovered from journal");

        Ok(Self {
            tables: RwLock::new(tables),
            locks: parking_lot::Mutex::new(HashMap::new()),
            journal,
        })
    }

    fn lock_for(&self, key: RecordKey) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(key).or_default().clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn lock(&self, key: RecordKey) -> StoreResult<RecordLock> {
        let guard = self.lock_for(key).lock_owned().await;
        Ok(RecordLock::new(key, guard))
    }

    async fn transaction(&self, id: &TransactionId) -> StoreResult<Option<Transaction>> {
        Ok(self.tables.read().await.transactions.get(id).cloned())
    }

    async fn transactions(&self) -> StoreResult<Vec<Transaction>> {
        Ok(self
            .tables
            .read()
            .await
            .transactions
            .values()
            .cloned()
            .collect())
    }

    async fn messages(&self, transaction_id: &TransactionId) -> StoreResult<Vec<Message>> {
        Ok(self
            .tables
            .read()
            .await
            .messages
            .get(transaction_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn escrow(&self, id: &EscrowId) -> StoreResult<Option<EscrowTransaction>> {
        Ok(self.tables.read().await.escrows.get(id).cloned())
    }

    async fn escrows(&self) -> StoreResult<Vec<EscrowTransaction>> {
        Ok(self.tables.read().await.escrows.values().cloned().collect())
    }

    async fn escrows_with_status(
        &self,
        status: EscrowStatus,
    ) -> StoreResult<Vec<EscrowTransaction>> {
        Ok(self
            .tables
            .read()
            .await
            .escrows
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect())
    }

    async fn dispute(&self, id: &DisputeId) -> StoreResult<Option<Dispute>> {
        Ok(self.tables.read().await.disputes.get(id).cloned())
    }

    async fn open_dispute_for(&self, escrow_id: &EscrowId) -> StoreResult<Option<Dispute>> {
        Ok(self
            .tables
            .read()
            .await
            .disputes
            .values()
            .find(|d| &d.escrow_id == escrow_id && d.is_open())
            .cloned())
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tables = self.tables.write().await;
        // Journal first: a failed append leaves the tables untouched
        self.journal.append(&batch)?;
        tables.apply(batch);
        Ok(())
    }
}
