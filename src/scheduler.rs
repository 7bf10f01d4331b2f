//! Periodic sweeps: auto-release, unfunded escrow expiry, stale negotiations
//!
//! Each pass is idempotent; the engines re-check every candidate under its
//! record lock, so a pass racing a manual action or another pass is safe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::CoreError;
use crate::escrow::EscrowEngine;
use crate::ledger::TransactionLedger;
use crate::models::{EscrowId, TransactionId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub released: Vec<EscrowId>,
    pub expired_escrows: Vec<EscrowId>,
    pub expired_transactions: Vec<TransactionId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty()
            && self.expired_escrows.is_empty()
            && self.expired_transactions.is_empty()
    }
}

pub struct Sweeper {
    ledger: Arc<TransactionLedger>,
    escrow: Arc<EscrowEngine>,
    period: Duration,
}

impl Sweeper {
    pub fn new(ledger: Arc<TransactionLedger>, escrow: Arc<EscrowEngine>, period: Duration) -> Self {
        Self {
            ledger,
            escrow,
            period,
        }
    }

    /// One pass over every sweep; a failing sweep is logged and the rest still run
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        // Escrow sweeps are skipped while the escrow feature is off
        match self.escrow.process_auto_releases().await {
            Ok(ids) => report.released = ids,
            Err(CoreError::EscrowDisabled) => {}
            Err(e) => tracing::error!(error = %e, "auto-release sweep failed"),
        }
        match self.escrow.process_expirations().await {
            Ok(ids) => report.expired_escrows = ids,
            Err(CoreError::EscrowDisabled) => {}
            Err(e) => tracing::error!(error = %e, "escrow expiry sweep failed"),
        }
        match self.ledger.expire_stale_transactions().await {
            Ok(ids) => report.expired_transactions = ids,
            Err(e) => tracing::error!(error = %e, "transaction expiry sweep failed"),
        }

        if !report.is_empty() {
            tracing::info!(
                released = report.released.len(),
                expired_escrows = report.expired_escrows.len(),
                expired_transactions = report.expired_transactions.len(),
                "sweep pass finished"
            );
        }
        report
    }

    /// Run a pass every period until `shutdown` flips to true or its sender drops
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(period = ?self.period, "sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("sweeper stopped");
        })
    }
}
