use std::sync::Arc;

use crate::auth::AdminDirectory;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::escrow::EscrowEngine;
use crate::ledger::TransactionLedger;
use crate::notify::Notifier;
use crate::payment::PaymentProcessor;
use crate::scheduler::Sweeper;
use crate::store::Store;

/// External collaborators injected into the engines
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub admins: Arc<dyn AdminDirectory>,
    pub processor: Arc<dyn PaymentProcessor>,
    pub notifier: Notifier,
}

/// Ledger and escrow engine sharing one store
#[derive(Clone)]
pub struct Marketplace {
    pub ledger: Arc<TransactionLedger>,
    pub escrow: Arc<EscrowEngine>,
    config: Config,
}

impl Marketplace {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let ledger = TransactionLedger::new(
            config.ledger.clone(),
            config.runtime.clone(),
            &collaborators,
        );
        let escrow = EscrowEngine::new(
            config.escrow.clone(),
            config.runtime.clone(),
            &collaborators,
        );
        tracing::info!(
            escrow_enabled = config.escrow.enabled,
            fee_percentage = %config.escrow.fee_percentage,
            "marketplace core ready"
        );
        Ok(Self {
            ledger: Arc::new(ledger),
            escrow: Arc::new(escrow),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Background sweeper over this marketplace's engines
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.ledger.clone(),
            self.escrow.clone(),
            self.config.runtime.sweep_interval(),
        )
    }
}
