pub mod auth;
pub mod clock;
pub mod config;
pub mod dispute;
pub mod error;
pub mod escrow;
pub mod export;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod payment;
pub mod replay;
pub mod scheduler;
pub mod service;
pub mod store;

pub use config::Config;
pub use error::{CoreError, EngineError, Result};
pub use escrow::{EscrowEngine, EscrowStats};
pub use ledger::{TransactionFilter, TransactionLedger, TransactionStats};
pub use replay::replay_commands;
pub use scheduler::{SweepReport, Sweeper};
pub use service::{Collaborators, Marketplace};
