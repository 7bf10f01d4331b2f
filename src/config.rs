//! Runtime configuration
//!
//! A [`Config`] value is injected into the ledger and escrow engine when they
//! are built. Nothing in the crate reads process-wide mutable settings, so
//! two engines with different configurations can run side by side.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::models::EscrowTerms;

/// Escrow policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowSettings {
    /// Global kill-switch; every escrow operation fails while false
    pub enabled: bool,
    pub fee_percentage: Decimal,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub auto_release: bool,
    pub auto_release_days: u32,
    pub dispute_period_days: u32,
    pub expiry_days: u32,
    /// Cancel PENDING escrows once `expires_at` passes
    pub expire_unfunded: bool,
}

impl Default for EscrowSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            fee_percentage: Decimal::new(25, 1),
            min_amount: Decimal::new(1000, 2),
            max_amount: Decimal::new(10_000_000, 2),
            auto_release: true,
            auto_release_days: 7,
            dispute_period_days: 3,
            expiry_days: 30,
            expire_unfunded: true,
        }
    }
}

impl EscrowSettings {
    /// Snapshot frozen onto a new escrow
    pub fn terms(&self) -> EscrowTerms {
        EscrowTerms {
            auto_release: self.auto_release,
            auto_release_days: self.auto_release_days,
            dispute_period_days: self.dispute_period_days,
            fee_percentage: self.fee_percentage,
        }
    }
}

/// Transaction ledger policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub negotiation_timeout_days: u32,
    /// Both buyer and seller must have posted before AGREED is allowed
    pub require_both_parties_to_agree: bool,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            negotiation_timeout_days: 30,
            require_both_parties_to_agree: true,
        }
    }
}

/// Timing knobs for locking, processor calls and the sweep loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub sweep_interval_secs: u64,
    pub processor_timeout_ms: u64,
    pub lock_wait_ms: u64,
    pub lock_attempts: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            processor_timeout_ms: 10_000,
            lock_wait_ms: 2_000,
            lock_attempts: 3,
        }
    }
}

impl RuntimeSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn processor_timeout(&self) -> Duration {
        Duration::from_millis(self.processor_timeout_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub escrow: EscrowSettings,
    pub ledger: LedgerSettings,
    pub runtime: RuntimeSettings,
}

impl Config {
    /// Read `ESCROW_*`, `LEDGER_*` and `RUNTIME_*` variables over the defaults
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Same as [`Config::from_env`] over an explicit variable map
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let mut config = Config::default();
        let escrow = &mut config.escrow;
        set(vars, "ESCROW_ENABLED", &mut escrow.enabled)?;
        set(vars, "ESCROW_FEE_PERCENTAGE", &mut escrow.fee_percentage)?;
        set(vars, "ESCROW_MIN_AMOUNT", &mut escrow.min_amount)?;
        set(vars, "ESCROW_MAX_AMOUNT", &mut escrow.max_amount)?;
        set(vars, "ESCROW_AUTO_RELEASE", &mut escrow.auto_release)?;
        set(vars, "ESCROW_AUTO_RELEASE_DAYS", &mut escrow.auto_release_days)?;
        set(vars, "ESCROW_DISPUTE_PERIOD_DAYS", &mut escrow.dispute_period_days)?;
        set(vars, "ESCROW_EXPIRY_DAYS", &mut escrow.expiry_days)?;
        set(vars, "ESCROW_EXPIRE_UNFUNDED", &mut escrow.expire_unfunded)?;

        let ledger = &mut config.ledger;
        set(vars, "LEDGER_NEGOTIATION_TIMEOUT_DAYS", &mut ledger.negotiation_timeout_days)?;
        set(vars, "LEDGER_REQUIRE_BOTH_PARTIES", &mut ledger.require_both_parties_to_agree)?;

        let runtime = &mut config.runtime;
        set(vars, "RUNTIME_SWEEP_INTERVAL_SECS", &mut runtime.sweep_interval_secs)?;
        set(vars, "RUNTIME_PROCESSOR_TIMEOUT_MS", &mut runtime.processor_timeout_ms)?;
        set(vars, "RUNTIME_LOCK_WAIT_MS", &mut runtime.lock_wait_ms)?;
        set(vars, "RUNTIME_LOCK_ATTEMPTS", &mut runtime.lock_attempts)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let escrow = &self.escrow;
        if escrow.fee_percentage < Decimal::ZERO || escrow.fee_percentage > Decimal::ONE_HUNDRED {
            return Err(invalid("fee_percentage must be within [0, 100]"));
        }
        if escrow.min_amount <= Decimal::ZERO {
            return Err(invalid("min_amount must be positive"));
        }
        if escrow.min_amount > escrow.max_amount {
            return Err(invalid("min_amount must not exceed max_amount"));
        }
        if escrow.auto_release_days == 0 || escrow.expiry_days == 0 {
            return Err(invalid("auto_release_days and expiry_days must be at least 1"));
        }
        if self.ledger.negotiation_timeout_days == 0 {
            return Err(invalid("negotiation_timeout_days must be at least 1"));
        }
        if self.runtime.lock_attempts == 0 {
            return Err(invalid("lock_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Defaults with the escrow feature switched on
    pub fn enabled() -> Self {
        let mut config = Config::default();
        config.escrow.enabled = true;
        config
    }
}

fn invalid(reason: &str) -> CoreError {
    CoreError::InvalidInput(format!("configuration: {reason}"))
}

fn set<T: FromStr>(vars: &HashMap<String, String>, key: &str, slot: &mut T) -> Result<()> {
    if let Some(raw) = vars.get(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| invalid(&format!("{key} has unparsable value '{raw}'")))?;
    }
    Ok(())
}
