use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{DisputeId, EscrowId, UserId};
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeStatus {
    Open,
    Resolved,
}

impl fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisputeStatus::Open => f.write_str("OPEN"),
            DisputeStatus::Resolved => f.write_str("RESOLVED"),
        }
    }
}

/// Terminal action an admin applies to the disputed escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionAction {
    Release,
    Refund,
}

impl FromStr for ResolutionAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "release" => Ok(ResolutionAction::Release),
            "refund" => Ok(ResolutionAction::Refund),
            other => Err(CoreError::InvalidInput(format!(
                "unknown resolution action '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub action: ResolutionAction,
    pub reason: String,
}

impl Resolution {
    pub fn new(action: ResolutionAction, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
        }
    }
}

/// Party-raised objection freezing an escrow until an admin rules on it
///
/// Once RESOLVED a dispute never reopens; a new objection needs a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub escrow_id: EscrowId,
    pub initiator_id: UserId,
    pub reason: String,
    pub evidence: Vec<String>,
    pub status: DisputeStatus,
    pub resolution: Option<Resolution>,
    pub resolved_by: Option<UserId>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dispute {
    pub(crate) fn open(
        escrow_id: EscrowId,
        initiator_id: UserId,
        reason: String,
        evidence: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DisputeId::new(),
            escrow_id,
            initiator_id,
            reason,
            evidence,
            status: DisputeStatus::Open,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == DisputeStatus::Open
    }

    pub(crate) fn resolve(
        &mut self,
        resolution: Resolution,
        admin_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.is_open() {
            return Err(CoreError::AlreadyResolved(self.id.to_string()));
        }
        self.status = DisputeStatus::Resolved;
        self.resolution = Some(resolution);
        self.resolved_by = Some(admin_id);
        self.resolved_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}
