//! Offline replay of escrow commands from CSV
//!
//! Drives a fresh in-memory marketplace with a manual clock, so a command
//! file always produces the same escrow states. Malformed rows and rejected
//! commands are logged and skipped; processing continues with the next row.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::auth::StaticAdmins;
use crate::clock::ManualClock;
use crate::config::Config;
use crate::error::{CoreError, EngineError, Result};
use crate::export;
use crate::models::{EscrowId, PaymentMethod, Resolution, ResolutionAction, UserId};
use crate::notify::{Notifier, TracingSink};
use crate::payment::OfflineProcessor;
use crate::service::{Collaborators, Marketplace};
use crate::store::MemoryStore;

/// Replay clock start, 2024-01-01T00:00:00Z
pub const REPLAY_EPOCH_SECS: i64 = 1_704_067_200;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Command {
    op: String,
    escrow: String,
    actor: String,
    counterparty: String,
    #[serde(deserialize_with = "deserialize_optional_amount")]
    amount: Option<Decimal>,
    currency: String,
    detail: String,
}

/// Empty cells mean "no amount"; non-empty ones must parse exactly
fn deserialize_optional_amount<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Decimal>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    let s = String::deserialize(deserializer)?;
    if s.trim().is_empty() {
        Ok(None)
    } else {
        s.trim().parse::<Decimal>().map(Some).map_err(de::Error::custom)
    }
}

impl Command {
    fn detail_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.detail.is_empty() {
            fallback
        } else {
            &self.detail
        }
    }
}

struct Replay {
    marketplace: Marketplace,
    clock: Arc<ManualClock>,
    labels: BTreeMap<String, EscrowId>,
}

impl Replay {
    fn new(config: Config) -> Result<Self> {
        let clock = Arc::new(ManualClock::new(replay_epoch()));
        let collaborators = Collaborators {
            store: Arc::new(MemoryStore::new()),
            clock: clock.clone(),
            admins: Arc::new(StaticAdmins::from_env_or(&["admin"])),
            processor: Arc::new(OfflineProcessor),
            notifier: Notifier::new(Arc::new(TracingSink)),
        };
        Ok(Self {
            marketplace: Marketplace::new(config, collaborators)?,
            clock,
            labels: BTreeMap::new(),
        })
    }

    fn escrow_id(&self, label: &str) -> Result<EscrowId> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| CoreError::not_found("escrow label", label))
    }

    async fn apply(&mut self, command: &Command) -> Result<()> {
        let engine = self.marketplace.escrow.clone();
        match command.op.to_ascii_lowercase().as_str() {
            "create" => {
                if self.labels.contains_key(&command.escrow) {
                    return Err(CoreError::InvalidInput(format!(
                        "escrow label '{}' is already in use",
                        command.escrow
                    )));
                }
                let amount = command
                    .amount
                    .ok_or_else(|| CoreError::InvalidInput("create needs an amount".into()))?;
                let escrow = engine
                    .create_escrow(
                        None,
                        UserId::new(command.actor.as_str()),
                        UserId::new(command.counterparty.as_str()),
                        amount,
                        command.currency.parse()?,
                    )
                    .await?;
                self.labels.insert(command.escrow.clone(), escrow.id);
            }
            "fund" => {
                let method: PaymentMethod = command.detail_or("pix").parse()?;
                engine.fund_escrow(self.escrow_id(&command.escrow)?, method).await?;
            }
            "release" => {
                let id = self.escrow_id(&command.escrow)?;
                engine.release_escrow(id, command.detail_or("released")).await?;
            }
            "refund" => {
                let id = self.escrow_id(&command.escrow)?;
                engine.refund_escrow(id, command.detail_or("refunded")).await?;
            }
            "cancel" => {
                let id = self.escrow_id(&command.escrow)?;
                engine.cancel_escrow(id, command.detail_or("cancelled")).await?;
            }
            "dispute" => {
                let id = self.escrow_id(&command.escrow)?;
                engine
                    .initiate_dispute(
                        id,
                        UserId::new(command.actor.as_str()),
                        command.detail_or("disputed"),
                        Vec::new(),
                    )
                    .await?;
            }
            "resolve" => {
                let escrow = engine.get_escrow(&self.escrow_id(&command.escrow)?).await?;
                let dispute_id = escrow.dispute_id.ok_or_else(|| {
                    CoreError::InvalidState(format!("escrow '{}' has no dispute", command.escrow))
                })?;
                let action: ResolutionAction = command.detail.parse()?;
                engine
                    .resolve_dispute(
                        dispute_id,
                        Resolution::new(action, "replayed resolution"),
                        UserId::new(command.actor.as_str()),
                    )
                    .await?;
            }
            "advance" => {
                let days = command
                    .amount
                    .ok_or_else(|| CoreError::InvalidInput("advance needs a day count".into()))?;
                let seconds = (days * Decimal::from(86_400))
                    .round()
                    .to_i64()
                    .filter(|s| *s >= 0)
                    .ok_or_else(|| {
                        CoreError::InvalidInput(format!("cannot advance clock by {days} days"))
                    })?;
                self.clock.advance(Duration::seconds(seconds));
            }
            "sweep" => {
                self.marketplace.sweeper().run_once().await;
            }
            other => {
                return Err(CoreError::InvalidInput(format!("unknown op '{other}'")));
            }
        }
        Ok(())
    }
}

fn replay_epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(REPLAY_EPOCH_SECS, 0)
        .single()
        .unwrap_or_default()
}

/// Replay commands from `reader` and write the final escrows to `writer`
pub async fn replay_commands<R: Read, W: Write>(
    reader: R,
    writer: W,
    config: Config,
) -> std::result::Result<(), EngineError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut replay = Replay::new(config)?;

    for (index, record) in csv_reader.deserialize::<Command>().enumerate() {
        let row = index + 1;
        let command = match record {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(row, error = %e, "skipping malformed row");
                continue;
            }
        };
        if let Err(e) = replay.apply(&command).await {
            tracing::warn!(
                row,
                op = %command.op,
                escrow = %command.escrow,
                error = %e,
                "command rejected"
            );
        }
    }

    let mut escrows = Vec::with_capacity(replay.labels.len());
    for (label, id) in &replay.labels {
        escrows.push((label.clone(), replay.marketplace.escrow.get_escrow(id).await?));
    }
    export::write_escrows(writer, &escrows)?;
    Ok(())
}
