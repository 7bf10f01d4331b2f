use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use super::ids::{DisputeId, EscrowId, TransactionId, UserId};
use crate::error::{CoreError, Result};

/// Display currency; no conversion ever happens between them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    Brl,
    Usd,
    Eur,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Brl => "BRL",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Currency::Brl => "R$",
            Currency::Usd => "$",
            Currency::Eur => "€",
        }
    }

    /// Render an amount for notification text, e.g. `R$ 1025.00`
    pub fn format(&self, amount: Decimal) -> String {
        format!("{} {:.2}", self.symbol(), amount)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "BRL" => Ok(Currency::Brl),
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            other => Err(CoreError::InvalidInput(format!(
                "unsupported currency '{other}'"
            ))),
        }
    }
}

/// Custody state of an escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    Pending,
    Funded,
    Disputed,
    Released,
    Refunded,
    Cancelled,
}

impl EscrowStatus {
    pub const ALL: [EscrowStatus; 6] = [
        EscrowStatus::Pending,
        EscrowStatus::Funded,
        EscrowStatus::Disputed,
        EscrowStatus::Released,
        EscrowStatus::Refunded,
        EscrowStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "PENDING",
            EscrowStatus::Funded => "FUNDED",
            EscrowStatus::Disputed => "DISPUTED",
            EscrowStatus::Released => "RELEASED",
            EscrowStatus::Refunded => "REFUNDED",
            EscrowStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EscrowStatus::Released | EscrowStatus::Refunded | EscrowStatus::Cancelled
        )
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentMethod {
    Pix,
    Boleto,
    Card,
    Transfer,
    Crypto,
}

impl FromStr for PaymentMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pix" => Ok(PaymentMethod::Pix),
            "boleto" => Ok(PaymentMethod::Boleto),
            "card" | "cartao" | "cartão" => Ok(PaymentMethod::Card),
            "transfer" | "transferencia" | "transferência" => Ok(PaymentMethod::Transfer),
            "crypto" | "cripto" => Ok(PaymentMethod::Crypto),
            other => Err(CoreError::InvalidInput(format!(
                "unsupported payment method '{other}'"
            ))),
        }
    }
}

/// Policy values frozen onto an escrow when it is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowTerms {
    pub auto_release: bool,
    pub auto_release_days: u32,
    pub dispute_period_days: u32,
    pub fee_percentage: Decimal,
}

/// `amount × percentage / 100`, rounded half-up at the cent
pub fn calculate_fee(amount: Decimal, fee_percentage: Decimal) -> Decimal {
    let mut fee = (amount * fee_percentage / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    fee.rescale(2);
    fee
}

/// Monetary custody record
///
/// `fee` and `total_amount` are computed once in [`EscrowTransaction::open`]
/// and never written again. Every `*_at` settlement timestamp is written at
/// most once, by the transition that causes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowTransaction {
    pub id: EscrowId,
    pub transaction_id: Option<TransactionId>,
    pub payer_id: UserId,
    pub payee_id: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    pub fee: Decimal,
    pub total_amount: Decimal,
    pub status: EscrowStatus,
    pub description: String,
    pub terms: EscrowTerms,
    pub payment_method: Option<PaymentMethod>,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub auto_release_at: Option<DateTime<Utc>>,
    pub funded_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub dispute_id: Option<DisputeId>,
    pub release_reason: Option<String>,
    pub refund_reason: Option<String>,
    pub cancel_reason: Option<String>,
}

/// Write a settlement timestamp, refusing to overwrite
fn set_once(slot: &mut Option<DateTime<Utc>>, field: &str, at: DateTime<Utc>) -> Result<()> {
    if slot.is_some() {
        return Err(CoreError::InvalidState(format!("{field} is already set")));
    }
    *slot = Some(at);
    Ok(())
}

impl EscrowTransaction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn open(
        transaction_id: Option<TransactionId>,
        payer_id: UserId,
        payee_id: UserId,
        amount: Decimal,
        currency: Currency,
        description: String,
        terms: EscrowTerms,
        now: DateTime<Utc>,
        expiry_days: u32,
    ) -> Self {
        let fee = calculate_fee(amount, terms.fee_percentage);
        Self {
            id: EscrowId::new(),
            transaction_id,
            payer_id,
            payee_id,
            amount,
            currency,
            fee,
            total_amount: amount + fee,
            status: EscrowStatus::Pending,
            description,
            terms,
            payment_method: None,
            payment_reference: None,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::days(i64::from(expiry_days)),
            auto_release_at: None,
            funded_at: None,
            released_at: None,
            refunded_at: None,
            cancelled_at: None,
            dispute_id: None,
            release_reason: None,
            refund_reason: None,
            cancel_reason: None,
        }
    }

    pub fn is_party(&self, user: &UserId) -> bool {
        &self.payer_id == user || &self.payee_id == user
    }

    /// Fail with `InvalidState` unless the escrow is in one of `allowed`
    pub fn require_status(&self, allowed: &[EscrowStatus], operation: &str) -> Result<()> {
        if allowed.contains(&self.status) {
            return Ok(());
        }
        Err(CoreError::InvalidState(format!(
            "cannot {operation} escrow {} in status {}",
            self.id, self.status
        )))
    }

    /// Funded and past its auto-release instant
    pub fn can_auto_release(&self, now: DateTime<Utc>) -> bool {
        self.status == EscrowStatus::Funded
            && self.auto_release_at.is_some_and(|at| now >= at)
    }

    /// Never funded and past its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == EscrowStatus::Pending && now >= self.expires_at
    }

    pub(crate) fn fund(
        &mut self,
        method: PaymentMethod,
        reference: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.require_status(&[EscrowStatus::Pending], "fund")?;
        set_once(&mut self.funded_at, "funded_at", now)?;
        if self.terms.auto_release {
            self.auto_release_at =
                Some(now + Duration::days(i64::from(self.terms.auto_release_days)));
        }
        self.payment_method = Some(method);
        self.payment_reference = Some(reference);
        self.status = EscrowStatus::Funded;
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn release(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.require_status(&[EscrowStatus::Funded, EscrowStatus::Disputed], "release")?;
        if self.refunded_at.is_some() {
            return Err(CoreError::InvalidState(format!(
                "escrow {} was already refunded",
                self.id
            )));
        }
        set_once(&mut self.released_at, "released_at", now)?;
        self.release_reason = Some(reason.to_string());
        self.auto_release_at = None;
        self.status = EscrowStatus::Released;
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn refund(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.require_status(&[EscrowStatus::Funded, EscrowStatus::Disputed], "refund")?;
        if self.released_at.is_some() {
            return Err(CoreError::InvalidState(format!(
                "escrow {} was already released",
                self.id
            )));
        }
        set_once(&mut self.refunded_at, "refunded_at", now)?;
        self.refund_reason = Some(reason.to_string());
        self.auto_release_at = None;
        self.status = EscrowStatus::Refunded;
        self.updated_at = now;
        Ok(())
    }

    /// Cancel an escrow that was never funded
    pub(crate) fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.require_status(&[EscrowStatus::Pending], "cancel")?;
        self.close_cancelled(reason, now)
    }

    /// Cancel a FUNDED escrow, recording the refund of the deposit first
    pub(crate) fn refund_and_cancel(
        &mut self,
        refund_reason: &str,
        cancel_reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.require_status(&[EscrowStatus::Funded], "cancel")?;
        self.refund(refund_reason, now)?;
        self.close_cancelled(cancel_reason, now)
    }

    fn close_cancelled(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        set_once(&mut self.cancelled_at, "cancelled_at", now)?;
        self.cancel_reason = Some(reason.to_string());
        self.auto_release_at = None;
        self.status = EscrowStatus::Cancelled;
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn mark_disputed(&mut self, dispute_id: DisputeId, now: DateTime<Utc>) -> Result<()> {
        self.require_status(&[EscrowStatus::Pending, EscrowStatus::Funded], "dispute")?;
        self.dispute_id = Some(dispute_id);
        self.status = EscrowStatus::Disputed;
        self.updated_at = now;
        Ok(())
    }
}
