//! Payment-processor seam
//!
//! The processor actually moves money; this crate only records the custody
//! state that results. Every call goes through [`call_processor`], which
//! bounds it with a timeout and maps any failure to
//! [`CoreError::PaymentFailed`] so the caller never mutates the escrow on an
//! unconfirmed payment.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::error::{CoreError, Result};
use crate::models::{Currency, EscrowId, PaymentMethod, UserId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessorError {
    #[error("declined: {0}")]
    Declined(String),

    #[error("processor unavailable: {0}")]
    Unavailable(String),
}

/// Money movement requested from the processor
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequest {
    pub escrow_id: EscrowId,
    /// Party whose funds move (payer on collect, payee on payout, payer on refund)
    pub counterparty: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    pub method: Option<PaymentMethod>,
}

/// Processor confirmation
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentReceipt {
    pub reference: String,
}

pub type ProcessorResult = std::result::Result<PaymentReceipt, ProcessorError>;

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Collect the payer's deposit into custody
    async fn collect(&self, request: &PaymentRequest) -> ProcessorResult;

    /// Pay the principal out of custody to the payee
    async fn payout(&self, request: &PaymentRequest) -> ProcessorResult;

    /// Return the deposit from custody to the payer
    async fn refund(&self, request: &PaymentRequest) -> ProcessorResult;
}

/// Run one processor call under `timeout`
pub(crate) async fn call_processor<F>(
    operation: &'static str,
    escrow_id: EscrowId,
    timeout: Duration,
    call: F,
) -> Result<PaymentReceipt>
where
    F: Future<Output = ProcessorResult>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(receipt)) => Ok(receipt),
        Ok(Err(e)) => {
            tracing::warn!(%escrow_id, operation, error = %e, "payment processor rejected call");
            Err(CoreError::PaymentFailed(format!("{operation}: {e}")))
        }
        Err(_) => {
            tracing::warn!(%escrow_id, operation, ?timeout, "payment processor timed out");
            Err(CoreError::PaymentFailed(format!(
                "{operation}: processor timed out after {timeout:?}"
            )))
        }
    }
}

/// Processor that confirms every request without moving money
///
/// Backs the offline replay tool; references are `offline-<op>-<escrow>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineProcessor;

impl OfflineProcessor {
    fn receipt(op: &str, request: &PaymentRequest) -> PaymentReceipt {
        PaymentReceipt {
            reference: format!("offline-{op}-{}", request.escrow_id),
        }
    }
}

#[async_trait]
impl PaymentProcessor for OfflineProcessor {
    async fn collect(&self, request: &PaymentRequest) -> ProcessorResult {
        Ok(Self::receipt("collect", request))
    }

    async fn payout(&self, request: &PaymentRequest) -> ProcessorResult {
        Ok(Self::receipt("payout", request))
    }

    async fn refund(&self, request: &PaymentRequest) -> ProcessorResult {
        Ok(Self::receipt("refund", request))
    }
}
