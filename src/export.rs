//! CSV export of escrows and ledger transactions

use std::io::Write;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::EngineError;
use crate::models::{
    Currency, EscrowId, EscrowStatus, EscrowTransaction, Transaction, TransactionId,
    TransactionStatus, TransactionType, UserId,
};

// Flat rows for CSV; nested records (terms, history) do not fit a column layout
#[derive(Serialize)]
struct EscrowRow<'a> {
    escrow: &'a str,
    id: EscrowId,
    status: EscrowStatus,
    amount: Decimal,
    fee: Decimal,
    total_amount: Decimal,
    currency: Currency,
    funded_at: Option<DateTime<Utc>>,
    released_at: Option<DateTime<Utc>>,
    refunded_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl<'a> EscrowRow<'a> {
    fn new(label: &'a str, escrow: &EscrowTransaction) -> Self {
        Self {
            escrow: label,
            id: escrow.id,
            status: escrow.status,
            amount: money(escrow.amount),
            fee: money(escrow.fee),
            total_amount: money(escrow.total_amount),
            currency: escrow.currency,
            funded_at: escrow.funded_at,
            released_at: escrow.released_at,
            refunded_at: escrow.refunded_at,
            cancelled_at: escrow.cancelled_at,
        }
    }
}

/// Money columns always carry two decimal places
fn money(amount: Decimal) -> Decimal {
    let mut amount = amount;
    amount.rescale(2);
    amount
}

#[derive(Serialize)]
struct TransactionRow<'a> {
    id: TransactionId,
    #[serde(rename = "type")]
    tx_type: TransactionType,
    item_id: &'a str,
    buyer_id: &'a UserId,
    seller_id: &'a UserId,
    status: TransactionStatus,
    total: Decimal,
    escrow_id: Option<EscrowId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Write labelled escrows in the given order
pub fn write_escrows<W: Write>(
    writer: W,
    escrows: &[(String, EscrowTransaction)],
) -> Result<(), EngineError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for (label, escrow) in escrows {
        csv_writer.serialize(EscrowRow::new(label, escrow))?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Write ledger transactions, oldest first
pub fn write_transactions<W: Write>(
    writer: W,
    transactions: &[Transaction],
) -> Result<(), EngineError> {
    let mut sorted: Vec<&Transaction> = transactions.iter().collect();
    sorted.sort_by_key(|t| t.created_at);

    let mut csv_writer = csv::Writer::from_writer(writer);
    for transaction in sorted {
        csv_writer.serialize(TransactionRow {
            id: transaction.id,
            tx_type: transaction.tx_type,
            item_id: &transaction.item_id,
            buyer_id: &transaction.buyer_id,
            seller_id: &transaction.seller_id,
            status: transaction.status,
            total: money(transaction.total),
            escrow_id: transaction.escrow_id,
            created_at: transaction.created_at,
            updated_at: transaction.updated_at,
        })?;
    }
    csv_writer.flush()?;
    Ok(())
}
