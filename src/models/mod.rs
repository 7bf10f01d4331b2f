pub mod dispute;
pub mod escrow;
pub mod ids;
pub mod transaction;

pub use dispute::{Dispute, DisputeStatus, Resolution, ResolutionAction};
pub use escrow::{
    calculate_fee, Currency, EscrowStatus, EscrowTerms, EscrowTransaction, PaymentMethod,
};
pub use ids::{DisputeId, EscrowId, MessageId, TransactionId, UserId};
pub use transaction::{
    Address, HistoryAction, HistoryEntry, LineItem, Message, NewTransaction, ShippingInfo,
    Transaction, TransactionStatus, TransactionType,
};
