// Ledger module - THE SHARED HISTORY
// Fixed-point amounts, signed transactions, the account store and the
// append-only transaction log

mod account;
mod amount;
mod builder;
mod log;
mod policy;
mod transaction;
mod validator;

pub use account::{Account, AccountError, AccountStore, Applied, BalanceChange};
pub use amount::{Amount, AmountError, MICRO_PER_HOP};
pub use builder::TransactionBuilder;
pub use log::{LogEntry, LogError, RejectReason, TransactionLog};
pub use policy::{LedgerPolicy, RewardMode};
pub use transaction::{
    RewardClaim, Transaction, TransactionError, TxBody, TxId, TxKind, TxStatus, MAX_MEMO_LEN,
};
pub use validator::{TransactionValidator, ValidationError, VerifiedTransaction};
