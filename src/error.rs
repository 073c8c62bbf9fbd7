use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("metadata is {size} bytes, at most {max} bytes can be embedded")]
    MetadataTooLarge { size: usize, max: usize },

    #[error(
        "transaction is not balanced: input {total_input} != payment {payment} + change {change} + fee {fee}"
    )]
    UnbalancedTransaction {
        total_input: u64,
        payment: u64,
        change: u64,
        fee: u64,
    },

    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("ledger error: {0}")]
    Ledger(String),
}

pub type PaymentResult<T> = Result<T, PaymentError>;

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        PaymentError::NetworkFailure(err.to_string())
    }
}
