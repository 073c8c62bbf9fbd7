//! Single-recipient payment assembly: greedy input selection over a UTXO
//! snapshot, fee estimation, exact balancing of the signed transaction and
//! broadcast over JSON-RPC.

pub mod balancer;
pub mod chain;
pub mod config;
pub mod error;
pub mod fee;
pub mod ledger;
pub mod payment;
pub mod selection;
pub mod utxo;

pub use error::{PaymentError, PaymentResult};
pub use fee::FeeRate;
pub use payment::{PaymentRequest, SignedPayment};
pub use utxo::Utxo;
