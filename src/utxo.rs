use crate::error::{PaymentError, PaymentResult};
use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoPointer {
    pub transaction_id: String,
    pub output_index: u32,
}

impl fmt::Display for UtxoPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transaction_id, self.output_index)
    }
}

/// Spendable output owned by the sender. `value` is in the smallest currency unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub pointer: UtxoPointer,
    pub value: u64,
}

impl Utxo {
    pub fn new(transaction_id: impl Into<String>, output_index: u32, value: u64) -> Self {
        Self {
            pointer: UtxoPointer {
                transaction_id: transaction_id.into(),
                output_index,
            },
            value,
        }
    }
}

pub fn total_value(utxos: &[Utxo]) -> PaymentResult<u64> {
    utxos.iter().try_fold(0u64, |total, utxo| {
        total.checked_add(utxo.value).ok_or_else(|| {
            PaymentError::InvalidAmount(format!("input total overflows at {}", utxo.pointer))
        })
    })
}

/// Record returned by the chain data provider. Values arrive as decimal strings.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderUtxo {
    pub txid: String,
    pub vout: u32,
    pub value: String,
}

impl TryFrom<ProviderUtxo> for Utxo {
    type Error = PaymentError;

    fn try_from(record: ProviderUtxo) -> Result<Self, Self::Error> {
        let value = u64::from_str(record.value.trim()).map_err(|err| {
            PaymentError::NetworkFailure(format!(
                "provider returned non-integer value {:?} for {}:{}: {}",
                record.value, record.txid, record.vout, err
            ))
        })?;
        Ok(Utxo::new(record.txid, record.vout, value))
    }
}
