use crate::error::{PaymentError, PaymentResult};
use crate::fee::{estimated_size, FeeRate};
use crate::utxo::Utxo;
use itertools::Itertools;

/// Recipient plus change.
pub const MIN_OUTPUT_COUNT: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    /// In selection order, largest value first.
    pub inputs: Vec<Utxo>,
    pub total_input: u64,
    /// Heuristic fee for `inputs.len()` inputs. Never used for validation.
    pub estimated_fee: u64,
}

fn required_amount(
    payment_amount: u64,
    fee_rate: FeeRate,
    input_count: usize,
    output_count: usize,
) -> u64 {
    let fee = fee_rate.fee_for_size(estimated_size(input_count, output_count));
    payment_amount.saturating_add(fee)
}

/// Greedy largest-first selection.
///
/// UTXOs are taken in descending value order until the running total covers
/// the payment plus the estimated fee for the inputs chosen so far. The
/// estimate is re-evaluated after every inclusion, so each added input pays
/// for its own size and dropping the last one always leaves the selection
/// short. Equal values keep their input order.
pub fn select(
    utxos: Vec<Utxo>,
    payment_amount: u64,
    fee_rate: FeeRate,
    output_count: usize,
) -> PaymentResult<Selection> {
    if payment_amount == 0 {
        return Err(PaymentError::InvalidAmount(
            "payment amount must be positive".to_string(),
        ));
    }
    let output_count = output_count.max(MIN_OUTPUT_COUNT);

    let mut inputs: Vec<Utxo> = vec![];
    let mut total_input = 0u64;

    for utxo in utxos
        .into_iter()
        .sorted_by(|left, right| right.value.cmp(&left.value))
    {
        if total_input >= required_amount(payment_amount, fee_rate, inputs.len(), output_count) {
            break;
        }
        total_input = total_input.saturating_add(utxo.value);
        inputs.push(utxo);
    }

    let required = required_amount(payment_amount, fee_rate, inputs.len(), output_count);
    if total_input < required {
        tracing::debug!(
            "selection exhausted {} utxos: {} available, {} required",
            inputs.len(),
            total_input,
            required
        );
        return Err(PaymentError::InsufficientFunds {
            available: total_input,
            required,
        });
    }

    let estimated_fee = required - payment_amount;
    tracing::debug!(
        "selected {} inputs totalling {}, estimated fee {}",
        inputs.len(),
        total_input,
        estimated_fee
    );

    Ok(Selection {
        inputs,
        total_input,
        estimated_fee,
    })
}
