use crate::error::{PaymentError, PaymentResult};
use crate::ledger::{Ledger, LedgerDraft, MAX_DATA_SIZE};
use crate::payment::PaymentRequest;
use crate::utxo::{total_value, Utxo};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalancedTransaction {
    pub hex: String,
    pub total_input: u64,
    pub payment_amount: u64,
    pub change_amount: u64,
    /// Fee of the signed transaction, derived from its true serialized size.
    pub exact_fee: u64,
}

/// Decodes a hex metadata payload, accepting an optional `0x` prefix.
pub fn decode_metadata(metadata: &str) -> PaymentResult<Vec<u8>> {
    let trimmed = metadata.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    hex::decode(trimmed).map_err(|err| PaymentError::InvalidMetadata(err.to_string()))
}

pub fn check_metadata(metadata: &[u8]) -> PaymentResult<()> {
    if metadata.len() > MAX_DATA_SIZE {
        return Err(PaymentError::MetadataTooLarge {
            size: metadata.len(),
            max: MAX_DATA_SIZE,
        });
    }
    Ok(())
}

/// Solvency first, then the exact balance law
/// `total_input == payment + change + fee`.
pub fn verify_balance(
    total_input: u64,
    payment_amount: u64,
    change_amount: u64,
    exact_fee: u64,
) -> PaymentResult<()> {
    let required = payment_amount.saturating_add(exact_fee);
    if total_input < required {
        return Err(PaymentError::InsufficientFunds {
            available: total_input,
            required,
        });
    }

    let spent = payment_amount as u128 + change_amount as u128 + exact_fee as u128;
    if total_input as u128 != spent {
        tracing::error!(
            "unbalanced transaction: input {} payment {} change {} fee {}",
            total_input,
            payment_amount,
            change_amount,
            exact_fee
        );
        return Err(PaymentError::UnbalancedTransaction {
            total_input,
            payment: payment_amount,
            change: change_amount,
            fee: exact_fee,
        });
    }
    Ok(())
}

/// Composes the unsigned draft: recipient, optional data output, change.
pub fn draft<L: Ledger>(
    ledger: &L,
    inputs: &[Utxo],
    request: &PaymentRequest,
    change_address: &str,
) -> PaymentResult<L::Draft> {
    if let Some(metadata) = request.metadata.as_ref() {
        check_metadata(metadata)?;
    }

    let mut draft = ledger.draft_from_inputs(inputs)?;
    draft.add_recipient_output(&request.recipient, request.amount)?;
    if let Some(metadata) = request.metadata.as_ref() {
        draft.add_data_output(metadata)?;
    }
    draft.set_fee_rate(request.fee_rate);
    draft.set_change_address(change_address)?;
    Ok(draft)
}

/// Re-derives fee and change from the signed draft and checks them.
pub fn validate<D: LedgerDraft>(
    draft: &D,
    inputs: &[Utxo],
    payment_amount: u64,
) -> PaymentResult<BalancedTransaction> {
    let total_input = total_value(inputs)?;
    let exact_fee = draft.exact_fee()?;
    let change_amount = draft
        .change_output()
        .map(|change| change.amount)
        .unwrap_or(0);

    verify_balance(total_input, payment_amount, change_amount, exact_fee)?;

    Ok(BalancedTransaction {
        hex: draft.serialize()?,
        total_input,
        payment_amount,
        change_amount,
        exact_fee,
    })
}

pub fn build<L: Ledger>(
    ledger: &L,
    key: &<L::Draft as LedgerDraft>::Key,
    inputs: &[Utxo],
    request: &PaymentRequest,
    change_address: &str,
) -> PaymentResult<BalancedTransaction> {
    let mut draft = draft(ledger, inputs, request, change_address)?;
    draft.sign(key)?;
    validate(&draft, inputs, request.amount)
}
