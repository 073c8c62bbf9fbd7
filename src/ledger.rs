use crate::error::{PaymentError, PaymentResult};
use crate::fee::FeeRate;
use crate::utxo::{total_value, Utxo};

use bitcoin::absolute::LockTime;
use bitcoin::address::NetworkUnchecked;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1, Signing};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, PrivateKey, PublicKey, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness,
};
use std::str::FromStr;

pub const DEFAULT_DUST_THRESHOLD: u64 = 546;
/// Largest payload relayed in a data (OP_RETURN) output.
pub const MAX_DATA_SIZE: usize = 80;
const MAX_SIGNING_ROUNDS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChangeOutput {
    pub amount: u64,
}

/// Builds, signs and serializes transactions. Amount arithmetic beyond the
/// change/fee split stays with the caller.
pub trait Ledger {
    type Draft: LedgerDraft;

    fn draft_from_inputs(&self, inputs: &[Utxo]) -> PaymentResult<Self::Draft>;
}

pub trait LedgerDraft {
    type Key;

    fn add_recipient_output(&mut self, address: &str, amount: u64) -> PaymentResult<()>;
    fn add_data_output(&mut self, data: &[u8]) -> PaymentResult<()>;
    fn set_fee_rate(&mut self, fee_rate: FeeRate);
    fn set_change_address(&mut self, address: &str) -> PaymentResult<()>;
    /// Signs every input and settles the change output against the exact fee
    /// of the signed transaction.
    fn sign(&mut self, key: &Self::Key) -> PaymentResult<()>;
    fn serialize(&self) -> PaymentResult<String>;
    fn exact_fee(&self) -> PaymentResult<u64>;
    fn change_output(&self) -> Option<ChangeOutput>;
}

pub fn parse_address(address: &str, network: Network) -> PaymentResult<Address> {
    Address::<NetworkUnchecked>::from_str(address.trim())
        .map_err(|err| PaymentError::InvalidAddress(format!("{}: {}", address, err)))?
        .require_network(network)
        .map_err(|err| PaymentError::InvalidAddress(format!("{}: {}", address, err)))
}

pub fn p2pkh_address(key: &PrivateKey, network: Network) -> Address {
    let secp = Secp256k1::signing_only();
    Address::p2pkh(key.public_key(&secp).pubkey_hash(), network)
}

/// Legacy P2PKH ledger. All spent outputs are expected to be locked to the
/// signing key.
#[derive(Clone, Debug)]
pub struct BitcoinLedger {
    network: Network,
    dust_threshold: u64,
}

impl BitcoinLedger {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            dust_threshold: DEFAULT_DUST_THRESHOLD,
        }
    }

    pub fn with_dust_threshold(mut self, dust_threshold: u64) -> Self {
        self.dust_threshold = dust_threshold;
        self
    }

    pub fn network(&self) -> Network {
        self.network
    }
}

impl Ledger for BitcoinLedger {
    type Draft = BitcoinDraft;

    fn draft_from_inputs(&self, inputs: &[Utxo]) -> PaymentResult<BitcoinDraft> {
        let mut tx_inputs = Vec::with_capacity(inputs.len());
        for utxo in inputs.iter() {
            let txid = Txid::from_str(&utxo.pointer.transaction_id).map_err(|err| {
                PaymentError::Ledger(format!("bad transaction id in {}: {}", utxo.pointer, err))
            })?;
            tx_inputs.push(TxIn {
                previous_output: OutPoint {
                    txid,
                    vout: utxo.pointer.output_index,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            });
        }

        Ok(BitcoinDraft {
            network: self.network,
            dust_threshold: self.dust_threshold,
            inputs: tx_inputs,
            total_input: total_value(inputs)?,
            outputs: vec![],
            fee_rate: FeeRate::ZERO,
            change_script: None,
            signed: None,
        })
    }
}

#[derive(Clone, Debug)]
struct SignedState {
    transaction: Transaction,
    fee: u64,
    change: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct BitcoinDraft {
    network: Network,
    dust_threshold: u64,
    inputs: Vec<TxIn>,
    total_input: u64,
    outputs: Vec<TxOut>,
    fee_rate: FeeRate,
    change_script: Option<ScriptBuf>,
    signed: Option<SignedState>,
}

impl BitcoinDraft {
    pub fn transaction_id(&self) -> Option<Txid> {
        self.signed
            .as_ref()
            .map(|signed| signed.transaction.compute_txid())
    }

    pub fn signed_size(&self) -> Option<usize> {
        self.signed
            .as_ref()
            .map(|signed| signed.transaction.total_size())
    }

    fn signed_state(&self) -> PaymentResult<&SignedState> {
        self.signed
            .as_ref()
            .ok_or_else(|| PaymentError::Ledger("transaction is not signed".to_string()))
    }

    fn assemble_and_sign<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        key: &PrivateKey,
        public_key: &PublicKey,
        script_code: &ScriptBuf,
        change: Option<u64>,
    ) -> PaymentResult<Transaction> {
        let mut output = self.outputs.clone();
        if let (Some(script_pubkey), Some(amount)) = (&self.change_script, change) {
            output.push(TxOut {
                value: Amount::from_sat(amount),
                script_pubkey: script_pubkey.clone(),
            });
        }

        let mut transaction = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: self.inputs.clone(),
            output,
        };

        let sighash_type = EcdsaSighashType::All;
        let mut script_sigs = Vec::with_capacity(transaction.input.len());
        {
            let cache = SighashCache::new(&transaction);
            for index in 0..transaction.input.len() {
                let sighash = cache
                    .legacy_signature_hash(index, script_code, sighash_type.to_u32())
                    .map_err(|err| {
                        PaymentError::Ledger(format!("sighash of input {}: {}", index, err))
                    })?;
                let message = Message::from_digest(sighash.to_byte_array());
                let signature = bitcoin::ecdsa::Signature {
                    signature: secp.sign_ecdsa_low_r(&message, &key.inner),
                    sighash_type,
                };
                let signature = PushBytesBuf::try_from(signature.to_vec())
                    .map_err(|err| PaymentError::Ledger(format!("signature push: {}", err)))?;
                script_sigs.push(
                    Builder::new()
                        .push_slice(signature)
                        .push_key(public_key)
                        .into_script(),
                );
            }
        }

        for (input, script_sig) in transaction.input.iter_mut().zip(script_sigs) {
            input.script_sig = script_sig;
        }
        Ok(transaction)
    }
}

/// Outcome of [`settle_fee`]: the last signed artifact and the split of the
/// leftover value between change and fee.
struct Settlement<T> {
    signed: T,
    size: u64,
    fee: u64,
    change: Option<u64>,
    rounds: usize,
}

/// The signature length depends on the change amount, so `sign_round` is
/// called until the change decision no longer moves. Dropped change stays
/// dropped. Without change the fee is the whole leftover, or the required
/// fee when the leftover cannot pay it.
fn settle_fee<T, F>(
    leftover: u64,
    has_change: bool,
    fee_rate: FeeRate,
    dust_threshold: u64,
    mut sign_round: F,
) -> PaymentResult<Settlement<T>>
where
    F: FnMut(Option<u64>) -> PaymentResult<(T, u64)>,
{
    let mut change = has_change.then_some(leftover);
    let mut change_dropped = false;
    for round in 0..MAX_SIGNING_ROUNDS {
        let (signed, size) = sign_round(change)?;
        let required_fee = fee_rate.fee_for_size(size);

        let next_change = if !has_change || change_dropped {
            None
        } else {
            leftover
                .checked_sub(required_fee)
                .filter(|amount| *amount >= dust_threshold)
        };
        if has_change && next_change.is_none() {
            change_dropped = true;
        }

        if next_change == change {
            let fee = match change {
                Some(amount) => leftover - amount,
                None => leftover.max(required_fee),
            };
            return Ok(Settlement {
                signed,
                size,
                fee,
                change,
                rounds: round + 1,
            });
        }
        change = next_change;
    }

    Err(PaymentError::Ledger(format!(
        "fee did not settle after {} signing rounds",
        MAX_SIGNING_ROUNDS
    )))
}

impl LedgerDraft for BitcoinDraft {
    type Key = PrivateKey;

    fn add_recipient_output(&mut self, address: &str, amount: u64) -> PaymentResult<()> {
        let address = parse_address(address, self.network)?;
        self.outputs.push(TxOut {
            value: Amount::from_sat(amount),
            script_pubkey: address.script_pubkey(),
        });
        self.signed = None;
        Ok(())
    }

    fn add_data_output(&mut self, data: &[u8]) -> PaymentResult<()> {
        if data.len() > MAX_DATA_SIZE {
            return Err(PaymentError::MetadataTooLarge {
                size: data.len(),
                max: MAX_DATA_SIZE,
            });
        }
        let push = PushBytesBuf::try_from(data.to_vec())
            .map_err(|err| PaymentError::Ledger(format!("data push: {}", err)))?;
        self.outputs.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new_op_return(push),
        });
        self.signed = None;
        Ok(())
    }

    fn set_fee_rate(&mut self, fee_rate: FeeRate) {
        self.fee_rate = fee_rate;
        self.signed = None;
    }

    fn set_change_address(&mut self, address: &str) -> PaymentResult<()> {
        let address = parse_address(address, self.network)?;
        self.change_script = Some(address.script_pubkey());
        self.signed = None;
        Ok(())
    }

    fn sign(&mut self, key: &PrivateKey) -> PaymentResult<()> {
        let secp = Secp256k1::signing_only();
        let public_key = key.public_key(&secp);
        let script_code = ScriptBuf::new_p2pkh(&public_key.pubkey_hash());

        let fixed_outputs: u64 = self.outputs.iter().map(|output| output.value.to_sat()).sum();
        let leftover = self.total_input.saturating_sub(fixed_outputs);

        let settled = settle_fee(
            leftover,
            self.change_script.is_some(),
            self.fee_rate,
            self.dust_threshold,
            |change| {
                let transaction =
                    self.assemble_and_sign(&secp, key, &public_key, &script_code, change)?;
                let size = transaction.total_size() as u64;
                Ok((transaction, size))
            },
        )?;
        tracing::debug!(
            "signed {} byte transaction in {} rounds, fee {}, change {:?}",
            settled.size,
            settled.rounds,
            settled.fee,
            settled.change
        );
        self.signed = Some(SignedState {
            transaction: settled.signed,
            fee: settled.fee,
            change: settled.change,
        });
        Ok(())
    }

    fn serialize(&self) -> PaymentResult<String> {
        Ok(serialize_hex(&self.signed_state()?.transaction))
    }

    fn exact_fee(&self) -> PaymentResult<u64> {
        Ok(self.signed_state()?.fee)
    }

    fn change_output(&self) -> Option<ChangeOutput> {
        self.signed
            .as_ref()
            .and_then(|signed| signed.change)
            .map(|amount| ChangeOutput { amount })
    }
}
