use crate::balancer;
use crate::chain::ChainBackend;
use crate::error::{PaymentError, PaymentResult};
use crate::fee::FeeRate;
use crate::ledger::{Ledger, LedgerDraft};
use crate::selection::{self, MIN_OUTPUT_COUNT};
use crate::utxo::Utxo;

use bitcoin::{Amount, Denomination};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentRequest {
    pub recipient: String,
    /// Smallest units.
    pub amount: u64,
    pub fee_rate: FeeRate,
    pub metadata: Option<Vec<u8>>,
}

impl PaymentRequest {
    pub fn output_count(&self) -> usize {
        MIN_OUTPUT_COUNT + usize::from(self.metadata.is_some())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildStage {
    Selecting,
    Drafting,
    Signing,
    Validating,
    Ready,
    Failed,
}

impl BuildStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStage::Ready | BuildStage::Failed)
    }

    /// Stages only move forward; any non-terminal stage may fail.
    pub fn can_advance_to(self, next: BuildStage) -> bool {
        use BuildStage::*;
        match (self, next) {
            (Ready, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Selecting, Drafting)
            | (Drafting, Signing)
            | (Signing, Validating)
            | (Validating, Ready) => true,
            _ => false,
        }
    }
}

struct StageTracker {
    stage: BuildStage,
}

impl StageTracker {
    fn new() -> Self {
        tracing::debug!("build stage {:?}", BuildStage::Selecting);
        Self {
            stage: BuildStage::Selecting,
        }
    }

    fn advance(&mut self, next: BuildStage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "{:?} -> {:?}",
            self.stage,
            next
        );
        tracing::debug!("build stage {:?} -> {:?}", self.stage, next);
        self.stage = next;
    }

    fn fail(&mut self, err: PaymentError) -> PaymentError {
        tracing::warn!("payment build failed while {:?}: {}", self.stage, err);
        self.advance(BuildStage::Failed);
        err
    }
}

/// Signed, validated transaction ready for broadcast. `estimated_fee` is the
/// selection heuristic and `exact_fee` the fee of the signed artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedPayment {
    pub hex: String,
    pub inputs: Vec<Utxo>,
    pub total_input: u64,
    pub payment_amount: u64,
    pub change_amount: u64,
    pub exact_fee: u64,
    pub estimated_fee: u64,
}

fn run_build<L: Ledger>(
    tracker: &mut StageTracker,
    utxos: Vec<Utxo>,
    request: &PaymentRequest,
    ledger: &L,
    key: &<L::Draft as LedgerDraft>::Key,
    change_address: &str,
) -> PaymentResult<SignedPayment> {
    let selection = selection::select(
        utxos,
        request.amount,
        request.fee_rate,
        request.output_count(),
    )?;
    tracing::info!(
        "selected {} inputs worth {} for a payment of {}",
        selection.inputs.len(),
        selection.total_input,
        request.amount
    );

    tracker.advance(BuildStage::Drafting);
    let mut draft = balancer::draft(ledger, &selection.inputs, request, change_address)?;

    tracker.advance(BuildStage::Signing);
    draft.sign(key)?;

    tracker.advance(BuildStage::Validating);
    let balanced = balancer::validate(&draft, &selection.inputs, request.amount)?;
    if balanced.exact_fee != selection.estimated_fee {
        tracing::debug!(
            "exact fee {} differs from estimate {}",
            balanced.exact_fee,
            selection.estimated_fee
        );
    }

    Ok(SignedPayment {
        hex: balanced.hex,
        inputs: selection.inputs,
        total_input: balanced.total_input,
        payment_amount: balanced.payment_amount,
        change_amount: balanced.change_amount,
        exact_fee: balanced.exact_fee,
        estimated_fee: selection.estimated_fee,
    })
}

/// Selects inputs from `utxos`, drafts, signs and validates the payment.
/// No external effect happens here.
pub fn prepare_payment<L: Ledger>(
    utxos: Vec<Utxo>,
    request: &PaymentRequest,
    ledger: &L,
    key: &<L::Draft as LedgerDraft>::Key,
    change_address: &str,
) -> PaymentResult<SignedPayment> {
    let mut tracker = StageTracker::new();
    match run_build(&mut tracker, utxos, request, ledger, key, change_address) {
        Ok(payment) => {
            tracker.advance(BuildStage::Ready);
            tracing::info!(
                "payment ready: fee {}, change {}",
                payment.exact_fee,
                payment.change_amount
            );
            Ok(payment)
        }
        Err(err) => Err(tracker.fail(err)),
    }
}

/// Fetches a fresh UTXO snapshot for `sender` and prepares the payment from it,
/// sending change back to `sender`.
pub async fn prepare_from_chain<C: ChainBackend, L: Ledger>(
    client: &C,
    ledger: &L,
    key: &<L::Draft as LedgerDraft>::Key,
    sender: &str,
    request: &PaymentRequest,
) -> PaymentResult<SignedPayment> {
    let utxos = client.fetch_utxos(sender).await.map_err(|err| {
        tracing::warn!("payment build failed while fetching utxos: {}", err);
        err
    })?;
    tracing::info!("fetched {} utxos for {}", utxos.len(), sender);
    prepare_payment(utxos, request, ledger, key, sender)
}

/// One-shot broadcast. On failure the signed payment is untouched and can be
/// broadcast again.
pub async fn broadcast_payment<C: ChainBackend>(
    client: &C,
    payment: &SignedPayment,
) -> PaymentResult<String> {
    let txid = client.broadcast(&payment.hex).await?;
    tracing::info!("broadcast transaction {}", txid);
    Ok(txid)
}

/// Result of [`send_payment`]. A failed broadcast still carries the signed
/// payment.
#[derive(Debug, PartialEq, Eq)]
pub enum PaymentOutcome {
    Prepared(SignedPayment),
    Broadcast {
        payment: SignedPayment,
        txid: String,
    },
    BroadcastFailed {
        payment: SignedPayment,
        error: PaymentError,
    },
}

impl PaymentOutcome {
    pub fn payment(&self) -> &SignedPayment {
        match self {
            PaymentOutcome::Prepared(payment)
            | PaymentOutcome::Broadcast { payment, .. }
            | PaymentOutcome::BroadcastFailed { payment, .. } => payment,
        }
    }
}

/// Fetches, prepares and, when `broadcast` is set, broadcasts the payment.
/// Without `broadcast` nothing is sent to the node.
pub async fn send_payment<C: ChainBackend, L: Ledger>(
    client: &C,
    ledger: &L,
    key: &<L::Draft as LedgerDraft>::Key,
    sender: &str,
    request: &PaymentRequest,
    broadcast: bool,
) -> PaymentResult<PaymentOutcome> {
    let payment = prepare_from_chain(client, ledger, key, sender, request).await?;
    if !broadcast {
        return Ok(PaymentOutcome::Prepared(payment));
    }

    match broadcast_payment(client, &payment).await {
        Ok(txid) => Ok(PaymentOutcome::Broadcast { payment, txid }),
        Err(error) => {
            tracing::warn!("broadcast failed, signed transaction kept: {}", error);
            Ok(PaymentOutcome::BroadcastFailed { payment, error })
        }
    }
}

/// Parses a decimal amount in whole currency units into smallest units.
pub fn parse_whole_units(amount: &str) -> PaymentResult<u64> {
    Amount::from_str_in(amount.trim(), Denomination::Bitcoin)
        .map(|amount| amount.to_sat())
        .map_err(|err| PaymentError::InvalidAmount(format!("{:?}: {}", amount, err)))
}

#[cfg(test)]
mod tests {
    use crate::error::PaymentError;
    use crate::fee::{estimated_size, FeeRate};
    use crate::ledger::{p2pkh_address, BitcoinLedger};
    use crate::chain::ChainBackend;
    use crate::error::PaymentResult;
    use crate::payment::{
        parse_whole_units, prepare_payment, send_payment, BuildStage, PaymentOutcome,
        PaymentRequest,
    };
    use crate::utxo::Utxo;
    use async_trait::async_trait;
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::{Network, PrivateKey};
    use std::sync::Mutex;

    /// In-memory chain that records every broadcast.
    struct MemoryChain {
        utxos: Vec<Utxo>,
        fetch_error: Option<PaymentError>,
        broadcast_error: Option<PaymentError>,
        fetched: Mutex<Vec<String>>,
        broadcasts: Mutex<Vec<String>>,
    }

    impl MemoryChain {
        fn new(values: &[u64]) -> Self {
            Self {
                utxos: utxos(values),
                fetch_error: None,
                broadcast_error: None,
                fetched: Mutex::new(vec![]),
                broadcasts: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl ChainBackend for MemoryChain {
        async fn fetch_utxos(&self, address: &str) -> PaymentResult<Vec<Utxo>> {
            self.fetched.lock().unwrap().push(address.to_string());
            match &self.fetch_error {
                Some(err) => Err(err.clone()),
                None => Ok(self.utxos.clone()),
            }
        }

        async fn broadcast(&self, raw_transaction: &str) -> PaymentResult<String> {
            self.broadcasts
                .lock()
                .unwrap()
                .push(raw_transaction.to_string());
            match &self.broadcast_error {
                Some(err) => Err(err.clone()),
                None => Ok("f".repeat(64)),
            }
        }
    }

    fn key(byte: u8) -> PrivateKey {
        PrivateKey::new(SecretKey::from_slice(&[byte; 32]).unwrap(), Network::Testnet)
    }

    fn utxos(values: &[u64]) -> Vec<Utxo> {
        values
            .iter()
            .enumerate()
            .map(|(index, value)| Utxo::new(format!("{:064x}", index + 100), 0, *value))
            .collect()
    }

    fn request(amount: u64, rate: u64, metadata: Option<Vec<u8>>) -> PaymentRequest {
        PaymentRequest {
            recipient: p2pkh_address(&key(0x42), Network::Testnet).to_string(),
            amount,
            fee_rate: FeeRate::from_sat_per_byte(rate),
            metadata,
        }
    }

    #[test]
    fn single_large_utxo_scenario() {
        let sender = key(0x41);
        let change = p2pkh_address(&sender, Network::Testnet).to_string();
        let ledger = BitcoinLedger::new(Network::Testnet);

        let payment = prepare_payment(
            utxos(&[500000, 300000, 100000]),
            &request(400000, 10, None),
            &ledger,
            &sender,
            &change,
        )
        .unwrap();

        assert_eq!(payment.inputs.len(), 1);
        assert_eq!(payment.inputs[0].value, 500000);
        assert_eq!(payment.estimated_fee, 2260);
        assert!(payment.exact_fee <= payment.estimated_fee);
        assert_eq!(payment.change_amount, 500000 - 400000 - payment.exact_fee);
        assert_eq!(
            payment.exact_fee,
            FeeRate::from_sat_per_byte(10).fee_for_size(payment.hex.len() as u64 / 2)
        );
    }

    #[test]
    fn insufficient_scenario() {
        let sender = key(0x41);
        let change = p2pkh_address(&sender, Network::Testnet).to_string();
        let result = prepare_payment(
            utxos(&[20000, 20000, 10000]),
            &request(100000, 1, None),
            &BitcoinLedger::new(Network::Testnet),
            &sender,
            &change,
        );
        assert!(matches!(
            result,
            Err(PaymentError::InsufficientFunds { available: 50000, .. })
        ));
    }

    #[test]
    fn metadata_counts_as_an_output() {
        let sender = key(0x41);
        let change = p2pkh_address(&sender, Network::Testnet).to_string();
        let with_data = request(400000, 10, Some(b"invoice 42".to_vec()));
        assert_eq!(with_data.output_count(), 3);

        let payment = prepare_payment(
            utxos(&[500000]),
            &with_data,
            &BitcoinLedger::new(Network::Testnet),
            &sender,
            &change,
        )
        .unwrap();
        assert_eq!(payment.estimated_fee, 10 * estimated_size(1, 3));
        assert_eq!(
            payment.total_input,
            payment.payment_amount + payment.change_amount + payment.exact_fee
        );
        assert!(payment.hex.contains(&hex::encode(b"invoice 42")));
    }

    #[test]
    fn oversized_metadata_is_fatal() {
        let sender = key(0x41);
        let change = p2pkh_address(&sender, Network::Testnet).to_string();
        let result = prepare_payment(
            utxos(&[500000]),
            &request(1000, 1, Some(vec![0u8; 81])),
            &BitcoinLedger::new(Network::Testnet),
            &sender,
            &change,
        );
        assert_eq!(
            result,
            Err(PaymentError::MetadataTooLarge { size: 81, max: 80 })
        );
    }

    #[test]
    fn invalid_recipient_is_fatal() {
        let sender = key(0x41);
        let change = p2pkh_address(&sender, Network::Testnet).to_string();
        let mut bad = request(1000, 1, None);
        bad.recipient = p2pkh_address(&key(0x42), Network::Bitcoin).to_string();
        let result = prepare_payment(
            utxos(&[500000]),
            &bad,
            &BitcoinLedger::new(Network::Testnet),
            &sender,
            &change,
        );
        assert!(matches!(result, Err(PaymentError::InvalidAddress(_))));
    }

    #[test]
    fn stages_only_move_forward() {
        use BuildStage::*;
        let order = [Selecting, Drafting, Signing, Validating, Ready];
        for pair in order.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]));
            assert!(!pair[1].can_advance_to(pair[0]));
        }
        for stage in [Selecting, Drafting, Signing, Validating] {
            assert!(stage.can_advance_to(Failed));
            assert!(!stage.is_terminal());
        }
        assert!(!Selecting.can_advance_to(Signing));
        assert!(!Ready.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Selecting));
        assert!(Ready.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn parses_decimal_amounts_exactly() {
        assert_eq!(parse_whole_units("0.004").unwrap(), 400000);
        assert_eq!(parse_whole_units("1").unwrap(), 100_000_000);
        assert_eq!(parse_whole_units(" 0.01 ").unwrap(), 1_000_000);
        assert_eq!(parse_whole_units("0.00000001").unwrap(), 1);
        assert!(matches!(
            parse_whole_units("0.000000001"),
            Err(PaymentError::InvalidAmount(_))
        ));
        assert!(matches!(
            parse_whole_units("-1"),
            Err(PaymentError::InvalidAmount(_))
        ));
        assert!(matches!(
            parse_whole_units("ten"),
            Err(PaymentError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn dry_run_never_broadcasts() {
        let sender = key(0x41);
        let from = p2pkh_address(&sender, Network::Testnet).to_string();
        let chain = MemoryChain::new(&[500000, 300000, 100000]);

        let outcome = send_payment(
            &chain,
            &BitcoinLedger::new(Network::Testnet),
            &sender,
            &from,
            &request(400000, 10, None),
            false,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, PaymentOutcome::Prepared(_)));
        assert_eq!(outcome.payment().inputs.len(), 1);
        assert_eq!(*chain.fetched.lock().unwrap(), vec![from]);
        assert!(chain.broadcasts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadcasts_signed_hex() {
        let sender = key(0x41);
        let from = p2pkh_address(&sender, Network::Testnet).to_string();
        let chain = MemoryChain::new(&[500000]);

        let outcome = send_payment(
            &chain,
            &BitcoinLedger::new(Network::Testnet),
            &sender,
            &from,
            &request(400000, 10, None),
            true,
        )
        .await
        .unwrap();

        match &outcome {
            PaymentOutcome::Broadcast { payment, txid } => {
                assert_eq!(txid, &"f".repeat(64));
                assert_eq!(*chain.broadcasts.lock().unwrap(), vec![payment.hex.clone()]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_broadcast_keeps_signed_payment() {
        let sender = key(0x41);
        let from = p2pkh_address(&sender, Network::Testnet).to_string();
        let mut chain = MemoryChain::new(&[500000]);
        chain.broadcast_error = Some(PaymentError::NetworkFailure("timeout".to_string()));

        let outcome = send_payment(
            &chain,
            &BitcoinLedger::new(Network::Testnet),
            &sender,
            &from,
            &request(400000, 10, None),
            true,
        )
        .await
        .unwrap();

        match outcome {
            PaymentOutcome::BroadcastFailed { payment, error } => {
                assert_eq!(error, PaymentError::NetworkFailure("timeout".to_string()));
                assert_eq!(payment.total_input, 500000);
                assert_eq!(*chain.broadcasts.lock().unwrap(), vec![payment.hex]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn fetch_failure_is_returned() {
        let sender = key(0x41);
        let from = p2pkh_address(&sender, Network::Testnet).to_string();
        let mut chain = MemoryChain::new(&[500000]);
        chain.fetch_error = Some(PaymentError::NetworkFailure("503".to_string()));

        let result = send_payment(
            &chain,
            &BitcoinLedger::new(Network::Testnet),
            &sender,
            &from,
            &request(400000, 10, None),
            true,
        )
        .await;

        assert_eq!(result, Err(PaymentError::NetworkFailure("503".to_string())));
        assert!(chain.broadcasts.lock().unwrap().is_empty());
    }
}
