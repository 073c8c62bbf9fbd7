use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::prelude::*;

use utxo_payment::balancer::decode_metadata;
use utxo_payment::chain::ChainClient;
use utxo_payment::config::{Config, NetworkChoice};
use utxo_payment::ledger::{p2pkh_address, BitcoinLedger};
use utxo_payment::payment::{parse_whole_units, send_payment, PaymentOutcome, PaymentRequest};
use utxo_payment::FeeRate;

#[derive(Parser, Debug)]
#[clap(version)]
pub struct Cli {
    /// recipient address
    #[clap(value_parser)]
    recipient: String,

    /// amount to send, in whole currency units
    #[clap(value_parser)]
    amount: String,

    /// hex-encoded data to embed in an OP_RETURN output
    #[clap(long, value_parser)]
    metadata: Option<String>,

    /// fee rate in whole currency units per kilobyte. The default of 0.01 is
    /// 1,000,000 sat/kB (1,000 sat/B), far above typical mainnet rates, so pass
    /// this explicitly on mainnet
    #[clap(long, value_parser, default_value = "0.01")]
    fee_rate: String,

    /// use testnet endpoints and addresses
    #[clap(long)]
    testnet: bool,

    /// broadcast the signed transaction instead of printing it
    #[clap(long)]
    send: bool,

    /// path to config file
    #[clap(long, value_parser)]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    if let Err(err) = _main().await {
        tracing::error!("{:#}", err);
        std::process::exit(1);
    }
}

async fn _main() -> anyhow::Result<()> {
    // Start logging setup block
    let fmt_layer = tracing_subscriber::fmt::layer();

    let http_filter = tracing_subscriber::filter::Targets::new()
        .with_target("reqwest", tracing::Level::WARN)
        .with_target("hyper", tracing::Level::WARN)
        .with_default(tracing_subscriber::fmt::Subscriber::DEFAULT_MAX_LEVEL);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(http_filter)
        .init();

    let Cli {
        recipient,
        amount,
        metadata,
        fee_rate,
        testnet,
        send,
        config_path,
    } = Cli::parse();

    tracing::info!("Config file {:?}", config_path);
    let config = Config::load(&config_path)?;

    let network = if testnet {
        NetworkChoice::Testnet
    } else {
        NetworkChoice::Mainnet
    };
    let endpoints = config.endpoints(network)?;
    let key = config.signing_key(network)?;

    let amount = parse_whole_units(&amount).context("Cannot read payment amount")?;
    let fee_rate = FeeRate::from_sat_per_kb(
        parse_whole_units(&fee_rate).context("Cannot read fee rate")?,
    );
    let metadata = metadata
        .as_deref()
        .map(decode_metadata)
        .transpose()
        .context("Cannot read metadata")?;

    let request = PaymentRequest {
        recipient,
        amount,
        fee_rate,
        metadata,
    };

    let ledger = BitcoinLedger::new(network.bitcoin_network())
        .with_dust_threshold(config.dust_threshold);
    let client = ChainClient::new(endpoints)?;
    let sender = p2pkh_address(&key, ledger.network()).to_string();
    tracing::info!(
        "Sending {} to {} from {} at {}",
        request.amount,
        request.recipient,
        sender,
        request.fee_rate
    );

    let outcome = send_payment(&client, &ledger, &key, &sender, &request, send).await?;
    let payment = outcome.payment();
    tracing::info!(
        "Signed transaction: {} inputs, {} total, fee {} (estimated {}), change {}",
        payment.inputs.len(),
        payment.total_input,
        payment.exact_fee,
        payment.estimated_fee,
        payment.change_amount
    );

    match outcome {
        PaymentOutcome::Prepared(payment) => println!("{}", payment.hex),
        PaymentOutcome::Broadcast { txid, .. } => println!("{}", txid),
        PaymentOutcome::BroadcastFailed { payment, error } => {
            return Err(anyhow::Error::new(error)
                .context(format!("Broadcast failed, signed transaction: {}", payment.hex)));
        }
    }

    Ok(())
}
