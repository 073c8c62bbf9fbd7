use crate::error::{PaymentError, PaymentResult};
use crate::ledger::DEFAULT_DUST_THRESHOLD;

use bitcoin::{Network, NetworkKind, PrivateKey};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;

/// Environment variable consulted when the config file has no `private_key`.
pub const PRIVATE_KEY_ENV: &str = "SENDER_WIF";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkChoice {
    Mainnet,
    Testnet,
}

impl NetworkChoice {
    pub fn bitcoin_network(self) -> Network {
        match self {
            NetworkChoice::Mainnet => Network::Bitcoin,
            NetworkChoice::Testnet => Network::Testnet,
        }
    }

    fn name(self) -> &'static str {
        match self {
            NetworkChoice::Mainnet => "mainnet",
            NetworkChoice::Testnet => "testnet",
        }
    }
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

fn default_dust_threshold() -> u64 {
    DEFAULT_DUST_THRESHOLD
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub utxo_endpoint: String,
    pub api_key: String,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    private_key: Option<String>,
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold: u64,
    #[serde(default)]
    mainnet: Option<EndpointConfig>,
    #[serde(default)]
    testnet: Option<EndpointConfig>,
}

impl Config {
    pub fn load(path: &Path) -> PaymentResult<Config> {
        let file = File::open(path).map_err(|err| {
            PaymentError::ConfigurationMissing(format!(
                "cannot read config file {}: {}",
                path.display(),
                err
            ))
        })?;
        serde_yaml::from_reader(file).map_err(|err| {
            PaymentError::ConfigurationMissing(format!(
                "cannot parse config file {}: {}",
                path.display(),
                err
            ))
        })
    }

    pub fn from_yaml(yaml: &str) -> PaymentResult<Config> {
        serde_yaml::from_str(yaml).map_err(|err| {
            PaymentError::ConfigurationMissing(format!("cannot parse config: {}", err))
        })
    }

    pub fn endpoints(&self, network: NetworkChoice) -> PaymentResult<&EndpointConfig> {
        let endpoints = match network {
            NetworkChoice::Mainnet => self.mainnet.as_ref(),
            NetworkChoice::Testnet => self.testnet.as_ref(),
        };
        endpoints.ok_or_else(|| {
            PaymentError::ConfigurationMissing(format!(
                "no `{}` section in config",
                network.name()
            ))
        })
    }

    /// Resolves the sender key from the config file, falling back to
    /// `SENDER_WIF`.
    pub fn signing_key(&self, network: NetworkChoice) -> PaymentResult<PrivateKey> {
        self.signing_key_with(network, std::env::var(PRIVATE_KEY_ENV).ok())
    }

    fn signing_key_with(
        &self,
        network: NetworkChoice,
        from_env: Option<String>,
    ) -> PaymentResult<PrivateKey> {
        let wif = self
            .private_key
            .clone()
            .or(from_env)
            .filter(|wif| !wif.trim().is_empty())
            .ok_or_else(|| {
                PaymentError::ConfigurationMissing(format!(
                    "no private key in config or {}",
                    PRIVATE_KEY_ENV
                ))
            })?;

        let key = PrivateKey::from_wif(wif.trim()).map_err(|err| {
            PaymentError::ConfigurationMissing(format!("private key is not valid WIF: {}", err))
        })?;
        if key.network != NetworkKind::from(network.bitcoin_network()) {
            return Err(PaymentError::ConfigurationMissing(format!(
                "private key does not belong to {}",
                network.name()
            )));
        }
        Ok(key)
    }
}
