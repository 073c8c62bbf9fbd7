use crate::config::EndpointConfig;
use crate::error::{PaymentError, PaymentResult};
use crate::utxo::{ProviderUtxo, Utxo};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'static str,
    params: [&'a str; 1],
}

#[derive(Clone, Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RpcResponse {
    pub result: Option<String>,
    pub error: Option<RpcError>,
}

/// Source of spendable outputs and sink for signed transactions.
#[async_trait]
pub trait ChainBackend: Sync {
    async fn fetch_utxos(&self, address: &str) -> PaymentResult<Vec<Utxo>>;
    async fn broadcast(&self, raw_transaction: &str) -> PaymentResult<String>;
}

/// HTTP client for the chain data provider and the node's JSON-RPC endpoint.
/// Every call is one-shot; failures surface as `NetworkFailure`.
pub struct ChainClient {
    client: Client,
    utxo_endpoint: String,
    rpc_url: String,
    rpc_user: String,
    rpc_password: String,
}

fn url(endpoint: &str, api: impl fmt::Display) -> String {
    format!("{}/{api}", endpoint.trim_end_matches('/'))
}

impl ChainClient {
    pub fn new(config: &EndpointConfig) -> PaymentResult<Self> {
        let mut headers = HeaderMap::new();
        headers.append(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let key_header = HeaderName::from_bytes(config.api_key_header.as_bytes()).map_err(|_| {
            PaymentError::ConfigurationMissing(format!(
                "api key header {:?} is not a valid header name",
                config.api_key_header
            ))
        })?;
        headers.append(
            key_header,
            HeaderValue::from_str(&config.api_key).map_err(|_| {
                PaymentError::ConfigurationMissing(
                    "the api key is not in a valid format".to_string(),
                )
            })?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| {
                PaymentError::NetworkFailure(format!("failed to build HTTP client: {}", err))
            })?;

        Ok(Self {
            client,
            utxo_endpoint: config.utxo_endpoint.clone(),
            rpc_url: config.rpc_url.clone(),
            rpc_user: config.rpc_user.clone(),
            rpc_password: config.rpc_password.clone(),
        })
    }
}

#[async_trait]
impl ChainBackend for ChainClient {
    async fn fetch_utxos(&self, address: &str) -> PaymentResult<Vec<Utxo>> {
        let response = self
            .client
            .get(url(&self.utxo_endpoint, format!("utxo/{}", address)))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.text().await?;
                parse_utxos(&body)
            }
            code => Err(PaymentError::NetworkFailure(format!(
                "utxo provider answered {:?} for {}",
                code, address
            ))),
        }
    }

    async fn broadcast(&self, raw_transaction: &str) -> PaymentResult<String> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: "send_payment",
            method: "sendrawtransaction",
            params: [raw_transaction],
        };
        let response = self
            .client
            .post(&self.rpc_url)
            .basic_auth(&self.rpc_user, Some(&self.rpc_password))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        parse_rpc_response(status, &body)
    }
}

pub fn parse_utxos(body: &str) -> PaymentResult<Vec<Utxo>> {
    let records: Vec<ProviderUtxo> = serde_json::from_str(body).map_err(|err| {
        PaymentError::NetworkFailure(format!("unexpected utxo provider payload: {}", err))
    })?;
    records.into_iter().map(Utxo::try_from).collect()
}

/// Nodes answer RPC errors with a non-2xx status and a JSON body, so the body
/// is inspected before the status.
pub fn parse_rpc_response(status: StatusCode, body: &str) -> PaymentResult<String> {
    let response: RpcResponse = match serde_json::from_str(body) {
        Ok(response) => response,
        Err(err) => {
            return Err(PaymentError::NetworkFailure(format!(
                "broadcast answered {:?} with unreadable body: {}",
                status, err
            )))
        }
    };

    if let Some(error) = response.error {
        return Err(PaymentError::NetworkFailure(format!(
            "broadcast rejected ({}): {}",
            error.code, error.message
        )));
    }
    if !status.is_success() {
        return Err(PaymentError::NetworkFailure(format!(
            "broadcast answered {:?}",
            status
        )));
    }
    response.result.ok_or_else(|| {
        PaymentError::NetworkFailure("broadcast returned no transaction id".to_string())
    })
}
