//! Ethereum JSON-RPC 2.0 client over HTTP.
//!
//! Providers are tried in order: the primary URI first, then each fallback.
//! A transport failure moves on to the next provider; an RPC error reply is
//! returned as-is because another node would answer the same way.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{ChainError, parse_quantity, validate_address, validate_transaction_hash};

#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    urls: Arc<Vec<String>>,
    next_id: Arc<AtomicU64>,
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl RpcClient {
    pub fn new(primary: &str, fallbacks: &[String], timeout: Duration) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Transport(format!("failed to build HTTP client: {e}")))?;
        let urls: Vec<String> = std::iter::once(primary.to_string())
            .chain(fallbacks.iter().cloned())
            .filter(|u| !u.trim().is_empty())
            .collect();
        Ok(Self { client, urls: Arc::new(urls), next_id: Arc::new(AtomicU64::new(1)) })
    }

    pub fn providers(&self) -> &[String] {
        &self.urls
    }

    /// Raw JSON-RPC call returning the `result` member.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        if self.urls.is_empty() {
            return Err(ChainError::Transport("no web3 provider configured".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let mut last_err = ChainError::Transport("no provider attempted".into());
        for url in self.urls.iter() {
            debug!(%url, %method, id, "rpc request");
            let reply = match self.client.post(url).json(&body).send().await {
                Ok(resp) => resp.json::<RpcReply>().await,
                Err(e) => {
                    warn!(%url, %method, error = %e, "rpc provider unreachable, trying next");
                    last_err = ChainError::Transport(e.to_string());
                    continue;
                }
            };
            let reply = match reply {
                Ok(r) => r,
                Err(e) => {
                    warn!(%url, %method, error = %e, "rpc reply not decodable, trying next");
                    last_err = ChainError::Decode(e.to_string());
                    continue;
                }
            };
            if let Some(err) = reply.error {
                return Err(ChainError::Rpc { code: err.code, message: err.message });
            }
            return Ok(reply.result.unwrap_or(Value::Null));
        }
        Err(last_err)
    }

    async fn quantity(&self, method: &str, params: Value) -> Result<u128, ChainError> {
        let value = self.request(method, params).await?;
        let text = value
            .as_str()
            .ok_or_else(|| ChainError::Decode(format!("{method}: expected hex string, got {value}")))?;
        parse_quantity(text)
    }

    pub async fn block_number(&self) -> Result<u64, ChainError> {
        let n = self.quantity("eth_blockNumber", json!([])).await?;
        u64::try_from(n).map_err(|e| ChainError::Decode(e.to_string()))
    }

    /// Balance in wei at the latest block.
    pub async fn get_balance(&self, address: &str) -> Result<u128, ChainError> {
        check_address(address)?;
        self.quantity("eth_getBalance", json!([address, "latest"])).await
    }

    pub async fn get_block_latest(&self) -> Result<Value, ChainError> {
        self.request("eth_getBlockByNumber", json!(["latest", false])).await
    }

    /// `None` while the transaction is pending or unknown.
    pub async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<Value>, ChainError> {
        if !validate_transaction_hash(hash) {
            return Err(ChainError::InvalidHash(hash.to_string()));
        }
        let value = self.request("eth_getTransactionReceipt", json!([hash])).await?;
        Ok((!value.is_null()).then_some(value))
    }

    pub async fn estimate_gas(
        &self,
        to: &str,
        from: Option<&str>,
        value: Option<u128>,
        data: Option<&str>,
    ) -> Result<u64, ChainError> {
        check_address(to)?;
        let mut tx = json!({ "to": to });
        if let Some(from) = from {
            check_address(from)?;
            tx["from"] = json!(from);
        }
        if let Some(value) = value {
            tx["value"] = json!(format!("{value:#x}"));
        }
        if let Some(data) = data {
            tx["data"] = json!(data);
        }
        let gas = self.quantity("eth_estimateGas", json!([tx])).await?;
        u64::try_from(gas).map_err(|e| ChainError::Decode(e.to_string()))
    }

    pub async fn get_logs(
        &self,
        address: &str,
        topics: &[String],
        from_block: Option<u64>,
        to_block: Option<u64>,
    ) -> Result<Vec<Value>, ChainError> {
        check_address(address)?;
        let block = |b: Option<u64>| b.map(|n| format!("{n:#x}")).unwrap_or_else(|| "latest".into());
        let filter = json!({
            "address": address,
            "topics": topics,
            "fromBlock": block(from_block),
            "toBlock": block(to_block),
        });
        match self.request("eth_getLogs", json!([filter])).await? {
            Value::Array(logs) => Ok(logs),
            Value::Null => Ok(Vec::new()),
            other => Err(ChainError::Decode(format!("eth_getLogs: expected array, got {other}"))),
        }
    }

    /// `eth_call` against the latest block; returns the hex return data.
    pub async fn call(&self, to: &str, data: &str) -> Result<String, ChainError> {
        check_address(to)?;
        let value = self.request("eth_call", json!([{ "to": to, "data": data }, "latest"])).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::Decode(format!("eth_call: expected hex string, got {value}")))
    }
}

fn check_address(address: &str) -> Result<(), ChainError> {
    if validate_address(address) {
        Ok(())
    } else {
        Err(ChainError::InvalidAddress(address.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};

    async fn spawn_node(reply: fn(&Value) -> Value) -> String {
        let app = Router::new().route(
            "/",
            post(move |Json(req): Json<Value>| async move {
                let mut body = reply(&req);
                body["jsonrpc"] = json!("2.0");
                body["id"] = req["id"].clone();
                Json(body)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn node_reply(req: &Value) -> Value {
        match req["method"].as_str().unwrap_or_default() {
            "eth_blockNumber" => json!({ "result": "0x10" }),
            "eth_getBalance" => json!({ "result": "0xde0b6b3a7640000" }),
            "eth_getTransactionReceipt" => json!({ "result": null }),
            _ => json!({ "error": { "code": -32601, "message": "method not found" } }),
        }
    }

    #[tokio::test]
    async fn falls_back_when_primary_is_down() {
        let good = spawn_node(node_reply).await;
        let client =
            RpcClient::new("http://127.0.0.1:1/", &[good], Duration::from_secs(2)).unwrap();
        assert_eq!(client.block_number().await.unwrap(), 16);
        let addr = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
        assert_eq!(client.get_balance(addr).await.unwrap(), 1_000_000_000_000_000_000);
    }

    #[tokio::test]
    async fn rpc_errors_and_null_results() {
        let url = spawn_node(node_reply).await;
        let client = RpcClient::new(&url, &[], Duration::from_secs(2)).unwrap();
        let err = client.get_block_latest().await.unwrap_err();
        assert!(matches!(err, ChainError::Rpc { code: -32601, .. }));
        let hash = format!("0x{}", "ab".repeat(32));
        assert!(client.get_transaction_receipt(&hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn validates_before_sending() {
        let client = RpcClient::new("", &[], Duration::from_secs(1)).unwrap();
        assert!(matches!(client.get_balance("0x12").await, Err(ChainError::InvalidAddress(_))));
        assert!(matches!(client.block_number().await, Err(ChainError::Transport(_))));
    }
}
