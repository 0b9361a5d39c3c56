//! Wallet analysis: ETH balance, ERC-20 holdings and transaction patterns.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{ToolDeps, ToolError, ToolInput, check_settings, merge_settings, read_settings};
use crate::api::{ApiHandler, ApiRequest};
use crate::chain::{RpcClient, parse_decimal, validate_address, wei_to_eth};
use crate::config::Config;
use crate::visualization;

pub const NAME: &str = "WalletTool";
pub const DESCRIPTION: &str = "Analyzes Ethereum wallet activity and metrics. Input: an address or {\"address\": \"0x...\", \"limit\": 100}";

const NO_TRANSACTIONS: &str = "No transactions found";

pub fn parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "address": { "type": "string", "description": "Ethereum wallet address to analyze" },
            "limit": { "type": "integer", "description": "Maximum number of transactions to analyze" },
            "include_chart": { "type": "boolean", "default": false, "description": "Attach a token distribution chart" }
        },
        "required": ["address"]
    })
}

#[derive(Debug, Deserialize)]
struct WalletParams {
    address: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    include_chart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WalletSettings {
    /// Transactions fetched when the caller gives no limit.
    pub default_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenBalance {
    pub contract_address: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u32,
    pub balance: f64,
}

#[derive(Debug)]
pub struct WalletTool {
    api: ApiHandler,
    rpc: RpcClient,
    explorer_api: String,
    api_key: Option<String>,
    settings: RwLock<WalletSettings>,
}

impl WalletTool {
    pub fn new(config: &Config, deps: &ToolDeps) -> Self {
        Self {
            api: deps.api.clone(),
            rpc: deps.rpc.clone(),
            explorer_api: config.chain.explorer_api.clone(),
            api_key: config.secrets.etherscan_api_key.clone(),
            settings: RwLock::new(WalletSettings { default_limit: config.analysis.wallet_depth }),
        }
    }

    pub fn validate_settings(&self, patch: &Value) -> Result<(), ToolError> {
        check_settings(&self.settings, patch)
    }

    pub fn update_settings(&self, patch: &Value) -> Result<(), ToolError> {
        merge_settings(&self.settings, patch)
    }

    pub async fn execute(&self, input: ToolInput) -> Result<Value, ToolError> {
        let params: WalletParams = input.parse(|address| WalletParams { address, limit: None, include_chart: false })?;
        if !validate_address(&params.address) {
            return Err(ToolError::InvalidInput("Invalid Ethereum address".into()));
        }
        let settings = read_settings(&self.settings)?;
        let limit = params.limit.unwrap_or(settings.default_limit);

        let eth_balance = wei_to_eth(self.rpc.get_balance(&params.address).await?);
        let token_balances = self.token_balances(&params.address).await?;
        let txs = self.transaction_history(&params.address, limit).await?;
        let analysis = analyze_transactions(&txs, &params.address)?;

        let mut result = json!({
            "address": params.address,
            "eth_balance": eth_balance,
            "token_balances": token_balances,
            "transaction_analysis": analysis,
        });
        if params.include_chart {
            let mut holdings = vec![("ETH".to_string(), eth_balance)];
            holdings.extend(token_balances.iter().map(|t| (t.symbol.clone(), t.balance)));
            result["chart"] = visualization::token_distribution(&holdings, "Token Distribution");
        }
        Ok(result)
    }

    /// Etherscan `account` module call; returns the `result` array.
    async fn etherscan(&self, action: &str, address: &str, extra: &[(&str, String)]) -> Result<Vec<Value>, ToolError> {
        let mut request = ApiRequest::get("etherscan", &self.explorer_api)
            .query("module", "account")
            .query("action", action)
            .query("address", address)
            .query("startblock", 0)
            .query("endblock", 99_999_999)
            .query("sort", "desc");
        for (key, value) in extra {
            request = request.query(*key, value);
        }
        if let Some(key) = &self.api_key {
            request = request.query("apikey", key);
        }
        let data = self.api.make_request(request).await?.data;
        parse_etherscan_result(action, data)
    }

    /// Current ERC-20 holdings reconstructed from transfer history:
    /// inbound minus outbound per contract, keeping positive balances.
    pub async fn token_balances(&self, address: &str) -> Result<Vec<TokenBalance>, ToolError> {
        let transfers = self.etherscan("tokentx", address, &[]).await?;
        aggregate_token_balances(&transfers, address)
    }

    pub async fn transaction_history(&self, address: &str, limit: usize) -> Result<Vec<Value>, ToolError> {
        let txs = self
            .etherscan("txlist", address, &[("page", "1".into()), ("offset", limit.to_string())])
            .await?;
        debug!(%address, count = txs.len(), "fetched transactions");
        Ok(txs)
    }
}

fn parse_etherscan_result(action: &str, data: Value) -> Result<Vec<Value>, ToolError> {
    let status = data.get("status").and_then(Value::as_str).unwrap_or_default();
    let message = data.get("message").and_then(Value::as_str).unwrap_or_default();
    if status != "1" {
        if message.starts_with(NO_TRANSACTIONS) {
            return Ok(Vec::new());
        }
        let detail = match data.get("result") {
            Some(Value::String(s)) if !s.is_empty() => format!("{message}: {s}"),
            _ => message.to_string(),
        };
        return Err(ToolError::Upstream(format!("Failed to fetch {action}: {detail}")));
    }
    match data.get("result") {
        Some(Value::Array(items)) => Ok(items.clone()),
        _ => Ok(Vec::new()),
    }
}

fn field<'a>(entry: &'a Value, key: &str) -> &'a str {
    entry.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn decimal_field(entry: &Value, key: &str) -> Result<u128, ToolError> {
    Ok(parse_decimal(field(entry, key))?)
}

pub fn aggregate_token_balances(transfers: &[Value], address: &str) -> Result<Vec<TokenBalance>, ToolError> {
    struct Running {
        name: String,
        symbol: String,
        decimals: u32,
        raw: i128,
    }

    let mut order: Vec<String> = Vec::new();
    let mut running: HashMap<String, Running> = HashMap::new();
    for tx in transfers {
        let contract = field(tx, "contractAddress").to_lowercase();
        // Spam tokens mint uint256 amounts no real balance reaches.
        let value = match decimal_field(tx, "value").map(i128::try_from) {
            Ok(Ok(v)) => v,
            _ => {
                warn!(%contract, value = field(tx, "value"), "skipping unrepresentable token transfer");
                continue;
            }
        };
        let entry = running.entry(contract.clone()).or_insert_with(|| {
            order.push(contract.clone());
            Running {
                name: field(tx, "tokenName").to_string(),
                symbol: field(tx, "tokenSymbol").to_string(),
                decimals: field(tx, "tokenDecimal").parse().unwrap_or(0),
                raw: 0,
            }
        });
        if field(tx, "to").eq_ignore_ascii_case(address) {
            entry.raw = entry.raw.saturating_add(value);
        }
        if field(tx, "from").eq_ignore_ascii_case(address) {
            entry.raw = entry.raw.saturating_sub(value);
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|contract| {
            let r = running.remove(&contract)?;
            (r.raw > 0).then(|| TokenBalance {
                balance: r.raw as f64 / 10f64.powi(r.decimals as i32),
                contract_address: contract,
                name: r.name,
                symbol: r.symbol,
                decimals: r.decimals,
            })
        })
        .collect())
}

/// Totals over a transaction list, as seen from `address`. Empty input
/// yields an empty object.
pub fn analyze_transactions(txs: &[Value], address: &str) -> Result<Value, ToolError> {
    if txs.is_empty() {
        return Ok(json!({}));
    }
    let mut sent: u128 = 0;
    let mut received: u128 = 0;
    let mut gas: u128 = 0;
    let mut counterparties: HashSet<String> = HashSet::new();
    let mut last_activity: Option<u64> = None;

    for tx in txs {
        let value = decimal_field(tx, "value")?;
        gas = gas.saturating_add(decimal_field(tx, "gasUsed")?.saturating_mul(decimal_field(tx, "gasPrice")?));
        if field(tx, "from").eq_ignore_ascii_case(address) {
            sent = sent.saturating_add(value);
            counterparties.insert(field(tx, "to").to_lowercase());
        } else {
            received = received.saturating_add(value);
            counterparties.insert(field(tx, "from").to_lowercase());
        }
        if let Ok(ts) = field(tx, "timeStamp").parse::<u64>() {
            last_activity = Some(last_activity.map_or(ts, |prev| prev.max(ts)));
        }
    }

    Ok(json!({
        "total_transactions": txs.len(),
        "total_sent_eth": wei_to_eth(sent),
        "total_received_eth": wei_to_eth(received),
        "gas_spent_eth": wei_to_eth(gas),
        "unique_interactions": counterparties.len(),
        "last_activity": last_activity.map(|ts| ts.to_string()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::tools::testing::{ADDRESS, deps, spawn};
    use axum::{Json, Router, extract::Query, routing::{get, post}};
    use tempfile::TempDir;

    const OTHER: &str = "0x1111111111111111111111111111111111111111";
    const TOKEN: &str = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";

    fn transfer(from: &str, to: &str, value: &str) -> Value {
        json!({
            "contractAddress": TOKEN, "tokenName": "USD Coin", "tokenSymbol": "USDC",
            "tokenDecimal": "6", "value": value, "from": from, "to": to
        })
    }

    fn tx(from: &str, to: &str, value: &str, ts: &str) -> Value {
        json!({ "from": from, "to": to, "value": value, "gasUsed": "21000", "gasPrice": "1000000000", "timeStamp": ts })
    }

    #[test]
    fn token_balances_are_inbound_minus_outbound() {
        let transfers = [
            transfer(OTHER, &ADDRESS.to_lowercase(), "5000000"),
            transfer(ADDRESS, OTHER, "1500000"),
        ];
        let balances = aggregate_token_balances(&transfers, ADDRESS).unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].symbol, "USDC");
        assert!((balances[0].balance - 3.5).abs() < 1e-9);

        let drained = [transfer(OTHER, ADDRESS, "10"), transfer(ADDRESS, OTHER, "10")];
        assert!(aggregate_token_balances(&drained, ADDRESS).unwrap().is_empty());
    }

    #[test]
    fn oversized_spam_transfer_does_not_hide_other_balances() {
        let mut spam = transfer(OTHER, ADDRESS, &format!("1{}", "0".repeat(40)));
        spam["contractAddress"] = json!(OTHER);
        spam["tokenSymbol"] = json!("SPAM");
        let transfers = [spam, transfer(OTHER, ADDRESS, "2000000")];

        let balances = aggregate_token_balances(&transfers, ADDRESS).unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].symbol, "USDC");
        assert!((balances[0].balance - 2.0).abs() < 1e-9);
    }

    #[test]
    fn analysis_totals() {
        let txs = [
            tx(ADDRESS, OTHER, "1000000000000000000", "1700000000"),
            tx(OTHER, ADDRESS, "500000000000000000", "1700000100"),
            tx(ADDRESS, OTHER, "0", "1600000000"),
        ];
        let a = analyze_transactions(&txs, ADDRESS).unwrap();
        assert_eq!(a["total_transactions"], 3);
        assert_eq!(a["total_sent_eth"], 1.0);
        assert_eq!(a["total_received_eth"], 0.5);
        assert_eq!(a["unique_interactions"], 1);
        assert_eq!(a["last_activity"], "1700000100");
        assert!((a["gas_spent_eth"].as_f64().unwrap() - 0.000063).abs() < 1e-12);
        assert_eq!(analyze_transactions(&[], ADDRESS).unwrap(), json!({}));
    }

    #[test]
    fn etherscan_status_handling() {
        let empty = json!({ "status": "0", "message": "No transactions found", "result": [] });
        assert!(parse_etherscan_result("txlist", empty).unwrap().is_empty());
        let bad = json!({ "status": "0", "message": "NOTOK", "result": "Invalid API Key" });
        let err = parse_etherscan_result("txlist", bad).unwrap_err();
        assert_eq!(err.to_string(), "Failed to fetch txlist: NOTOK: Invalid API Key");
    }

    async fn explorer(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        match q.get("action").map(String::as_str) {
            Some("tokentx") => Json(json!({ "status": "1", "message": "OK", "result": [transfer(OTHER, ADDRESS, "2000000")] })),
            Some("txlist") => {
                assert_eq!(q.get("offset").map(String::as_str), Some("7"));
                assert_eq!(q.get("page").map(String::as_str), Some("1"));
                Json(json!({ "status": "1", "message": "OK", "result": [tx(OTHER, ADDRESS, "1000000000000000000", "1700000000")] }))
            }
            _ => Json(json!({ "status": "0", "message": "NOTOK", "result": "unknown action" })),
        }
    }

    #[tokio::test]
    async fn end_to_end_against_mock_explorer_and_node() {
        let base = spawn(
            Router::new()
                .route("/api", get(explorer))
                .route("/rpc", post(|Json(req): Json<Value>| async move {
                    Json(json!({ "jsonrpc": "2.0", "id": req["id"], "result": "0x1bc16d674ec80000" }))
                })),
        )
        .await;
        let temp = TempDir::new().unwrap();
        let mut config = Config::test_default(temp.path());
        config.chain.explorer_api = format!("{base}/api");
        let tool = WalletTool::new(&config, &deps(temp.path(), &format!("{base}/rpc")));

        let out = tool
            .execute(ToolInput::from_value(json!({ "address": ADDRESS, "limit": 7, "include_chart": true })))
            .await
            .unwrap();
        assert_eq!(out["eth_balance"], 2.0);
        assert_eq!(out["token_balances"][0]["balance"], 2.0);
        assert_eq!(out["transaction_analysis"]["total_received_eth"], 1.0);
        assert_eq!(out["chart"]["data"][0]["labels"], json!(["ETH", "USDC"]));

        let err = tool.execute(ToolInput::Text("0x123".into())).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid Ethereum address");
    }

    #[test]
    fn settings_update_changes_default_limit() {
        let temp = TempDir::new().unwrap();
        let config = Config::test_default(temp.path());
        let tool = WalletTool::new(&config, &deps(temp.path(), "http://127.0.0.1:1"));
        tool.update_settings(&json!({ "default_limit": 25 })).unwrap();
        assert_eq!(read_settings(&tool.settings).unwrap().default_limit, 25);
        assert!(tool.update_settings(&json!({ "depth": 1 })).is_err());
    }
}
