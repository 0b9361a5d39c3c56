//! Token prices from CoinMarketCap and ERC-20 metadata over `eth_call`.

use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{TtlCache, ToolDeps, ToolError, ToolInput, check_settings, format_thousands, merge_settings, read_settings};
use crate::api::{ApiHandler, ApiRequest};
use crate::chain::{RpcClient, abi, validate_address};
use crate::config::Config;

pub const NAME: &str = "TokenTool";
pub const DESCRIPTION: &str = "Get cryptocurrency prices and token information. Use this for any price queries (BTC, ETH, etc)";

pub fn parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "command": { "type": "string", "enum": ["price", "info"], "default": "price", "description": "Command to execute" },
            "symbol": { "type": "string", "description": "Token symbol (e.g., BTC, ETH)" },
            "token_address": { "type": "string", "description": "Ethereum token contract address" }
        }
    })
}

fn default_command() -> String {
    "price".into()
}

#[derive(Debug, Deserialize)]
struct TokenParams {
    #[serde(default = "default_command")]
    command: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    token_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenSettings {
    /// Seconds a price quote stays fresh.
    pub cache_ttl: u64,
}

/// USD quote as returned by CoinMarketCap.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Quote {
    pub price: f64,
    #[serde(default)]
    pub market_cap: f64,
    #[serde(default)]
    pub volume_24h: f64,
    #[serde(default)]
    pub percent_change_24h: f64,
    #[serde(default)]
    pub last_updated: Option<String>,
}

impl Quote {
    pub fn formatted(&self) -> Value {
        json!({
            "price": format!("${}", format_thousands(self.price, 2)),
            "market_cap": format!("${}", format_thousands(self.market_cap, 0)),
            "volume_24h": format!("${}", format_thousands(self.volume_24h, 0)),
            "percent_change_24h": format!("{}%", format_thousands(self.percent_change_24h, 2)),
            "last_updated": self.last_updated,
        })
    }
}

#[derive(Debug)]
pub struct TokenTool {
    api: ApiHandler,
    rpc: RpcClient,
    base_url: String,
    api_key: Option<String>,
    settings: RwLock<TokenSettings>,
    prices: TtlCache<String, Quote>,
}

impl TokenTool {
    pub fn new(config: &Config, deps: &ToolDeps) -> Self {
        let ttl = config.analysis.token_price_cache_ttl;
        Self {
            api: deps.api.clone(),
            rpc: deps.rpc.clone(),
            base_url: config.apis.coinmarketcap_base_url.trim_end_matches('/').to_string(),
            api_key: config.secrets.cmc_api_key.clone(),
            settings: RwLock::new(TokenSettings { cache_ttl: ttl }),
            prices: TtlCache::new(Duration::from_secs(ttl)),
        }
    }

    pub fn validate_settings(&self, patch: &Value) -> Result<(), ToolError> {
        check_settings(&self.settings, patch)
    }

    pub fn update_settings(&self, patch: &Value) -> Result<(), ToolError> {
        merge_settings(&self.settings, patch)?;
        let settings = read_settings(&self.settings)?;
        self.prices.set_ttl(Duration::from_secs(settings.cache_ttl));
        Ok(())
    }

    pub async fn execute(&self, input: ToolInput) -> Result<Value, ToolError> {
        let params: TokenParams = input.parse(|symbol| TokenParams {
            command: default_command(),
            symbol: Some(symbol),
            token_address: None,
        })?;

        match (params.command.as_str(), params.symbol, params.token_address) {
            ("price", Some(symbol), _) if !symbol.trim().is_empty() => {
                Ok(self.current_price(&symbol).await?.formatted())
            }
            (_, _, Some(address)) => Ok(json!({ "token_info": self.token_info(&address).await? })),
            _ => Err(ToolError::InvalidInput("Invalid command or missing parameters".into())),
        }
    }

    pub async fn current_price(&self, symbol: &str) -> Result<Quote, ToolError> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ToolError::InvalidInput(format!(
                "Invalid symbol format: {symbol}. Symbols must be alphanumeric."
            )));
        }
        if let Some(quote) = self.prices.get(&symbol) {
            debug!(%symbol, "price cache hit");
            return Ok(quote);
        }

        let mut request = ApiRequest::get("coinmarketcap", format!("{}/cryptocurrency/quotes/latest", self.base_url))
            .query("symbol", &symbol)
            .query("convert", "USD");
        if let Some(key) = &self.api_key {
            request = request.header("X-CMC_PRO_API_KEY", key);
        }
        let data = self.api.make_request(request).await?.data;
        let quote = extract_quote(&data, &symbol)?;
        info!(%symbol, price = quote.price, "fetched price");
        self.prices.insert(symbol, quote.clone());
        Ok(quote)
    }

    /// ERC-20 metadata read straight from the contract.
    pub async fn token_info(&self, address: &str) -> Result<Value, ToolError> {
        if !validate_address(address) {
            return Err(ToolError::InvalidInput("Invalid token address".into()));
        }
        let name = abi::decode_string(&self.rpc.call(address, abi::NAME).await?)?;
        let symbol = abi::decode_string(&self.rpc.call(address, abi::SYMBOL).await?)?;
        let decimals = abi::decode_uint256(&self.rpc.call(address, abi::DECIMALS).await?)?;
        let raw_supply = abi::decode_uint256(&self.rpc.call(address, abi::TOTAL_SUPPLY).await?)?;
        let decimals = u32::try_from(decimals)
            .map_err(|_| ToolError::Upstream(format!("implausible decimals: {decimals}")))?;
        Ok(json!({
            "address": address,
            "name": name,
            "symbol": symbol,
            "decimals": decimals,
            "total_supply": raw_supply as f64 / 10f64.powi(decimals as i32),
        }))
    }
}

/// `data[SYMBOL].quote.USD`. Newer API versions wrap the entry in an array.
fn extract_quote(data: &Value, symbol: &str) -> Result<Quote, ToolError> {
    let entries = data
        .get("data")
        .ok_or_else(|| ToolError::Upstream("Invalid API response format".into()))?;
    let entry = match entries.get(symbol) {
        Some(Value::Array(items)) => items.first(),
        other => other,
    }
    .ok_or_else(|| ToolError::NotFound(format!("No data found for symbol {symbol}")))?;
    let usd = entry
        .pointer("/quote/USD")
        .ok_or_else(|| ToolError::Upstream("Missing price data in response".into()))?;
    serde_json::from_value(usd.clone()).map_err(|e| ToolError::Upstream(format!("Missing price data in response: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::subsystems::tools::testing::{ADDRESS, deps, spawn};
    use axum::{Json, Router, extract::Query, http::HeaderMap, routing::{get, post}};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn cmc_body(symbol: &str) -> Value {
        json!({ "data": { symbol: { "quote": { "USD": {
            "price": 64321.456, "market_cap": 1265000000000.4, "volume_24h": 35123456789.9,
            "percent_change_24h": -1.234, "last_updated": "2024-05-01T00:00:00.000Z"
        }}}}})
    }

    #[test]
    fn quote_formatting() {
        let quote = extract_quote(&cmc_body("BTC"), "BTC").unwrap();
        assert_eq!(
            quote.formatted(),
            json!({
                "price": "$64,321.46",
                "market_cap": "$1,265,000,000,000",
                "volume_24h": "$35,123,456,790",
                "percent_change_24h": "-1.23%",
                "last_updated": "2024-05-01T00:00:00.000Z"
            })
        );
    }

    #[test]
    fn quote_extraction_accepts_array_entries_and_reports_missing_symbols() {
        let wrapped = json!({ "data": { "ETH": [{ "quote": { "USD": { "price": 3000.0 } } }] } });
        assert_eq!(extract_quote(&wrapped, "ETH").unwrap().price, 3000.0);
        let err = extract_quote(&json!({ "data": {} }), "XYZ").unwrap_err();
        assert_eq!(err.to_string(), "No data found for symbol XYZ");
        assert!(extract_quote(&json!({ "status": {} }), "ETH").is_err());
    }

    async fn mock_cmc(hits: Arc<AtomicUsize>) -> String {
        spawn(Router::new().route(
            "/cryptocurrency/quotes/latest",
            get(move |headers: HeaderMap, Query(q): Query<HashMap<String, String>>| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(headers.get("x-cmc_pro_api_key").map(|v| v.to_str().unwrap()), Some("test-key"));
                    Json(cmc_body(q.get("symbol").map(String::as_str).unwrap_or_default()))
                }
            }),
        ))
        .await
    }

    #[tokio::test]
    async fn price_lookup_is_cached_and_accepts_bare_symbols() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = mock_cmc(Arc::clone(&hits)).await;
        let temp = TempDir::new().unwrap();
        let mut config = Config::test_default(temp.path());
        config.apis.coinmarketcap_base_url = base;
        config.secrets.cmc_api_key = Some("test-key".into());
        let tool = TokenTool::new(&config, &deps(temp.path(), "http://127.0.0.1:1"));

        let first = tool.execute(ToolInput::Text("btc".into())).await.unwrap();
        assert_eq!(first["price"], "$64,321.46");
        let second = tool
            .execute(ToolInput::from_value(json!({ "command": "price", "symbol": "BTC" })))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let err = tool.execute(ToolInput::Text("BTC-USD".into())).await.unwrap_err();
        assert!(err.to_string().starts_with("Invalid symbol format"));
    }

    #[tokio::test]
    async fn missing_parameters_are_rejected() {
        let temp = TempDir::new().unwrap();
        let config = Config::test_default(temp.path());
        let tool = TokenTool::new(&config, &deps(temp.path(), "http://127.0.0.1:1"));
        let err = tool.execute(ToolInput::from_value(json!({ "command": "info" }))).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid command or missing parameters");
    }

    fn abi_string(s: &str) -> String {
        let mut word = format!("{:064x}{:064x}", 32, s.len());
        let mut data = hex::encode(s);
        while data.len() % 64 != 0 {
            data.push('0');
        }
        word.push_str(&data);
        format!("0x{word}")
    }

    #[tokio::test]
    async fn token_info_decodes_erc20_calls() {
        let base = spawn(Router::new().route(
            "/",
            post(|Json(req): Json<Value>| async move {
                let data = req["params"][0]["data"].as_str().unwrap_or_default().to_string();
                let result = match data.as_str() {
                    abi::NAME => abi_string("USD Coin"),
                    abi::SYMBOL => abi_string("USDC"),
                    abi::DECIMALS => format!("0x{:064x}", 6),
                    abi::TOTAL_SUPPLY => format!("0x{:064x}", 25_000_000_000_000u64),
                    _ => "0x".to_string(),
                };
                Json(json!({ "jsonrpc": "2.0", "id": req["id"], "result": result }))
            }),
        ))
        .await;
        let temp = TempDir::new().unwrap();
        let config = Config::test_default(temp.path());
        let tool = TokenTool::new(&config, &deps(temp.path(), &base));

        let out = tool
            .execute(ToolInput::from_value(json!({ "command": "info", "token_address": ADDRESS })))
            .await
            .unwrap();
        let info = &out["token_info"];
        assert_eq!(info["name"], "USD Coin");
        assert_eq!(info["symbol"], "USDC");
        assert_eq!(info["decimals"], 6);
        assert_eq!(info["total_supply"], 25_000_000.0);
    }
}
