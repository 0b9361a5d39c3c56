//! NFT collection analytics backed by the OpenSea API.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{TtlCache, ToolDeps, ToolError, ToolInput, check_settings, merge_settings, read_settings};
use crate::api::{ApiHandler, ApiRequest};
use crate::chain::{WEI_PER_ETH, validate_address};
use crate::config::Config;
use crate::visualization::{self, SeriesPoint};

pub const NAME: &str = "NFTTool";
pub const DESCRIPTION: &str = "Analyzes NFT collections and markets. Input: {\"contract_address\": \"0x...\", \"include_rarity\": false, \"include_sales\": false}";

const PAGE_SIZE: usize = 50;
const RAREST_KEPT: usize = 10;

const STAT_FIELDS: [&str; 12] = [
    "floor_price",
    "total_supply",
    "num_owners",
    "total_volume",
    "average_price",
    "market_cap",
    "one_day_volume",
    "one_day_sales",
    "one_day_average_price",
    "seven_day_volume",
    "seven_day_sales",
    "seven_day_average_price",
];

pub fn parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "contract_address": { "type": "string", "description": "NFT contract address to analyze" },
            "token_id": { "type": ["integer", "string"], "description": "Specific token ID to analyze" },
            "include_rarity": { "type": "boolean", "default": false, "description": "Include rarity analysis" },
            "include_sales": { "type": "boolean", "default": false, "description": "Include sales history and analysis" },
            "days": { "type": "integer", "default": 30, "description": "Number of days of sales history" },
            "limit": { "type": "integer", "description": "Maximum number of tokens to analyze for rarity" },
            "include_chart": { "type": "boolean", "default": false, "description": "Attach a sale price chart" }
        },
        "required": ["contract_address"]
    })
}

fn default_days() -> u32 {
    30
}

#[derive(Debug, Deserialize)]
struct NftParams {
    contract_address: String,
    #[serde(default)]
    token_id: Option<Value>,
    #[serde(default)]
    include_rarity: bool,
    #[serde(default)]
    include_sales: bool,
    #[serde(default = "default_days")]
    days: u32,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    include_chart: bool,
}

impl NftParams {
    fn from_address(contract_address: String) -> Self {
        Self {
            contract_address,
            token_id: None,
            include_rarity: false,
            include_sales: false,
            days: default_days(),
            limit: None,
            include_chart: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NftSettings {
    pub cache_ttl: u64,
    /// Assets scanned for rarity when the caller gives no limit.
    pub default_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sale {
    pub token_id: Option<String>,
    pub price_eth: f64,
    pub timestamp: Option<String>,
    pub buyer: Option<String>,
    pub seller: Option<String>,
}

#[derive(Debug)]
pub struct NftTool {
    api: ApiHandler,
    base_url: String,
    api_key: Option<String>,
    settings: RwLock<NftSettings>,
    stats: TtlCache<String, Value>,
}

impl NftTool {
    pub fn new(config: &Config, deps: &ToolDeps) -> Self {
        let ttl = config.analysis.cache_ttl;
        Self {
            api: deps.api.clone(),
            base_url: config.apis.opensea_base_url.trim_end_matches('/').to_string(),
            api_key: config.secrets.opensea_api_key.clone(),
            settings: RwLock::new(NftSettings { cache_ttl: ttl, default_limit: config.analysis.nft_limit }),
            stats: TtlCache::new(Duration::from_secs(ttl)),
        }
    }

    pub fn validate_settings(&self, patch: &Value) -> Result<(), ToolError> {
        check_settings(&self.settings, patch)
    }

    pub fn update_settings(&self, patch: &Value) -> Result<(), ToolError> {
        merge_settings(&self.settings, patch)?;
        self.stats.set_ttl(Duration::from_secs(read_settings(&self.settings)?.cache_ttl));
        Ok(())
    }

    pub async fn execute(&self, input: ToolInput) -> Result<Value, ToolError> {
        let params: NftParams = input.parse(NftParams::from_address)?;
        if !validate_address(&params.contract_address) {
            return Err(ToolError::InvalidInput("Invalid NFT contract address".into()));
        }
        let settings = read_settings(&self.settings)?;
        let address = params.contract_address.as_str();

        let mut result = json!({ "collection_stats": self.collection_stats(address).await? });
        if params.include_rarity {
            let limit = params.limit.unwrap_or(settings.default_limit);
            result["rarity_analysis"] = self.rarity_scores(address, limit).await?;
        }
        if params.include_sales {
            let sales = self.sales_history(address, params.days).await?;
            result["price_analysis"] = analyze_price_trends(&sales);
            if params.include_chart {
                let points: Vec<SeriesPoint> = sales
                    .iter()
                    .rev()
                    .map(|s| SeriesPoint { timestamp: json!(s.timestamp), value: s.price_eth })
                    .collect();
                result["chart"] = visualization::price_chart(&points, "Sale Prices");
            }
            result["sales_history"] = json!(sales);
        }
        if let Some(token_id) = params.token_id.filter(|v| !v.is_null()) {
            let token_id = match token_id {
                Value::String(s) => s,
                other => other.to_string(),
            };
            result["token_metadata"] = self.token_metadata(address, &token_id).await?;
        }
        Ok(result)
    }

    fn request(&self, path: &str) -> ApiRequest {
        let request = ApiRequest::get("opensea", format!("{}/{path}", self.base_url));
        match &self.api_key {
            Some(key) => request.header("X-API-KEY", key),
            None => request,
        }
    }

    pub async fn collection_stats(&self, address: &str) -> Result<Value, ToolError> {
        let key = address.to_lowercase();
        if let Some(stats) = self.stats.get(&key) {
            debug!(%address, "collection stats cache hit");
            return Ok(stats);
        }
        let data = self
            .api
            .make_request(self.request(&format!("collection/{address}/stats")))
            .await
            .map_err(|e| ToolError::Upstream(format!("Failed to fetch collection stats: {e}")))?
            .data;
        let stats = data.get("stats").cloned().unwrap_or(Value::Null);
        let picked: serde_json::Map<String, Value> = STAT_FIELDS
            .iter()
            .map(|f| (f.to_string(), stats.get(*f).cloned().unwrap_or(Value::Null)))
            .collect();
        let picked = Value::Object(picked);
        self.stats.insert(key, picked.clone());
        Ok(picked)
    }

    pub async fn token_metadata(&self, address: &str, token_id: &str) -> Result<Value, ToolError> {
        let data = self
            .api
            .make_request(self.request(&format!("asset/{address}/{token_id}")))
            .await
            .map_err(|e| ToolError::Upstream(format!("Failed to fetch token metadata: {e}")))?
            .data;
        Ok(json!({
            "name": data.get("name"),
            "description": data.get("description"),
            "traits": data.get("traits").cloned().unwrap_or_else(|| json!([])),
            "image_url": data.get("image_url"),
            "owner": data.pointer("/owner/address"),
            "last_sale": data.get("last_sale"),
            "token_id": data.get("token_id"),
        }))
    }

    /// Page through up to `limit` assets and score them by trait rarity.
    pub async fn rarity_scores(&self, address: &str, limit: usize) -> Result<Value, ToolError> {
        let mut assets: Vec<Value> = Vec::new();
        while assets.len() < limit {
            let page = PAGE_SIZE.min(limit - assets.len());
            let request = self
                .request("assets")
                .query("asset_contract_address", address)
                .query("limit", page)
                .query("offset", assets.len());
            let data = match self.api.make_request(request).await {
                Ok(resp) => resp.data,
                Err(e) => {
                    warn!(%address, error = %e, "asset page failed, stopping");
                    break;
                }
            };
            match data.get("assets").and_then(Value::as_array) {
                Some(batch) if !batch.is_empty() => assets.extend(batch.iter().cloned()),
                _ => break,
            }
        }
        if assets.is_empty() {
            return Err(ToolError::Upstream("Failed to fetch assets for rarity calculation".into()));
        }
        Ok(compute_rarity(&assets))
    }

    pub async fn sales_history(&self, address: &str, days: u32) -> Result<Vec<Sale>, ToolError> {
        let after = chrono::TimeDelta::try_days(i64::from(days))
            .and_then(|window| chrono::Utc::now().checked_sub_signed(window))
            .ok_or_else(|| ToolError::InvalidInput(format!("days out of range: {days}")))?;
        let request = self
            .request("events")
            .query("asset_contract_address", address)
            .query("event_type", "successful")
            .query("occurred_after", after.timestamp());
        let data = self
            .api
            .make_request(request)
            .await
            .map_err(|e| ToolError::Upstream(format!("Failed to fetch sales history: {e}")))?
            .data;
        Ok(data
            .get("asset_events")
            .and_then(Value::as_array)
            .map(|events| events.iter().map(parse_sale).collect())
            .unwrap_or_default())
    }
}

fn text_at(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn parse_sale(event: &Value) -> Sale {
    let wei = match event.get("total_price") {
        Some(Value::String(s)) => s.parse::<f64>().unwrap_or(0.0),
        Some(v) => v.as_f64().unwrap_or(0.0),
        None => 0.0,
    };
    Sale {
        token_id: text_at(event, "/asset/token_id"),
        price_eth: wei / WEI_PER_ETH,
        timestamp: text_at(event, "/transaction/timestamp"),
        buyer: text_at(event, "/winner_account/address"),
        seller: text_at(event, "/seller/address"),
    }
}

fn trait_pairs(asset: &Value) -> Vec<(String, String)> {
    asset
        .get("traits")
        .and_then(Value::as_array)
        .map(|traits| {
            traits
                .iter()
                .filter_map(|t| Some((text_at(t, "/trait_type")?, text_at(t, "/value")?)))
                .collect()
        })
        .unwrap_or_default()
}

/// Rarity score per asset is the sum over its traits of
/// `total_assets / count(trait_type, value)`.
pub fn compute_rarity(assets: &[Value]) -> Value {
    let total = assets.len() as f64;
    let mut counts: HashMap<(String, String), usize> = HashMap::new();
    for asset in assets {
        for pair in trait_pairs(asset) {
            *counts.entry(pair).or_default() += 1;
        }
    }

    let mut scored: Vec<(f64, Value)> = assets
        .iter()
        .map(|asset| {
            let score: f64 = trait_pairs(asset)
                .iter()
                .filter_map(|pair| counts.get(pair))
                .map(|count| total / *count as f64)
                .sum();
            let entry = json!({
                "token_id": text_at(asset, "/token_id"),
                "name": asset.get("name"),
                "rarity_score": score,
            });
            (score, entry)
        })
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut distribution: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
    for ((trait_type, value), count) in counts {
        distribution.entry(trait_type).or_default().insert(value, count);
    }

    json!({
        "total_assets": assets.len(),
        "trait_distribution": distribution,
        "rarest_tokens": scored.into_iter().take(RAREST_KEPT).map(|(_, v)| v).collect::<Vec<_>>(),
    })
}

/// Summary statistics over sale prices; empty input yields `{}`.
pub fn analyze_price_trends(sales: &[Sale]) -> Value {
    if sales.is_empty() {
        return json!({});
    }
    let mut prices: Vec<f64> = sales.iter().map(|s| s.price_eth).collect();
    prices.sort_by(f64::total_cmp);
    let n = prices.len() as f64;
    let total: f64 = prices.iter().sum();
    let mean = total / n;
    let mid = prices.len() / 2;
    let median = if prices.len() % 2 == 0 { (prices[mid - 1] + prices[mid]) / 2.0 } else { prices[mid] };
    let variance = prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
    json!({
        "average_price": mean,
        "median_price": median,
        "min_price": prices[0],
        "max_price": prices[prices.len() - 1],
        "price_std_dev": variance.sqrt(),
        "total_sales": sales.len(),
        "total_volume": total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::tools::testing::{ADDRESS, deps, spawn};
    use axum::{Json, Router, extract::{Path, Query}, http::HeaderMap, routing::get};
    use tempfile::TempDir;

    fn asset(id: u32, traits: &[(&str, &str)]) -> Value {
        json!({
            "token_id": id.to_string(),
            "name": format!("Token #{id}"),
            "traits": traits.iter().map(|(t, v)| json!({ "trait_type": t, "value": v })).collect::<Vec<_>>(),
        })
    }

    fn sale(price_eth: f64) -> Sale {
        Sale { token_id: None, price_eth, timestamp: None, buyer: None, seller: None }
    }

    #[test]
    fn rarity_prefers_uncommon_traits() {
        let assets = [
            asset(1, &[("Hat", "Cap"), ("Eyes", "Blue")]),
            asset(2, &[("Hat", "Cap"), ("Eyes", "Blue")]),
            asset(3, &[("Hat", "Crown"), ("Eyes", "Blue")]),
        ];
        let r = compute_rarity(&assets);
        assert_eq!(r["total_assets"], 3);
        assert_eq!(r["trait_distribution"]["Hat"]["Cap"], 2);
        assert_eq!(r["trait_distribution"]["Eyes"]["Blue"], 3);
        assert_eq!(r["rarest_tokens"][0]["token_id"], "3");
        // 3/1 + 3/3
        assert_eq!(r["rarest_tokens"][0]["rarity_score"], 4.0);
        assert_eq!(r["rarest_tokens"][1]["rarity_score"], 2.5);
    }

    #[test]
    fn price_trends() {
        let sales = [sale(1.0), sale(3.0), sale(2.0), sale(6.0)];
        let t = analyze_price_trends(&sales);
        assert_eq!(t["average_price"], 3.0);
        assert_eq!(t["median_price"], 2.5);
        assert_eq!(t["min_price"], 1.0);
        assert_eq!(t["max_price"], 6.0);
        assert_eq!(t["total_sales"], 4);
        assert_eq!(t["total_volume"], 12.0);
        // population variance of [1,2,3,6] is 3.5
        assert!((t["price_std_dev"].as_f64().unwrap() - 3.5f64.sqrt()).abs() < 1e-12);
        assert_eq!(analyze_price_trends(&[]), json!({}));
    }

    #[test]
    fn sale_parsing_converts_wei() {
        let event = json!({
            "asset": { "token_id": "42" },
            "total_price": "1500000000000000000",
            "transaction": { "timestamp": "2024-04-01T12:00:00" },
            "winner_account": { "address": "0xbuyer" },
            "seller": { "address": "0xseller" }
        });
        let s = parse_sale(&event);
        assert_eq!(s.token_id.as_deref(), Some("42"));
        assert_eq!(s.price_eth, 1.5);
        assert_eq!(s.buyer.as_deref(), Some("0xbuyer"));
    }

    fn opensea() -> Router {
        Router::new()
            .route(
                "/collection/{addr}/stats",
                get(|headers: HeaderMap| async move {
                    assert_eq!(headers.get("x-api-key").map(|v| v.to_str().unwrap()), Some("os-key"));
                    Json(json!({ "stats": { "floor_price": 1.25, "num_owners": 42, "ignored": true } }))
                }),
            )
            .route(
                "/assets",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    let offset: usize = q["offset"].parse().unwrap();
                    let limit: usize = q["limit"].parse().unwrap();
                    let end = (offset + limit).min(120);
                    let batch: Vec<Value> = (offset..end)
                        .map(|i| asset(i as u32, &[("Kind", if i == 7 { "Rare" } else { "Common" })]))
                        .collect();
                    Json(json!({ "assets": batch }))
                }),
            )
            .route(
                "/asset/{addr}/{id}",
                get(|Path((_, id)): Path<(String, String)>| async move {
                    Json(json!({ "name": format!("Token #{id}"), "token_id": id, "owner": { "address": "0xowner" } }))
                }),
            )
            .route(
                "/events",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q["event_type"], "successful");
                    Json(json!({ "asset_events": [
                        { "total_price": "2000000000000000000", "transaction": { "timestamp": "t2" } },
                        { "total_price": "1000000000000000000", "transaction": { "timestamp": "t1" } }
                    ]}))
                }),
            )
    }

    #[tokio::test]
    async fn full_collection_report() {
        let base = spawn(opensea()).await;
        let temp = TempDir::new().unwrap();
        let mut config = Config::test_default(temp.path());
        config.apis.opensea_base_url = base;
        config.secrets.opensea_api_key = Some("os-key".into());
        let tool = NftTool::new(&config, &deps(temp.path(), "http://127.0.0.1:1"));

        let out = tool
            .execute(ToolInput::from_value(json!({
                "contract_address": ADDRESS,
                "token_id": 7,
                "include_rarity": true,
                "include_sales": true,
                "include_chart": true,
                "limit": 200
            })))
            .await
            .unwrap();
        assert_eq!(out["collection_stats"]["floor_price"], 1.25);
        assert!(out["collection_stats"].get("ignored").is_none());
        assert_eq!(out["rarity_analysis"]["total_assets"], 120);
        assert_eq!(out["rarity_analysis"]["rarest_tokens"][0]["token_id"], "7");
        assert_eq!(out["price_analysis"]["total_volume"], 3.0);
        assert_eq!(out["sales_history"].as_array().unwrap().len(), 2);
        assert_eq!(out["chart"]["data"][0]["x"], json!(["t1", "t2"]));
        assert_eq!(out["token_metadata"]["token_id"], "7");
        assert_eq!(out["token_metadata"]["owner"], "0xowner");
    }

    #[tokio::test]
    async fn rejects_bad_contract_address() {
        let temp = TempDir::new().unwrap();
        let config = Config::test_default(temp.path());
        let tool = NftTool::new(&config, &deps(temp.path(), "http://127.0.0.1:1"));
        let err = tool.execute(ToolInput::Text("not-an-address".into())).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid NFT contract address");
    }

    #[tokio::test]
    async fn sales_window_past_the_calendar_is_invalid_input() {
        let temp = TempDir::new().unwrap();
        let config = Config::test_default(temp.path());
        let tool = NftTool::new(&config, &deps(temp.path(), "http://127.0.0.1:1"));

        let err = tool.sales_history(ADDRESS, u32::MAX).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)), "{err}");
    }
}
