//! DeFi protocol and chain analytics from DefiLlama.

use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{TtlCache, ToolDeps, ToolError, ToolInput, check_settings, merge_settings, read_settings};
use crate::api::{ApiHandler, ApiRequest};
use crate::config::Config;
use crate::visualization::{self, Series, SeriesPoint};

pub const NAME: &str = "DeFiTool";
pub const DESCRIPTION: &str = "Analyzes DeFi protocols and chain TVL using DefiLlama. Input: {\"action\": \"protocol\", \"protocol_id\": \"aave\"} or {\"action\": \"chain\", \"chain\": \"Ethereum\"}";

pub fn parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["protocol", "chain"], "description": "Analysis action" },
            "protocol_id": { "type": "string", "description": "Protocol identifier for analysis" },
            "chain": { "type": "string", "description": "Chain name for TVL analysis" },
            "include_risk": { "type": "boolean", "default": false, "description": "Include risk analysis" },
            "include_chart": { "type": "boolean", "default": false, "description": "Attach a TVL history chart" }
        },
        "required": ["action"]
    })
}

#[derive(Debug, Deserialize)]
struct DefiParams {
    action: String,
    #[serde(default)]
    protocol_id: Option<String>,
    #[serde(default)]
    chain: Option<String>,
    #[serde(default)]
    include_risk: bool,
    #[serde(default)]
    include_chart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefiSettings {
    pub cache_ttl: u64,
}

#[derive(Debug)]
pub struct DefiTool {
    api: ApiHandler,
    base_url: String,
    settings: RwLock<DefiSettings>,
    protocols: TtlCache<String, Value>,
}

impl DefiTool {
    pub fn new(config: &Config, deps: &ToolDeps) -> Self {
        let ttl = config.analysis.cache_ttl;
        Self {
            api: deps.api.clone(),
            base_url: config.apis.defillama_base_url.trim_end_matches('/').to_string(),
            settings: RwLock::new(DefiSettings { cache_ttl: ttl }),
            protocols: TtlCache::new(Duration::from_secs(ttl)),
        }
    }

    pub fn validate_settings(&self, patch: &Value) -> Result<(), ToolError> {
        check_settings(&self.settings, patch)
    }

    pub fn update_settings(&self, patch: &Value) -> Result<(), ToolError> {
        merge_settings(&self.settings, patch)?;
        self.protocols.set_ttl(Duration::from_secs(read_settings(&self.settings)?.cache_ttl));
        Ok(())
    }

    pub async fn execute(&self, input: ToolInput) -> Result<Value, ToolError> {
        let params: DefiParams = input.parse(|protocol_id| DefiParams {
            action: "protocol".into(),
            protocol_id: Some(protocol_id),
            chain: None,
            include_risk: false,
            include_chart: false,
        })?;

        match params.action.as_str() {
            "protocol" => {
                let protocol_id = params
                    .protocol_id
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| ToolError::InvalidInput("Protocol ID required".into()))?;
                let data = self.protocol_data(protocol_id.trim()).await?;
                let mut result = json!({ "protocol_data": data });
                if params.include_risk {
                    result["risk_analysis"] = assess_protocol_risk(&result["protocol_data"]);
                }
                if params.include_chart {
                    let points = tvl_points(&result["protocol_data"]["tvl_history"]);
                    let title = format!("{} TVL", result["protocol_data"]["name"].as_str().unwrap_or(&protocol_id));
                    result["chart"] = visualization::tvl_chart(&[Series { name: "TVL".into(), points }], &title);
                }
                Ok(result)
            }
            "chain" => {
                let chain = params
                    .chain
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| ToolError::InvalidInput("Chain name required".into()))?;
                self.chain_tvl(chain.trim()).await
            }
            other => Err(ToolError::InvalidInput(format!("Invalid action: {other}"))),
        }
    }

    pub async fn protocol_data(&self, protocol_id: &str) -> Result<Value, ToolError> {
        if !is_protocol_slug(protocol_id) {
            return Err(ToolError::InvalidInput(format!("Invalid protocol ID: {protocol_id}")));
        }
        let key = protocol_id.to_lowercase();
        if let Some(cached) = self.protocols.get(&key) {
            debug!(%protocol_id, "protocol cache hit");
            return Ok(cached);
        }

        let data = self
            .api
            .make_request(ApiRequest::get("defillama", format!("{}/protocol/{protocol_id}", self.base_url)))
            .await
            .map_err(|e| ToolError::Upstream(format!("Failed to fetch protocol data: {e}")))?
            .data;
        let history = match self
            .api
            .make_request(ApiRequest::get("defillama", format!("{}/protocol/{protocol_id}/chart", self.base_url)))
            .await
        {
            Ok(resp) => resp.data,
            Err(e) => {
                warn!(%protocol_id, error = %e, "tvl history unavailable");
                json!([])
            }
        };

        let result = json!({
            "name": data.get("name"),
            "description": data.get("description"),
            "current_tvl": current_tvl(&data),
            "chains": data.get("chains").cloned().unwrap_or_else(|| json!([])),
            "category": data.get("category"),
            "total_volume_24h": data.get("volume24h").and_then(Value::as_f64).unwrap_or(0.0),
            "tvl_history": history,
            "audit_links": data.get("audit_links").cloned().unwrap_or_else(|| json!([])),
            "url": data.get("url"),
            "github": data.get("github"),
        });
        self.protocols.insert(key, result.clone());
        Ok(result)
    }

    pub async fn chain_tvl(&self, chain: &str) -> Result<Value, ToolError> {
        let data = self
            .api
            .make_request(ApiRequest::get("defillama", format!("{}/v2/chains", self.base_url)))
            .await
            .map_err(|e| ToolError::Upstream(format!("Failed to fetch chain TVL: {e}")))?
            .data;
        let entry = data
            .as_array()
            .and_then(|chains| {
                chains.iter().find(|c| {
                    c.get("name").and_then(Value::as_str).is_some_and(|n| n.eq_ignore_ascii_case(chain))
                })
            })
            .ok_or_else(|| ToolError::NotFound(format!("Chain {chain} not found")))?;
        let number = |key: &str| entry.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        Ok(json!({
            "tvl": number("tvl"),
            "tokenSymbol": entry.get("tokenSymbol"),
            "change_1d": number("change_1d"),
            "change_7d": number("change_7d"),
        }))
    }
}

/// `tvl` is a number on some endpoints and a `[{date, totalLiquidityUSD}]`
/// history on `/protocol/{id}`; the latter yields its last point.
fn current_tvl(data: &Value) -> f64 {
    match data.get("tvl") {
        Some(Value::Array(points)) => points
            .last()
            .and_then(|p| p.get("totalLiquidityUSD"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        Some(v) => v.as_f64().unwrap_or(0.0),
        None => 0.0,
    }
}

fn tvl_points(history: &Value) -> Vec<SeriesPoint> {
    history
        .as_array()
        .map(|points| {
            points
                .iter()
                .filter_map(|p| {
                    Some(SeriesPoint {
                        timestamp: p.get("date")?.clone(),
                        value: p.get("totalLiquidityUSD")?.as_f64()?,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Heuristic risk score in `[0, 1]`; higher is safer.
pub fn assess_protocol_risk(protocol: &Value) -> Value {
    let tvl = protocol.get("current_tvl").and_then(Value::as_f64).unwrap_or(0.0);
    let volume = protocol.get("total_volume_24h").and_then(Value::as_f64).unwrap_or(0.0);
    let audited = protocol.get("audit_links").and_then(Value::as_array).is_some_and(|a| !a.is_empty());
    let chains = protocol.get("chains").and_then(Value::as_array).map_or(0, Vec::len);

    let tvl_score = (tvl / 1e9).min(1.0);
    let volume_score = if tvl > 0.0 { (volume / tvl).min(1.0) } else { 0.0 };
    let audit_score = if audited { 0.8 } else { 0.2 };
    let chain_score = (chains as f64 / 5.0).min(1.0);
    let overall = (tvl_score + volume_score + audit_score + chain_score) / 4.0;
    let level = if overall < 0.3 {
        "HIGH"
    } else if overall < 0.7 {
        "MEDIUM"
    } else {
        "LOW"
    };

    json!({
        "risk_factors": {
            "tvl_score": tvl_score,
            "volume_score": volume_score,
            "audit_score": audit_score,
            "chain_diversification": chain_score,
        },
        "overall_risk": overall,
        "risk_level": level,
    })
}

/// DefiLlama slugs (`aave-v3`, `ether.fi`) form one URL path segment.
fn is_protocol_slug(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::subsystems::tools::testing::{deps, spawn};
    use axum::{Json, Router, http::StatusCode, routing::get};
    use tempfile::TempDir;

    #[test]
    fn risk_levels() {
        let safe = json!({
            "current_tvl": 2e9, "total_volume_24h": 4e9,
            "audit_links": ["https://audit"], "chains": ["a", "b", "c", "d", "e", "f"]
        });
        let r = assess_protocol_risk(&safe);
        assert_eq!(r["risk_factors"]["tvl_score"], 1.0);
        assert_eq!(r["risk_factors"]["volume_score"], 1.0);
        assert!((r["overall_risk"].as_f64().unwrap() - 0.95).abs() < 1e-9);
        assert_eq!(r["risk_level"], "LOW");

        let risky = json!({ "current_tvl": 0.0, "total_volume_24h": 10.0, "chains": [] });
        let r = assess_protocol_risk(&risky);
        assert_eq!(r["risk_factors"]["volume_score"], 0.0);
        assert_eq!(r["overall_risk"], 0.05);
        assert_eq!(r["risk_level"], "HIGH");

        let middling = json!({ "current_tvl": 5e8, "total_volume_24h": 0.0, "audit_links": ["x"], "chains": ["a", "b"] });
        assert_eq!(assess_protocol_risk(&middling)["risk_level"], "MEDIUM");
    }

    #[test]
    fn tvl_from_number_or_history() {
        assert_eq!(current_tvl(&json!({ "tvl": 12.5 })), 12.5);
        let history = json!({ "tvl": [{ "date": 1, "totalLiquidityUSD": 10.0 }, { "date": 2, "totalLiquidityUSD": 20.0 }] });
        assert_eq!(current_tvl(&history), 20.0);
        assert_eq!(current_tvl(&json!({})), 0.0);
    }

    fn llama(protocol_hits: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/protocol/{id}",
                get(move || {
                    let hits = Arc::clone(&protocol_hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Json(json!({
                            "name": "Aave", "category": "Lending", "chains": ["Ethereum", "Polygon"],
                            "tvl": [{ "date": 1700000000, "totalLiquidityUSD": 5e9 }],
                            "audit_links": ["https://example.org/audit"]
                        }))
                    }
                }),
            )
            .route("/protocol/{id}/chart", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/v2/chains",
                get(|| async {
                    Json(json!([
                        { "name": "Ethereum", "tvl": 5.5e10, "tokenSymbol": "ETH", "change_1d": 1.5 },
                        { "name": "Arbitrum", "tvl": 3e9, "tokenSymbol": "ARB" }
                    ]))
                }),
            )
    }

    async fn tool(hits: Arc<AtomicUsize>, temp: &TempDir) -> DefiTool {
        let base = spawn(llama(hits)).await;
        let mut config = Config::test_default(temp.path());
        config.apis.defillama_base_url = base;
        DefiTool::new(&config, &deps(temp.path(), "http://127.0.0.1:1"))
    }

    #[tokio::test]
    async fn protocol_report_is_cached_and_tolerates_missing_chart() {
        let hits = Arc::new(AtomicUsize::new(0));
        let temp = TempDir::new().unwrap();
        let tool = tool(Arc::clone(&hits), &temp).await;

        let input = json!({ "action": "protocol", "protocol_id": "aave", "include_risk": true, "include_chart": true });
        let out = tool.execute(ToolInput::from_value(input.clone())).await.unwrap();
        assert_eq!(out["protocol_data"]["current_tvl"], 5e9);
        assert_eq!(out["protocol_data"]["tvl_history"], json!([]));
        assert_eq!(out["risk_analysis"]["risk_factors"]["audit_score"], 0.8);
        assert_eq!(out["chart"]["layout"]["title"], "Aave TVL");

        tool.execute(ToolInput::from_value(input)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chain_lookup_ignores_case() {
        let temp = TempDir::new().unwrap();
        let tool = tool(Arc::new(AtomicUsize::new(0)), &temp).await;

        let out = tool.execute(ToolInput::from_value(json!({ "action": "chain", "chain": "ethereum" }))).await.unwrap();
        assert_eq!(out, json!({ "tvl": 5.5e10, "tokenSymbol": "ETH", "change_1d": 1.5, "change_7d": 0.0 }));

        let err = tool.execute(ToolInput::from_value(json!({ "action": "chain", "chain": "Solana" }))).await.unwrap_err();
        assert_eq!(err.to_string(), "Chain Solana not found");

        let err = tool.execute(ToolInput::from_value(json!({ "action": "pool" }))).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid action: pool");
    }

    #[tokio::test]
    async fn protocol_ids_stay_inside_one_path_segment() {
        let hits = Arc::new(AtomicUsize::new(0));
        let temp = TempDir::new().unwrap();
        let tool = tool(Arc::clone(&hits), &temp).await;

        for id in ["aave/../../v2/chains", "aave?x=1", "aave#top", "aa%2fve", "aave v3", ".."] {
            let input = json!({ "action": "protocol", "protocol_id": id });
            let err = tool.execute(ToolInput::from_value(input)).await.unwrap_err();
            assert!(matches!(err, ToolError::InvalidInput(_)), "{id}: {err}");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(is_protocol_slug("ether.fi"));
        assert!(is_protocol_slug("aave-v3"));
    }
}
