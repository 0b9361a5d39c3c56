//! Shared outbound HTTP handler for the Web3 data APIs.
//!
//! Every tool request goes through [`ApiHandler::make_request`], which applies
//! the per-API rate limiter, default headers, retries on transport failures,
//! and lenient JSON decoding.

pub mod rate_limit;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use rate_limit::RateLimiter;

use crate::config::Config;

pub const USER_AGENT: &str = "Web3-Intelligence-Agent/1.0";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limit exceeded for {api}")]
    RateLimited { api: String },

    #[error("request to {url} timed out after {secs} seconds")]
    Timeout { url: String, secs: u64 },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

/// One outbound request. Built with [`ApiRequest::get`] / [`ApiRequest::post`]
/// and the chained setters.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub api_name: String,
    pub url: String,
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub json: Option<Value>,
    pub timeout: Duration,
    /// Total attempts, at least one.
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl ApiRequest {
    pub fn new(method: Method, api_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            api_name: api_name.into(),
            url: url.into(),
            method,
            query: Vec::new(),
            headers: Vec::new(),
            json: None,
            timeout: Duration::from_secs(30),
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn get(api_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(Method::GET, api_name, url)
    }

    pub fn post(api_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(Method::POST, api_name, url)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.json = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub data: Value,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub all_healthy: bool,
    pub services: BTreeMap<String, ServiceHealth>,
    /// Unix seconds.
    pub timestamp: f64,
}

/// Health-probe targets.
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    pub etherscan: String,
    pub etherscan_key: Option<String>,
    pub defillama: String,
    pub web3: String,
}

impl Endpoints {
    pub fn from_config(config: &Config) -> Self {
        Self {
            etherscan: config.chain.explorer_api.clone(),
            etherscan_key: config.secrets.etherscan_api_key.clone(),
            defillama: config.apis.defillama_base_url.clone(),
            web3: config.chain.provider_uri.clone(),
        }
    }
}

/// Cheap to clone: all state lives behind one `Arc`.
#[derive(Debug, Clone)]
pub struct ApiHandler {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    client: Client,
    default_rps: u32,
    bearer: Option<String>,
    endpoints: Endpoints,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl ApiHandler {
    pub fn new(default_rps: u32, endpoints: Endpoints, bearer: Option<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ApiError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                default_rps,
                bearer,
                endpoints,
                limiters: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        Self::new(config.server.rate_limit_per_second, Endpoints::from_config(config), None)
    }

    fn limiters(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Arc<RateLimiter>>>, ApiError> {
        self.inner
            .limiters
            .lock()
            .map_err(|_| ApiError::Connection("rate limiter registry lock poisoned".into()))
    }

    /// Replace the limiter for every named API.
    pub fn initialize_rate_limiters(&self, limits: &HashMap<String, u32>) -> Result<(), ApiError> {
        let mut limiters = self.limiters()?;
        for (name, rps) in limits {
            limiters.insert(name.clone(), Arc::new(RateLimiter::new(*rps)));
        }
        info!(count = limits.len(), "rate limiters initialised");
        Ok(())
    }

    /// Limiter for `api_name`, created at the default rate on first use.
    pub fn rate_limiter(&self, api_name: &str) -> Result<Arc<RateLimiter>, ApiError> {
        let mut limiters = self.limiters()?;
        let limiter = limiters
            .entry(api_name.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(self.inner.default_rps)));
        Ok(Arc::clone(limiter))
    }

    /// Inbound throttle: `check` every registered limiter.
    pub fn check_rate_limits(&self) -> Result<(), ApiError> {
        let snapshot: Vec<(String, Arc<RateLimiter>)> = self
            .limiters()?
            .iter()
            .map(|(name, limiter)| (name.clone(), Arc::clone(limiter)))
            .collect();
        for (name, limiter) in snapshot {
            limiter.check(&name)?;
        }
        Ok(())
    }

    /// Accepts `{"rate_limits": {name: rps}}`; other keys are ignored.
    pub fn update_settings(&self, settings: &Value) -> Result<(), ApiError> {
        match parse_rate_limits(settings)? {
            Some(limits) => self.initialize_rate_limiters(&limits),
            None => Ok(()),
        }
    }

    pub fn validate_settings(&self, settings: &Value) -> Result<(), ApiError> {
        parse_rate_limits(settings).map(drop)
    }

    pub fn cleanup(&self) {
        if let Ok(mut limiters) = self.inner.limiters.lock() {
            limiters.clear();
        }
        info!("api handler cleaned up");
    }

    pub async fn make_request(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.rate_limiter(&request.api_name)?.acquire(&request.api_name).await?;

        let attempts = request.retry_count.max(1);
        let mut last_err = ApiError::Connection("no attempt made".into());
        for attempt in 0..attempts {
            match self.send_once(&request).await {
                Ok(response) => return Ok(response),
                Err(e @ (ApiError::Timeout { .. } | ApiError::Connection(_))) => {
                    warn!(
                        api = %request.api_name,
                        url = %request.url,
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "request failed"
                    );
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(request.retry_delay * (attempt + 1)).await;
            }
        }
        Err(last_err)
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut builder = self
            .inner
            .client
            .request(request.method.clone(), &request.url)
            .timeout(request.timeout)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT);
        if let Some(token) = &self.inner.bearer {
            builder = builder.bearer_auth(token);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.json {
            if matches!(request.method, Method::POST | Method::PUT | Method::PATCH) {
                builder = builder.json(body);
            }
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout { url: request.url.clone(), secs: request.timeout.as_secs() }
            } else {
                ApiError::Connection(e.to_string())
            }
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|e| ApiError::Decode(e.to_string()))?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if !(status.is_success() || status.is_redirection()) {
            return Err(ApiError::Status { status: status.as_u16(), body: text });
        }
        debug!(api = %request.api_name, url = %request.url, status = status.as_u16(), latency_ms, "api response");

        let data = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(ApiResponse { status: status.as_u16(), data, latency_ms })
    }

    /// Probe Etherscan, DefiLlama and the Web3 provider concurrently.
    pub async fn check_connections(&self) -> ConnectionReport {
        let endpoints = &self.inner.endpoints;

        let mut etherscan = ApiRequest::get("etherscan", &endpoints.etherscan)
            .query("module", "proxy")
            .query("action", "eth_blockNumber")
            .timeout(PROBE_TIMEOUT)
            .retries(1, Duration::ZERO);
        if let Some(key) = &endpoints.etherscan_key {
            etherscan = etherscan.query("apikey", key);
        }
        let defillama = ApiRequest::get("defillama", format!("{}/protocols", endpoints.defillama))
            .timeout(PROBE_TIMEOUT)
            .retries(1, Duration::ZERO);

        let (etherscan, defillama, web3) =
            tokio::join!(self.probe(etherscan), self.probe(defillama), self.probe_web3());

        let services = BTreeMap::from([
            ("etherscan".to_string(), etherscan),
            ("defillama".to_string(), defillama),
            ("web3".to_string(), web3),
        ]);
        ConnectionReport {
            all_healthy: services.values().all(|s| s.healthy),
            services,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }

    async fn probe(&self, request: ApiRequest) -> ServiceHealth {
        let started = Instant::now();
        match self.make_request(request).await {
            Ok(resp) => ServiceHealth { healthy: true, latency_ms: resp.latency_ms, error: None },
            Err(e) => ServiceHealth {
                healthy: false,
                latency_ms: started.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            },
        }
    }

    async fn probe_web3(&self) -> ServiceHealth {
        let uri = &self.inner.endpoints.web3;
        if !uri.starts_with("http") {
            return ServiceHealth {
                healthy: false,
                latency_ms: 0,
                error: Some("no HTTP web3 provider configured".into()),
            };
        }
        let request = ApiRequest::post("web3", uri)
            .json(json!({ "jsonrpc": "2.0", "method": "eth_blockNumber", "params": [], "id": 1 }))
            .timeout(PROBE_TIMEOUT)
            .retries(1, Duration::ZERO);
        self.probe(request).await
    }
}

/// Normalise an upstream payload into a JSON object.
pub fn format_response(data: Value) -> Value {
    match data {
        Value::Object(_) => data,
        Value::Array(items) => json!({ "items": items }),
        other => json!({ "data": other }),
    }
}

fn parse_rate_limits(settings: &Value) -> Result<Option<HashMap<String, u32>>, ApiError> {
    let Some(limits) = settings.get("rate_limits") else {
        return Ok(None);
    };
    serde_json::from_value(limits.clone())
        .map(Some)
        .map_err(|e| ApiError::InvalidSettings(format!("rate_limits: {e}")))
}
