//! Caching reverse proxy in front of the identifier-resolution API.
//!
//! Lookups are served from the persistent cache when possible; on a miss the
//! request is forwarded upstream once, the vendor result code in the response
//! envelope is mapped onto an HTTP status, and successful payloads are cached.

pub mod store;

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{EndpointMapping, ProxyConfig};
use crate::metrics::EdgeMetrics;

pub use store::SqliteStore;

const JSON_CONTENT_TYPE: &str = "application/json";

/// The fixed set of request paths the proxy answers for.
#[derive(Debug, Clone)]
pub struct EndpointTable {
    entries: Vec<EndpointMapping>,
}

impl EndpointTable {
    pub fn new(entries: Vec<EndpointMapping>) -> Self {
        Self { entries }
    }

    /// Exact matches win over prefix matches.
    pub fn find(&self, path: &str) -> Option<&EndpointMapping> {
        self.entries
            .iter()
            .find(|entry| !entry.prefix && entry.path == path)
            .or_else(|| {
                self.entries
                    .iter()
                    .filter(|entry| entry.prefix && path.starts_with(entry.path.as_str()))
                    .max_by_key(|entry| entry.path.len())
            })
    }

    pub fn supports(&self, path: &str) -> bool {
        self.find(path).is_some()
    }
}

/// Vendor result code to HTTP status translation.
#[derive(Debug, Clone)]
pub struct ResultCodeTable {
    codes: HashMap<String, StatusCode>,
    unmapped: StatusCode,
}

impl ResultCodeTable {
    pub fn new(codes: &HashMap<String, u16>, unmapped: u16) -> Result<Self> {
        let codes = codes
            .iter()
            .map(|(code, status)| {
                StatusCode::from_u16(*status)
                    .with_context(|| format!("Invalid HTTP status {status} for result code {code}"))
                    .map(|status| (code.clone(), status))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        let unmapped = StatusCode::from_u16(unmapped)
            .with_context(|| format!("Invalid HTTP status {unmapped} for unmapped result codes"))?;
        Ok(Self { codes, unmapped })
    }

    pub fn status_for(&self, code: &str) -> StatusCode {
        self.codes.get(code).copied().unwrap_or(self.unmapped)
    }
}

/// Response envelope returned by the upstream API.
#[derive(Debug, Deserialize)]
pub struct UpstreamEnvelope {
    #[serde(default, deserialize_with = "code_as_string")]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Value,
}

impl UpstreamEnvelope {
    /// `data` as response bytes: strings verbatim, anything else re-encoded.
    pub fn payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match &self.data {
            Value::String(raw) => Ok(raw.clone().into_bytes()),
            other => serde_json::to_vec(other),
        }
    }
}

fn code_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(code) => code,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

struct ProxyError {
    status: StatusCode,
    message: String,
}

impl ProxyError {
    fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

/// Build the pooled upstream client; every phase is bounded by `timeout`.
pub fn build_upstream_client(config: &ProxyConfig) -> Result<Client> {
    let timeout = config.upstream_timeout();
    Client::builder()
        .connect_timeout(timeout)
        .tcp_keepalive(timeout)
        .timeout(timeout)
        .pool_max_idle_per_host(config.max_idle_connections)
        .build()
        .context("Failed to build upstream resolver client")
}

/// Cache-first proxy for the identifier-resolution API.
pub struct CachingResolver {
    base_url: String,
    endpoints: Arc<EndpointTable>,
    result_codes: Option<ResultCodeTable>,
    cache_ttl: Duration,
    cache_control: HeaderValue,
    client: Client,
    store: SqliteStore,
    metrics: Arc<EdgeMetrics>,
}

impl CachingResolver {
    pub fn open(config: &ProxyConfig, metrics: Arc<EdgeMetrics>) -> Result<Self> {
        let store = SqliteStore::open(&config.cache_path)?;
        Self::with_store(config, store, metrics)
    }

    pub fn with_store(
        config: &ProxyConfig,
        store: SqliteStore,
        metrics: Arc<EdgeMetrics>,
    ) -> Result<Self> {
        let result_codes = if config.map_result_codes {
            Some(ResultCodeTable::new(
                &config.result_codes,
                config.unmapped_status,
            )?)
        } else {
            None
        };
        let cache_control =
            HeaderValue::from_str(&format!("max-age={}", config.advertised_max_age_secs))
                .context("Invalid advertised max-age")?;
        let client = build_upstream_client(config)?;

        info!(
            upstream = %config.upstream_base_url,
            endpoints = config.endpoints.len(),
            map_result_codes = config.map_result_codes,
            "Initialised caching resolver proxy"
        );

        Ok(Self {
            base_url: config.upstream_base_url.trim_end_matches('/').to_string(),
            endpoints: Arc::new(EndpointTable::new(config.endpoints.clone())),
            result_codes,
            cache_ttl: config.cache_ttl(),
            cache_control,
            client,
            store,
            metrics,
        })
    }

    pub fn endpoints(&self) -> Arc<EndpointTable> {
        self.endpoints.clone()
    }

    pub async fn handle(&self, request: Request) -> Response {
        self.metrics.inc_proxy_request();
        match self.process(request).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    async fn process(&self, request: Request) -> Result<Response, ProxyError> {
        let path = request.uri().path();
        let Some(mapping) = self.endpoints.find(path) else {
            return Ok(StatusCode::NOT_FOUND.into_response());
        };
        let query = request.uri().query().unwrap_or("");
        let Some(id) = identifier(query) else {
            return Ok(StatusCode::BAD_REQUEST.into_response());
        };

        let key = lookup_key(mapping, path, &id);
        match self.store.get(&key).await {
            Ok(Some(payload)) => {
                self.metrics.inc_proxy_cache_hit();
                debug!(key = %key, "Resolver cache hit");
                return Ok(self.json_payload(StatusCode::OK, payload, true));
            }
            Ok(None) => self.metrics.inc_proxy_cache_miss(),
            Err(err) => {
                self.metrics.inc_proxy_cache_miss();
                warn!(key = %key, error = %err, "Resolver cache lookup failed");
            }
        }

        let url = self.upstream_url(mapping, path, query);
        let (status, envelope) = self.call_upstream(&url, request.headers()).await?;
        let payload = envelope.payload().map_err(|err| {
            ProxyError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        })?;

        if status != StatusCode::OK {
            return Ok(self.json_payload(status, payload, false));
        }

        let mapped = match &self.result_codes {
            Some(table) => table.status_for(&envelope.code),
            None => StatusCode::OK,
        };
        if mapped != StatusCode::OK {
            debug!(
                code = %envelope.code,
                message = %envelope.message,
                status = %mapped,
                "Upstream resolver reported failure"
            );
            return Ok(self.json_payload(mapped, payload, false));
        }

        if let Err(err) = self.store.put(&key, payload.clone(), self.cache_ttl).await {
            warn!(key = %key, error = %err, "Failed to store resolver cache entry");
        }
        Ok(self.json_payload(StatusCode::OK, payload, true))
    }

    async fn call_upstream(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<(StatusCode, UpstreamEnvelope), ProxyError> {
        let response = self
            .client
            .get(url)
            .headers(forwarded_headers(headers))
            .send()
            .await
            .map_err(|err| {
                self.metrics.inc_proxy_upstream_failure();
                warn!(url = %url, error = %err, "Upstream resolver unreachable");
                ProxyError::new(StatusCode::BAD_GATEWAY, err.to_string())
            })?;
        let status = response.status();
        let body = response.bytes().await.map_err(|err| {
            self.metrics.inc_proxy_upstream_failure();
            warn!(url = %url, error = %err, "Failed to read upstream resolver body");
            ProxyError::new(StatusCode::EXPECTATION_FAILED, err.to_string())
        })?;
        let envelope = serde_json::from_slice(&body).map_err(|err| {
            warn!(url = %url, error = %err, "Malformed upstream resolver envelope");
            ProxyError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        })?;
        Ok((status, envelope))
    }

    fn upstream_url(&self, mapping: &EndpointMapping, path: &str, query: &str) -> String {
        let remainder = path_remainder(mapping, path);
        let mut url = format!("{}{}{}", self.base_url, mapping.upstream_path, remainder);
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    fn json_payload(&self, status: StatusCode, payload: Vec<u8>, cacheable: bool) -> Response {
        let length = payload.len();
        let mut response = Response::new(Body::from(payload));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(JSON_CONTENT_TYPE),
        );
        if cacheable {
            headers.insert(header::CACHE_CONTROL, self.cache_control.clone());
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        response
    }

    /// Release the persistent store; no requests may be handled afterwards.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}

/// Inbound headers passed on to the upstream API. Host and framing headers
/// describe the inbound hop and are left to the client.
fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in [
        header::HOST,
        header::CONNECTION,
        header::CONTENT_LENGTH,
        header::TRANSFER_ENCODING,
    ] {
        forwarded.remove(name);
    }
    forwarded
}

pub fn cache_key(query_type: &str, id: &str) -> String {
    format!("{query_type}:{id}")
}

/// Prefix mappings reach a different upstream resource per remainder, so the
/// remainder is part of the key.
fn lookup_key(mapping: &EndpointMapping, path: &str, id: &str) -> String {
    let remainder = path_remainder(mapping, path);
    cache_key(&format!("{}{remainder}", mapping.query_type), id)
}

fn path_remainder<'a>(mapping: &EndpointMapping, path: &'a str) -> &'a str {
    if mapping.prefix {
        path.strip_prefix(mapping.path.as_str()).unwrap_or("")
    } else {
        ""
    }
}

fn identifier(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "id")
        .map(|(_, value)| value.into_owned())
        .filter(|id| !id.is_empty())
}
