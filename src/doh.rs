//! DNS-over-HTTPS request decoding, pipeline invocation and response rendering.

pub mod freshness;
pub mod json;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hickory_proto::op::Message;
use tracing::{debug, error, warn};

use crate::metrics::EdgeMetrics;
use crate::pipeline::{DnsPipeline, ResponseCapture};

pub const DOH_PATH: &str = "/dns-query";
pub const DNS_CONTENT_TYPE: &str = "application/dns-message";
pub const DNS_JSON_CONTENT_TYPE: &str = "application/dns-json";

const JSON_MEDIA_TYPES: [&str; 2] = [DNS_JSON_CONTENT_TYPE, "application/json"];
const MAX_DNS_MESSAGE: usize = 65_535;

/// Whether `path` follows the DoH URL convention.
pub fn supports(path: &str) -> bool {
    path == DOH_PATH
}

struct DohResponseError {
    status: StatusCode,
    message: String,
}

impl DohResponseError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for DohResponseError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

/// Serves DoH requests by running them through a [`DnsPipeline`].
#[derive(Clone)]
pub struct DohHandler {
    pipeline: Arc<dyn DnsPipeline>,
    metrics: Arc<EdgeMetrics>,
    read_timeout: Duration,
}

impl DohHandler {
    pub fn new(
        pipeline: Arc<dyn DnsPipeline>,
        metrics: Arc<EdgeMetrics>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            pipeline,
            metrics,
            read_timeout,
        }
    }

    pub async fn handle(&self, request: Request, local: SocketAddr, peer: SocketAddr) -> Response {
        self.metrics.inc_doh_request();
        match self.process(request, local, peer).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    async fn process(
        &self,
        request: Request,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Response, DohResponseError> {
        let wants_json = is_json_request(request.headers(), request.uri().query());
        let query = self.decode(request).await.map_err(|message| {
            self.metrics.inc_doh_decode_failure();
            debug!(error = %message, peer = %peer, "Rejected undecodable DoH request");
            DohResponseError::bad_request(message)
        })?;

        let mut capture = ResponseCapture::new(local, peer);
        self.pipeline.serve_dns(&query, &mut capture).await;

        // RFC 8484 4.2.1: a pipeline that answers nothing is a server fault.
        let Some(answer) = capture.take_message() else {
            self.metrics.inc_doh_missing_response();
            error!(peer = %peer, "Resolution pipeline produced no response");
            return Err(DohResponseError::internal("No response"));
        };

        let wire = answer.to_vec().map_err(|err| {
            error!(error = %err, "Failed to serialise DNS response");
            DohResponseError::internal(err.to_string())
        })?;

        let kind = freshness::classify(&answer);
        let age = freshness::minimal_ttl(&answer, kind);
        let cache_control = freshness::cache_control(age);
        debug!(kind = kind.as_str(), max_age = ?age, "Computed DoH response freshness");

        if wants_json {
            self.metrics.inc_doh_json_response();
            return Ok(json_response(&answer, &cache_control));
        }
        Ok(dns_response(wire, &cache_control))
    }

    async fn decode(&self, request: Request) -> Result<Message, String> {
        let method = request.method().clone();
        let payload = if method == Method::GET {
            extract_get_payload(request.uri().query().unwrap_or(""))?
        } else if method == Method::POST {
            self.read_body(request.into_body()).await?.to_vec()
        } else {
            return Err(format!("method not allowed: {method}"));
        };
        Message::from_vec(&payload).map_err(|err| err.to_string())
    }

    async fn read_body(&self, body: Body) -> Result<Bytes, String> {
        match tokio::time::timeout(self.read_timeout, axum::body::to_bytes(body, MAX_DNS_MESSAGE))
            .await
        {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => Err(format!("failed to read request body: {err}")),
            Err(_) => Err("timed out reading request body".into()),
        }
    }
}

/// Decode the single `dns` parameter of a GET query string.
pub fn extract_get_payload(query: &str) -> Result<Vec<u8>, String> {
    let values: Vec<String> = url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key == "dns")
        .map(|(_, value)| value.into_owned())
        .collect();
    match values.as_slice() {
        [] => Err("no 'dns' query parameter found".into()),
        [value] => URL_SAFE_NO_PAD
            .decode(value.as_bytes())
            .map_err(|err| err.to_string()),
        _ => Err("multiple 'dns' query values found".into()),
    }
}

/// JSON rendering is selected by the `Accept` header or the `ct` parameter.
pub fn is_json_request(headers: &HeaderMap, query: Option<&str>) -> bool {
    let accepts_json = headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|item| item.split(';').next().unwrap_or("").trim())
        .any(|media| JSON_MEDIA_TYPES.contains(&media));
    if accepts_json {
        return true;
    }
    query
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .any(|(key, value)| key == "ct" && JSON_MEDIA_TYPES.contains(&&*value))
        })
        .unwrap_or(false)
}

fn dns_response(bytes: Vec<u8>, cache_control: &str) -> Response {
    let length = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(DNS_CONTENT_TYPE),
    );
    insert_cache_control(headers, cache_control);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    response
}

fn json_response(answer: &Message, cache_control: &str) -> Response {
    let encoded = json::render(answer).and_then(|rendered| serde_json::to_vec(&rendered));
    encoded_json_response(encoded, cache_control)
}

fn encoded_json_response(
    encoded: Result<Vec<u8>, serde_json::Error>,
    cache_control: &str,
) -> Response {
    let body = match encoded {
        Ok(body) => body,
        Err(err) => {
            error!(error = %err, "Failed to encode DNS response as JSON");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let length = body.len();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(DNS_JSON_CONTENT_TYPE),
    );
    insert_cache_control(headers, cache_control);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    response
}

fn insert_cache_control(headers: &mut HeaderMap, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(header::CACHE_CONTROL, value);
        }
        Err(err) => warn!(error = %err, "Invalid Cache-Control value"),
    }
}
