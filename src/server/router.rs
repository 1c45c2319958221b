use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::{
    Router,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::doh::{self, DohHandler};
use crate::metrics::EdgeMetrics;
use crate::proxy::{CachingResolver, EndpointTable};

/// Decides whether an inbound request is served at all.
pub trait RequestValidator: Send + Sync {
    fn accepts(&self, request: &Request) -> bool;
}

/// Accepts the DoH path and the caching proxy's configured endpoints.
pub struct PathValidator {
    endpoints: Arc<EndpointTable>,
}

impl PathValidator {
    pub fn new(endpoints: Arc<EndpointTable>) -> Self {
        Self { endpoints }
    }
}

impl RequestValidator for PathValidator {
    fn accepts(&self, request: &Request) -> bool {
        let path = request.uri().path();
        doh::supports(path) || self.endpoints.supports(path)
    }
}

/// Listener address of the connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct LocalAddr(pub SocketAddr);

pub(crate) struct AppState {
    pub(crate) validator: Arc<dyn RequestValidator>,
    pub(crate) doh: DohHandler,
    pub(crate) proxy: Arc<CachingResolver>,
    pub(crate) metrics: Arc<EdgeMetrics>,
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

async fn dispatch(State(state): State<Arc<AppState>>, request: Request) -> Response {
    if !state.validator.accepts(&request) {
        state.metrics.inc_rejected();
        debug!(method = %request.method(), path = %request.uri().path(), "Rejected request");
        return StatusCode::NOT_FOUND.into_response();
    }

    if doh::supports(request.uri().path()) {
        let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        let local = request
            .extensions()
            .get::<LocalAddr>()
            .map(|addr| addr.0)
            .unwrap_or(unspecified);
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0)
            .unwrap_or(unspecified);
        state.doh.handle(request, local, peer).await
    } else {
        state.proxy.handle(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::pipeline::{DnsPipeline, ResponseCapture};
    use anyhow::Result;
    use axum::body::Body;
    use axum::http::{Method, header};
    use futures_util::future::BoxFuture;
    use hickory_proto::op::{Message, MessageType, Query};
    use hickory_proto::rr::{Name, RecordType};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    struct EchoPipeline;

    impl DnsPipeline for EchoPipeline {
        fn serve_dns<'a>(
            &'a self,
            request: &'a Message,
            writer: &'a mut ResponseCapture,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let mut response = request.clone();
                response.set_message_type(MessageType::Response);
                let _ = writer.write_message(response);
            })
        }
    }

    struct DenyAll;

    impl RequestValidator for DenyAll {
        fn accepts(&self, _request: &Request) -> bool {
            false
        }
    }

    fn state(dir: &TempDir, validator: Option<Arc<dyn RequestValidator>>) -> Result<Arc<AppState>> {
        let metrics = Arc::new(EdgeMetrics::new()?);
        let config = ProxyConfig {
            upstream_base_url: "http://127.0.0.1:9".into(),
            cache_path: dir.path().join("cache.sqlite"),
            upstream_timeout_secs: 1,
            ..ProxyConfig::default()
        };
        let proxy = Arc::new(CachingResolver::open(&config, metrics.clone())?);
        let validator =
            validator.unwrap_or_else(|| Arc::new(PathValidator::new(proxy.endpoints())));
        Ok(Arc::new(AppState {
            validator,
            doh: DohHandler::new(Arc::new(EchoPipeline), metrics.clone(), Duration::from_secs(5)),
            proxy,
            metrics,
        }))
    }

    fn query_bytes() -> Vec<u8> {
        let mut message = Message::new();
        message.add_query(Query::query(
            Name::from_ascii("example.com.").expect("name"),
            RecordType::AAAA,
        ));
        message.to_vec().expect("serialise")
    }

    #[tokio::test]
    async fn unknown_path_is_not_found_for_any_method() -> Result<()> {
        let dir = tempdir()?;
        let router = build_router(state(&dir, None)?);

        for method in [Method::GET, Method::POST, Method::DELETE] {
            let request = Request::builder()
                .method(method)
                .uri("/not-served")
                .body(Body::empty())?;
            let response = router.clone().oneshot(request).await?;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert!(response.into_body().collect().await?.to_bytes().is_empty());
        }
        Ok(())
    }

    #[tokio::test]
    async fn doh_path_reaches_doh_handler() -> Result<()> {
        let dir = tempdir()?;
        let router = build_router(state(&dir, None)?);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/dns-query")
            .body(Body::from(query_bytes()))?;

        let response = router.oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            doh::DNS_CONTENT_TYPE
        );
        Ok(())
    }

    #[tokio::test]
    async fn proxy_path_reaches_caching_proxy() -> Result<()> {
        let dir = tempdir()?;
        let router = build_router(state(&dir, None)?);
        let request = Request::builder().uri("/ma/node").body(Body::empty())?;

        let response = router.oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn custom_validator_overrides_path_check() -> Result<()> {
        let dir = tempdir()?;
        let router = build_router(state(&dir, Some(Arc::new(DenyAll)))?);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/dns-query")
            .body(Body::from(query_bytes()))?;

        let response = router.oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        Ok(())
    }
}
