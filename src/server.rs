//! HTTPS listener hosting the DoH handler and the caching proxy.
//!
//! One task per accepted connection; each connection is served by hyper's
//! auto (HTTP/2 or HTTP/1.1) builder over TLS. Stopping the server stops
//! accepting, asks open connections to finish in-flight requests, and waits
//! up to the configured grace period before aborting whatever is left.

mod router;
pub mod tls;

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use axum::extract::ConnectInfo;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
    time::{self, timeout},
};
use tokio_rustls::{TlsAcceptor, rustls::ServerConfig};
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::config::{ServerSection, ServerTimeouts, ZoneSection};
use crate::doh::DohHandler;
use crate::metrics::EdgeMetrics;
use crate::proxy::CachingResolver;

use router::AppState;
pub use router::{LocalAddr, PathValidator, RequestValidator};

/// Per-zone settings contributed by the surrounding server configuration.
#[derive(Clone)]
pub struct ZoneConfig {
    pub zone: String,
    pub tls: Option<Arc<ServerConfig>>,
    pub validator: Option<Arc<dyn RequestValidator>>,
}

impl ZoneConfig {
    pub fn new(zone: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            tls: None,
            validator: None,
        }
    }

    /// Build a zone from its config section, loading the certificate pair
    /// when both paths are present.
    pub fn from_section(section: &ZoneSection) -> Result<Self> {
        let tls = match (&section.tls_cert_path, &section.tls_key_path) {
            (Some(cert), Some(key)) => Some(
                tls::load_tls_config(cert, key)
                    .with_context(|| format!("Failed to load TLS for zone {}", section.name))?,
            ),
            (None, None) => None,
            _ => bail!(
                "Zone {} must set both tls_cert_path and tls_key_path",
                section.name
            ),
        };
        Ok(Self {
            zone: section.name.clone(),
            tls,
            validator: None,
        })
    }
}

pub struct HttpsServer {
    addr: String,
    zones: Vec<String>,
    quiet: bool,
    timeouts: ServerTimeouts,
    acceptor: TlsAcceptor,
    router: axum::Router,
    proxy: Arc<CachingResolver>,
    listen_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    running: watch::Sender<bool>,
}

impl HttpsServer {
    /// Fails when no zone supplies a TLS configuration.
    pub fn new(
        section: &ServerSection,
        zones: Vec<ZoneConfig>,
        doh: DohHandler,
        proxy: Arc<CachingResolver>,
        metrics: Arc<EdgeMetrics>,
    ) -> Result<Self> {
        section.timeouts.validate()?;
        let Some(tls_config) = zones.iter().rev().find_map(|zone| zone.tls.clone()) else {
            bail!("DNS-over-HTTPS requires a TLS configuration on at least one zone");
        };
        let validator = zones
            .iter()
            .rev()
            .find_map(|zone| zone.validator.clone())
            .unwrap_or_else(|| Arc::new(PathValidator::new(proxy.endpoints())));

        let state = Arc::new(AppState {
            validator,
            doh,
            proxy: proxy.clone(),
            metrics,
        });

        Ok(Self {
            addr: section.listen.clone(),
            zones: zones.into_iter().map(|zone| zone.zone).collect(),
            quiet: section.quiet,
            timeouts: section.timeouts,
            acceptor: TlsAcceptor::from(tls::with_http_alpn(&tls_config)),
            router: router::build_router(state),
            proxy,
            listen_addr: Mutex::new(None),
            shutdown: watch::channel(false).0,
            running: watch::channel(false).0,
        })
    }

    pub async fn listen(&self) -> Result<TcpListener> {
        let socket_addr: SocketAddr = self
            .addr
            .parse()
            .with_context(|| format!("Invalid HTTPS listener address: {}", self.addr))?;
        TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("Failed to bind HTTPS listener at {socket_addr}"))
    }

    /// Accept and serve connections until [`stop`](Self::stop) is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if *self.shutdown.borrow() {
            return Ok(());
        }
        let local = listener
            .local_addr()
            .context("Unable to resolve HTTPS listener address")?;
        if let Ok(mut slot) = self.listen_addr.lock() {
            *slot = Some(local);
        }
        self.running.send_replace(true);
        self.on_startup_complete();

        let mut shutdown = self.shutdown.subscribe();
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!(listener = %local, "Stopping HTTPS listener");
                    break;
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accept_result = listener.accept() => {
                    let (stream, peer) = match accept_result {
                        Ok(pair) => pair,
                        Err(err) => {
                            error!(error = %err, "Failed to accept HTTPS connection");
                            continue;
                        }
                    };
                    let connection = Connection {
                        acceptor: self.acceptor.clone(),
                        router: self.router.clone(),
                        timeouts: self.timeouts,
                        local,
                        peer,
                        shutdown: self.shutdown.subscribe(),
                    };
                    connections.spawn(async move {
                        if let Err(err) = connection.run(stream).await {
                            debug!(peer = %peer, error = %err, "HTTPS connection terminated with error");
                        }
                    });
                }
            }
        }
        drop(listener);

        let grace = self.timeouts.shutdown_grace();
        let drained = timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Graceful drain timed out; aborting open connections"
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        self.running.send_replace(false);
        Ok(())
    }

    /// Address the listener is bound to once `serve` has started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr.lock().ok().and_then(|addr| *addr)
    }

    pub fn startup_report(&self) -> Vec<String> {
        let port = self
            .listen_addr()
            .map(|addr| addr.port().to_string())
            .or_else(|| self.addr.rsplit_once(':').map(|(_, port)| port.to_string()))
            .unwrap_or_default();
        self.zones
            .iter()
            .map(|zone| format!("https://{zone}:{port}"))
            .collect()
    }

    pub fn on_startup_complete(&self) {
        if self.quiet {
            return;
        }
        for line in self.startup_report() {
            info!("{line}");
        }
    }

    /// Receiver that flips to `true` once the server starts stopping.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop accepting and drain open connections. Safe to call repeatedly
    /// and before `serve`.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let mut running = self.running.subscribe();
        let bound = self.timeouts.shutdown_grace() + Duration::from_secs(1);
        if timeout(bound, running.wait_for(|running| !*running))
            .await
            .is_err()
        {
            warn!("HTTPS listener did not stop within the shutdown grace period");
        }
    }

    /// Stop the listener, then release the proxy's cache store.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop().await;
        self.proxy.close().await
    }
}

struct Connection {
    acceptor: TlsAcceptor,
    router: axum::Router,
    timeouts: ServerTimeouts,
    local: SocketAddr,
    peer: SocketAddr,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    async fn run(mut self, stream: TcpStream) -> Result<()> {
        let tls_stream = timeout(self.timeouts.read(), self.acceptor.accept(stream))
            .await
            .context("TLS handshake timed out")?
            .context("TLS handshake with HTTPS client failed")?;

        let activity = Arc::new(Activity::new());
        let service = {
            let activity = activity.clone();
            let router = self.router.clone();
            let (local, peer) = (self.local, self.peer);
            let write_timeout = self.timeouts.write();
            service_fn(move |mut request: hyper::Request<Incoming>| {
                request.extensions_mut().insert(LocalAddr(local));
                request.extensions_mut().insert(ConnectInfo(peer));
                let router = router.clone();
                let activity = activity.clone();
                async move {
                    activity.begin();
                    let result = timeout(write_timeout, router.oneshot(request)).await;
                    activity.end();
                    match result {
                        Ok(Ok(response)) => Ok(response),
                        Ok(Err(never)) => match never {},
                        Err(elapsed) => {
                            warn!(peer = %peer, "Response not written within write timeout");
                            Err(elapsed)
                        }
                    }
                }
            })
        };

        let mut builder = Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.timeouts.read());
        builder.http2().timer(TokioTimer::new());

        let connection = builder.serve_connection(TokioIo::new(tls_stream), service);
        tokio::pin!(connection);

        let idle = self.timeouts.idle();
        let mut idle_check =
            time::interval(idle.clamp(Duration::from_millis(100), Duration::from_secs(1)));
        let mut closing = false;
        loop {
            tokio::select! {
                result = connection.as_mut() => {
                    return result.map_err(|err| anyhow!("{err}"));
                }
                _ = self.shutdown.wait_for(|stop| *stop), if !closing => {
                    connection.as_mut().graceful_shutdown();
                    closing = true;
                }
                _ = idle_check.tick(), if !closing => {
                    if activity.idle_for() >= idle {
                        debug!(peer = %self.peer, "Closing idle HTTPS connection");
                        connection.as_mut().graceful_shutdown();
                        closing = true;
                    }
                }
            }
        }
    }
}

/// In-flight request count and time of last activity on one connection.
struct Activity {
    in_flight: AtomicUsize,
    last_seen: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    fn end(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.touch();
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_seen.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return Duration::ZERO;
        }
        self.last_seen
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::pipeline::{DnsPipeline, ResponseCapture};
    use futures_util::future::BoxFuture;
    use hickory_proto::op::Message;
    use tempfile::{TempDir, tempdir};
    use tokio::io::AsyncWriteExt;
    use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
    use tokio_rustls::rustls::sign::CertifiedKey;

    #[derive(Debug)]
    struct NoCertificate;

    impl ResolvesServerCert for NoCertificate {
        fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
            None
        }
    }

    struct NullPipeline;

    impl DnsPipeline for NullPipeline {
        fn serve_dns<'a>(
            &'a self,
            _request: &'a Message,
            _writer: &'a mut ResponseCapture,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async {})
        }
    }

    fn tls_zone(name: &str) -> ZoneConfig {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(NoCertificate));
        ZoneConfig {
            zone: name.into(),
            tls: Some(Arc::new(config)),
            validator: None,
        }
    }

    fn build(dir: &TempDir, zones: Vec<ZoneConfig>) -> Result<HttpsServer> {
        let metrics = Arc::new(EdgeMetrics::new()?);
        let proxy_config = ProxyConfig {
            cache_path: dir.path().join("cache.sqlite"),
            ..ProxyConfig::default()
        };
        let proxy = Arc::new(CachingResolver::open(&proxy_config, metrics.clone())?);
        let doh = DohHandler::new(Arc::new(NullPipeline), metrics.clone(), Duration::from_secs(5));
        let section = ServerSection {
            listen: "127.0.0.1:0".into(),
            timeouts: ServerTimeouts {
                shutdown_grace_secs: 1,
                ..ServerTimeouts::default()
            },
            ..ServerSection::default()
        };
        HttpsServer::new(&section, zones, doh, proxy, metrics)
    }

    #[tokio::test]
    async fn construction_requires_tls() -> Result<()> {
        let dir = tempdir()?;
        let err = build(&dir, vec![ZoneConfig::new("example.org.")])
            .err()
            .expect("missing TLS must fail");
        assert!(err.to_string().contains("TLS"));
        Ok(())
    }

    #[tokio::test]
    async fn any_zone_with_tls_is_enough() -> Result<()> {
        let dir = tempdir()?;
        let server = build(
            &dir,
            vec![ZoneConfig::new("plain.org."), tls_zone("secure.org.")],
        )?;
        assert_eq!(
            server.startup_report(),
            vec!["https://plain.org.:0", "https://secure.org.:0"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn construction_rejects_zero_idle_timeout() -> Result<()> {
        let dir = tempdir()?;
        let metrics = Arc::new(EdgeMetrics::new()?);
        let proxy_config = ProxyConfig {
            cache_path: dir.path().join("cache.sqlite"),
            ..ProxyConfig::default()
        };
        let proxy = Arc::new(CachingResolver::open(&proxy_config, metrics.clone())?);
        let doh = DohHandler::new(Arc::new(NullPipeline), metrics.clone(), Duration::from_secs(5));
        let section = ServerSection {
            timeouts: ServerTimeouts {
                idle_secs: 0,
                ..ServerTimeouts::default()
            },
            ..ServerSection::default()
        };
        let result = HttpsServer::new(&section, vec![tls_zone(".")], doh, proxy, metrics);
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn stop_and_shutdown_without_serve_are_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let server = build(&dir, vec![tls_zone(".")])?;
        server.stop().await;
        server.stop().await;
        server.shutdown().await?;
        server.shutdown().await?;
        assert!(server.listen_addr().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn serve_returns_after_stop() -> Result<()> {
        let dir = tempdir()?;
        let server = Arc::new(build(&dir, vec![tls_zone(".")])?);
        let listener = server.listen().await?;
        let bound = listener.local_addr()?;

        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        while server.listen_addr().is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(server.listen_addr(), Some(bound));
        assert_eq!(server.startup_report(), vec![format!("https://.:{}", bound.port())]);

        // A client that never completes the handshake must not block shutdown.
        let mut client = TcpStream::connect(bound).await?;
        client.write_all(b"not tls").await?;

        server.shutdown().await?;
        serving.await??;
        Ok(())
    }

    #[tokio::test]
    async fn serve_after_stop_returns_immediately() -> Result<()> {
        let dir = tempdir()?;
        let server = build(&dir, vec![tls_zone(".")])?;
        let listener = server.listen().await?;
        server.stop().await;
        server.serve(listener).await?;
        assert!(server.listen_addr().is_none());
        Ok(())
    }
}
