use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use serde::Deserialize;
use tracing::warn;

pub(crate) const DEFAULT_UPSTREAM_PROFILE: &str = "cloudflare";

/// A named public DoH resolver the forwarding pipeline can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamProvider {
    pub name: &'static str,
    pub doh_endpoint: &'static str,
    pub description: &'static str,
}

const UPSTREAM_PROVIDERS: &[UpstreamProvider] = &[
    UpstreamProvider {
        name: "cloudflare",
        doh_endpoint: "https://cloudflare-dns.com/dns-query",
        description: "Cloudflare (1.1.1.1)",
    },
    UpstreamProvider {
        name: "google",
        doh_endpoint: "https://dns.google/dns-query",
        description: "Google Public DNS",
    },
    UpstreamProvider {
        name: "quad9",
        doh_endpoint: "https://dns.quad9.net/dns-query",
        description: "Quad9 (threat blocking)",
    },
    UpstreamProvider {
        name: "mullvad",
        doh_endpoint: "https://doh.mullvad.net/dns-query",
        description: "Mullvad Privacy DNS",
    },
];

pub fn resolve_upstream_profile(name: &str) -> Option<&'static UpstreamProvider> {
    let lower = name.trim().to_ascii_lowercase();
    UPSTREAM_PROVIDERS
        .iter()
        .find(|provider| provider.name == lower)
}

/// Runtime configuration parsed from `dohedge.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default = "default_zones")]
    pub zones: Vec<ZoneSection>,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

impl RuntimeConfig {
    pub fn load_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to read dohedge config at {}", path.display()))?;
        let cfg: RuntimeConfig = toml::from_str(&raw)
            .with_context(|| format!("Malformed dohedge config at {}", path.display()))?;
        cfg.server
            .timeouts
            .validate()
            .with_context(|| format!("Invalid [server.timeouts] in {}", path.display()))?;
        Ok(cfg)
    }

    /// Load the file when it exists, otherwise fall back to built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load_file(path);
        }
        warn!(path = %path.display(), "dohedge config missing; using defaults");
        Ok(Self::default())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            zones: default_zones(),
            pipeline: PipelineSection::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "dohedge", "dohedge")
        .context("Unable to resolve platform config directory")?;
    Ok(dirs.config_dir().join("dohedge.toml"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub metrics_listen: Option<String>,
    #[serde(default)]
    pub timeouts: ServerTimeouts,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            quiet: false,
            metrics_listen: None,
            timeouts: ServerTimeouts::default(),
        }
    }
}

/// Connection timeouts applied by the HTTPS listener.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ServerTimeouts {
    pub read_secs: u64,
    pub write_secs: u64,
    pub idle_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl ServerTimeouts {
    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Read, write and idle timeouts must be non-zero; a zero grace period
    /// aborts open connections immediately on shutdown.
    pub fn validate(&self) -> Result<()> {
        for (name, secs) in [
            ("read_secs", self.read_secs),
            ("write_secs", self.write_secs),
            ("idle_secs", self.idle_secs),
        ] {
            if secs == 0 {
                bail!("server timeout {name} must be at least 1 second");
            }
        }
        Ok(())
    }
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            read_secs: 5,
            write_secs: 10,
            idle_secs: 120,
            shutdown_grace_secs: 5,
        }
    }
}

/// One zone served by this listener; only zones carrying a certificate
/// contribute a TLS configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneSection {
    pub name: String,
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_upstream_profile_option")]
    pub profile: Option<String>,
    #[serde(default)]
    pub upstream_doh: Option<String>,
    #[serde(default = "default_pipeline_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub ecs_passthrough: bool,
}

impl PipelineSection {
    /// Explicit endpoint wins over a named profile; unknown profiles fall back
    /// to the default provider.
    pub fn doh_endpoint(&self) -> String {
        if let Some(endpoint) = self.upstream_doh.as_deref() {
            if !endpoint.trim().is_empty() {
                return endpoint.trim().to_string();
            }
        }
        if let Some(name) = self.profile.as_deref() {
            if let Some(provider) = resolve_upstream_profile(name) {
                return provider.doh_endpoint.into();
            }
            warn!(profile = name, "Unknown upstream profile; using default provider");
        }
        default_upstream_provider().doh_endpoint.into()
    }

    /// Named provider in use, if the endpoint was not given explicitly.
    pub fn provider(&self) -> Option<&'static UpstreamProvider> {
        let explicit = self
            .upstream_doh
            .as_deref()
            .is_some_and(|endpoint| !endpoint.trim().is_empty());
        if explicit {
            return None;
        }
        Some(
            self.profile
                .as_deref()
                .and_then(resolve_upstream_profile)
                .unwrap_or_else(default_upstream_provider),
        )
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            profile: default_upstream_profile_option(),
            upstream_doh: None,
            timeout_secs: default_pipeline_timeout(),
            ecs_passthrough: false,
        }
    }
}

/// Static mapping from an inbound request path to a cache namespace and an
/// upstream path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointMapping {
    pub path: String,
    pub query_type: String,
    pub upstream_path: String,
    /// Match `path` as a prefix and append the remainder upstream.
    #[serde(default)]
    pub prefix: bool,
}

/// Settings for the caching resolver proxy and its upstream client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub upstream_base_url: String,
    pub cache_path: PathBuf,
    pub cache_ttl_secs: u64,
    /// Advertised in `Cache-Control`; independent of `cache_ttl_secs`.
    pub advertised_max_age_secs: u64,
    pub upstream_timeout_secs: u64,
    /// Idle upstream connections kept open. Applied per host by the client,
    /// which equals the total cap for the single upstream host.
    pub max_idle_connections: usize,
    pub map_result_codes: bool,
    pub result_codes: HashMap<String, u16>,
    pub unmapped_status: u16,
    pub endpoints: Vec<EndpointMapping>,
}

impl ProxyConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_base_url: "http://127.0.0.1:9527".into(),
            cache_path: default_cache_path(),
            cache_ttl_secs: 3600,
            advertised_max_age_secs: 300,
            upstream_timeout_secs: 10,
            max_idle_connections: 10,
            map_result_codes: true,
            result_codes: default_result_codes(),
            unmapped_status: 404,
            endpoints: default_endpoints(),
        }
    }
}

pub fn default_result_codes() -> HashMap<String, u16> {
    HashMap::from([
        ("200".to_string(), 200),
        ("001001".to_string(), 400),
        ("200001".to_string(), 400),
        ("200002".to_string(), 401),
    ])
}

pub fn default_endpoints() -> Vec<EndpointMapping> {
    vec![
        EndpointMapping {
            path: "/ma/node".into(),
            query_type: "node".into(),
            upstream_path: "/api/v1/node".into(),
            prefix: false,
        },
        EndpointMapping {
            path: "/ma/idcode".into(),
            query_type: "idcode".into(),
            upstream_path: "/api/v1/idcode".into(),
            prefix: false,
        },
    ]
}

fn default_cache_path() -> PathBuf {
    match ProjectDirs::from("dev", "dohedge", "dohedge") {
        Some(dirs) => dirs.cache_dir().join("resolver-cache.sqlite"),
        None => std::env::temp_dir()
            .join("dohedge")
            .join("resolver-cache.sqlite"),
    }
}

fn default_listen() -> String {
    "0.0.0.0:443".into()
}

fn default_zones() -> Vec<ZoneSection> {
    vec![ZoneSection {
        name: ".".into(),
        tls_cert_path: None,
        tls_key_path: None,
    }]
}

fn default_pipeline_timeout() -> u64 {
    5
}

fn default_upstream_profile_option() -> Option<String> {
    Some(DEFAULT_UPSTREAM_PROFILE.into())
}

fn default_upstream_provider() -> &'static UpstreamProvider {
    &UPSTREAM_PROVIDERS[0]
}
