use std::{path::Path, sync::Arc};

use anyhow::{Context, Result, bail};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// ALPN list advertised by the listener: HTTP/2 first so DoH clients can
/// multiplex, HTTP/1.1 as fallback.
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certificates(cert_path)?, load_private_key(key_path)?)
        .context("Invalid TLS certificate or key")?;
    Ok(Arc::new(config))
}

/// Copy of `config` whose ALPN list prefers HTTP/2 over HTTP/1.1.
pub fn with_http_alpn(config: &ServerConfig) -> Arc<ServerConfig> {
    let mut config = config.clone();
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|proto| proto.to_vec()).collect();
    Arc::new(config)
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .with_context(|| format!("Unable to open certificate file {}", path.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates from {}", path.display()))?;
    if certs.is_empty() {
        bail!("No certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path)
        .with_context(|| format!("No usable private key found in {}", path.display()))
}
