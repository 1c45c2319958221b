use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use dohedge::config::{RuntimeConfig, default_config_path};
use dohedge::doh::DohHandler;
use dohedge::metrics::{EdgeMetrics, run_metrics_server};
use dohedge::pipeline::ForwardPipeline;
use dohedge::proxy::CachingResolver;
use dohedge::server::{HttpsServer, ZoneConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dohedge", version, about = "DNS-over-HTTPS edge with a caching resolver proxy", long_about = None)]
struct Args {
    /// Override path to dohedge.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the HTTPS listen address
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Increase logging verbosity
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        "dohedge=debug"
    } else {
        "dohedge=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn resolve_config_path(override_path: Option<PathBuf>) -> Result<PathBuf> {
    match override_path {
        Some(path) => Ok(path),
        None => default_config_path(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = resolve_config_path(args.config)?;
    let mut config = RuntimeConfig::load_or_default(&config_path)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    info!(config = %config_path.display(), "Starting dohedge");

    let metrics = Arc::new(EdgeMetrics::new().context("Failed to register metrics")?);
    let pipeline = ForwardPipeline::new(&config.pipeline)?;
    match config.pipeline.provider() {
        Some(provider) => info!(
            profile = provider.name,
            provider = provider.description,
            upstream = %pipeline.endpoint(),
            "Forwarding DNS queries to upstream profile"
        ),
        None => info!(upstream = %pipeline.endpoint(), "Forwarding DNS queries upstream"),
    }
    let doh = DohHandler::new(
        Arc::new(pipeline),
        metrics.clone(),
        config.server.timeouts.read(),
    );
    let proxy = Arc::new(CachingResolver::open(&config.proxy, metrics.clone())?);

    let zones = config
        .zones
        .iter()
        .map(ZoneConfig::from_section)
        .collect::<Result<Vec<_>>>()?;
    let server = Arc::new(HttpsServer::new(
        &config.server,
        zones,
        doh,
        proxy,
        metrics.clone(),
    )?);

    let listener = server.listen().await?;
    let mut serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    let metrics_task = config.server.metrics_listen.clone().map(|addr| {
        let metrics = metrics.clone();
        let shutdown = server.shutdown_signal();
        tokio::spawn(async move {
            if let Err(err) = run_metrics_server(&addr, metrics, shutdown).await {
                warn!(error = %err, "Metrics server exited with error");
            }
        })
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received; stopping dohedge");
            server.shutdown().await?;
            (&mut serving).await.context("HTTPS listener task panicked")??;
        }
        result = &mut serving => {
            server.shutdown().await?;
            result.context("HTTPS listener task panicked")??;
        }
    }
    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    Ok(())
}
