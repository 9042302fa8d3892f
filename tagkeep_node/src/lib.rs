//! The tagkeep node: an LRU-aware reverse proxy in front of a
//! Distribution-compatible registry.
//!
//! This crate wires the pieces into a running service:
//!
//! - **Proxy surface**: every request is forwarded to the single upstream
//!   registry; manifest `HEAD`/`PUT` URLs additionally update the usage
//!   index ([`proxy`]).
//! - **Maintenance**: a cron-scheduled clean cycle evicts the least
//!   recently used tags and drives the registry's own garbage collector
//!   until disk usage meets the configured target ([`clean`],
//!   [`schedule`]).
//! - **Admission**: the [`gate::MaintenanceGate`] keeps registry writes
//!   and maintenance from overlapping; pulls are never blocked.
//!
//! This crate is primarily used by the `tagkeep_cli` binary, but can be
//! embedded in other applications. See [`run`] for the entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use tagkeep_index::UsageIndex;
use tagkeep_registry::{HttpRegistry, RegistryGc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod clean;
pub mod config;
pub mod disk;
pub mod gate;
pub mod proxy;
pub mod schedule;

use clean::Cleaner;
use config::{CleanSettings, ProxySettings};
use disk::{DiskProbe, StatfsProbe, WalkProbe};
use gate::MaintenanceGate;
use proxy::ProxyState;

/// How long in-flight requests get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Starts the proxy and blocks until shutdown. Returns an error for any
/// startup failure (bad TLS material, unusable cron schedule, listener
/// failure); the CLI turns that into exit code 1.
pub async fn run(settings: ProxySettings, clean: CleanSettings) -> anyhow::Result<()> {
    let index = UsageIndex::open(&settings.db_dir)
        .with_context(|| format!("opening usage db under {}", settings.db_dir.display()))?;
    let gate = MaintenanceGate::new();
    let cancel = CancellationToken::new();

    let cron = schedule::parse_schedule(&clean.cron_schedule)
        .with_context(|| format!("invalid cron schedule {:?}", clean.cron_schedule))?;
    let tz = schedule::parse_time_zone(&clean.time_zone);

    let disk: Arc<dyn DiskProbe> = if clean.use_optimized_disk_calculation {
        Arc::new(StatfsProbe::new(&clean.registry_dir))
    } else {
        Arc::new(WalkProbe::new(&clean.registry_dir))
    };
    let cleaner = Cleaner {
        index: index.clone(),
        registry: Arc::new(HttpRegistry::new(
            &settings.registry_scheme,
            &settings.registry_host,
        )?),
        gc: Arc::new(RegistryGc::new(&clean.registry_binary, &clean.registry_config)),
        disk,
        gate: gate.clone(),
        registry_host: settings.registry_host.clone(),
        settings: clean,
    };
    let scheduler = tokio::spawn(schedule::run_clean_schedule(
        cleaner,
        cron,
        tz,
        cancel.clone(),
    ));

    let tls = match (&settings.cert_file, &settings.key_file) {
        (Some(cert), Some(key)) => Some(
            RustlsConfig::from_pem_file(cert, key)
                .await
                .context("loading TLS certificate and key")?,
        ),
        _ => None,
    };
    let state = ProxyState {
        upstream: reqwest::Url::parse(&format!(
            "{}://{}",
            settings.registry_scheme, settings.registry_host
        ))?,
        client: reqwest::Client::new(),
        index,
        gate: gate.clone(),
        use_forwarded_headers: settings.use_forwarded_headers,
        tls_enabled: tls.is_some(),
    };
    let app = proxy::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let handle = axum_server::Handle::new();
    {
        let cancel = cancel.clone();
        let gate = gate.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            // Abort any in-flight clean cycle (including the external GC
            // child) before draining the HTTP side.
            cancel.cancel();
            gate.close();
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });
    }

    info!(%addr, tls = tls.is_some(), upstream = %settings.registry_host, "proxy listening");
    match tls {
        Some(tls) => {
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?
        }
        None => {
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await?
        }
    }

    let _ = scheduler.await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(%err, "cannot install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
