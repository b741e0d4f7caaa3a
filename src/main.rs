use anyhow::Context;
use std::path::{Path, PathBuf};
use tenantgate::config::Config;
use tenantgate::gateway::Gateway;
use tenantgate::{PKG_NAME, VERSION};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenantgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gateway.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let gateway = Gateway::new(&config.server)?;
    gateway.open_slot_reservation()?;

    if let Err(e) = bootstrap(&gateway, &config).await {
        error!(error = %e, "Startup failed, stopping connectors");
        if let Err(e) = gateway.shutdown().await {
            warn!(error = %e, "Error while stopping connectors");
        }
        return Err(e);
    }

    tokio::spawn(handle_signals(gateway.clone(), config_path));

    gateway.wait_for_completion().await?;

    let upstream = gateway.upstream_stats();
    info!(
        upstream_requests = upstream.get_total_requests(),
        upstream_failures = upstream.get_failed_requests(),
        "Shutdown complete"
    );
    Ok(())
}

/// Register certificates, open connectors and create tenants from the config file
async fn bootstrap(gateway: &Gateway, config: &Config) -> anyhow::Result<()> {
    for certificate in &config.certificates {
        let chain = read_pem(&certificate.cert_file)?;
        let key = read_pem(&certificate.key_file)?;
        gateway
            .add_certificate(&key, &chain)
            .with_context(|| format!("certificate {}", certificate.cert_file.display()))?;
    }

    for (name, connector) in &config.connectors {
        let addr = gateway
            .create_server_connector(name, connector)
            .await
            .with_context(|| format!("connector '{}'", name))?;
        info!(connector = %name, addr = %addr, tls = connector.tls, "Connector ready");
    }

    for (id, tenant) in &config.tenants {
        gateway
            .create_tenant(id, tenant.clone())
            .with_context(|| format!("tenant '{}'", id))?;
    }

    info!(
        connectors = config.connectors.len(),
        tenants = config.tenants.len(),
        routes = gateway.tenants().route_count(),
        "Gateway running"
    );
    Ok(())
}

fn read_pem(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))
}

/// Shut down on SIGINT or SIGTERM; reload tenants on SIGHUP
async fn handle_signals(gateway: Gateway, config_path: PathBuf) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGHUP handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading tenants...");
                    reload_tenants(&gateway, &config_path);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = &config_path;
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Received Ctrl+C, shutting down...");
    }

    if let Err(e) = gateway.shutdown().await {
        error!(error = %e, "Error during shutdown");
    }
}

#[cfg_attr(not(unix), allow(dead_code))]
fn reload_tenants(gateway: &Gateway, config_path: &Path) {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to reload configuration");
            return;
        }
    };

    match gateway.reconcile_tenants(&config.tenants) {
        Ok(result) => {
            info!(
                added = result.added.len(),
                updated = result.updated.len(),
                removed = result.removed.len(),
                failed = result.failed.len(),
                "Tenants reloaded"
            );
            for (id, reason) in &result.failed {
                warn!(tenant = %id, error = %reason, "Tenant not applied");
            }
        }
        Err(e) => error!(error = %e, "Failed to reload tenants"),
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        header_read_timeout_secs = config.server.header_read_timeout_secs,
        "Server settings"
    );
    for (name, connector) in &config.connectors {
        info!(
            connector = %name,
            bind = %connector.bind_address,
            port = connector.port,
            tls = connector.tls,
            "Configured connector"
        );
    }
    info!(
        certificates = config.certificates.len(),
        tenants = ?config.tenants.keys().collect::<Vec<_>>(),
        "Configured tenants"
    );
}
