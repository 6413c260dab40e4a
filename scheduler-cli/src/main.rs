//! Binary entry point for the scheduler: loads `SchedulerSettings`, builds a
//! `Registry` wired to the configured coordination backend, starts the
//! status monitor, and drains everything through `Lifecycle::shutdown` on
//! SIGTERM/SIGINT. Mirrors the teacher's `agent/src/main.rs` shape (jemalloc
//! allocator, `clap` args, `tracing` init, unix/non-unix signal handling)
//! without the network-monitoring specifics that belong to a caller's own
//! task classes — registering concrete `TaskHooks` implementations is the
//! embedding application's job, not this crate's (spec.md §1's scope note:
//! component discovery / scanning is a collaborator interface, not
//! implemented here).

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use scheduler_core::coordination::empty::EmptyPort;
use scheduler_core::{CoordinationPort, Lifecycle, Registry, SchedulerSettings};

/// Command-line arguments for the scheduler host process.
#[derive(Parser, Debug)]
#[command(name = "scheduler-cli")]
#[command(about = "Process-local, cluster-aware task scheduler host", long_about = None)]
struct CliArgs {
    /// Directory containing scheduler.toml
    #[arg(value_name = "CONFIG_DIR")]
    config_dir: PathBuf,

    /// Override scheduler.etcd_enable from the config file
    #[arg(long = "etcd-enable", value_name = "BOOL")]
    etcd_enable: Option<bool>,

    /// Override scheduler.shutdown_timeout_ms from the config file
    #[arg(long = "shutdown-timeout-ms", value_name = "MS")]
    shutdown_timeout_ms: Option<u64>,
}

/// Built coordination backend plus, when it's a live `EtcdPort`, the handle
/// needed to spawn its background tasks once a `Registry` exists to hand
/// them (`EtcdPort::spawn_ttl_refresher` and
/// `scheduler_core::coordination::etcd::spawn_command_watcher` both need to
/// run against the same connection `coordination` already holds).
struct CoordinationBuild {
    port: Arc<dyn CoordinationPort>,
    #[cfg(feature = "etcd")]
    etcd: Option<Arc<scheduler_core::coordination::etcd::EtcdPort>>,
}

async fn build_coordination_port(settings: &SchedulerSettings) -> Result<CoordinationBuild> {
    if !settings.etcd_enable {
        return Ok(CoordinationBuild {
            port: Arc::new(EmptyPort),
            #[cfg(feature = "etcd")]
            etcd: None,
        });
    }

    #[cfg(feature = "etcd")]
    {
        let port = Arc::new(
            scheduler_core::coordination::etcd::EtcdPort::connect(&settings.etcd_endpoints, "/scheduler")
                .await
                .context("connecting to etcd")?,
        );
        Ok(CoordinationBuild {
            port: port.clone(),
            etcd: Some(port),
        })
    }

    #[cfg(not(feature = "etcd"))]
    {
        anyhow::bail!(
            "scheduler.etcd_enable=true but this binary was built without the `etcd` feature"
        )
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        info!("received Ctrl+C");
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let file_appender = tracing_appender::rolling::daily("./logs", "scheduler.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scheduler_core=info,scheduler_cli=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();
    info!(config_dir = %cli_args.config_dir.display(), "scheduler starting up");

    let mut settings = SchedulerSettings::load(cli_args.config_dir.join("scheduler.toml"))
        .await
        .context("loading scheduler.toml")?;

    if let Some(etcd_enable) = cli_args.etcd_enable {
        info!(etcd_enable, "applying --etcd-enable override");
        settings.etcd_enable = etcd_enable;
    }
    if let Some(ms) = cli_args.shutdown_timeout_ms {
        info!(shutdown_timeout_ms = ms, "applying --shutdown-timeout-ms override");
        settings.shutdown_timeout_ms = ms;
    }

    let build = match build_coordination_port(&settings).await {
        Ok(build) => build,
        Err(e) => {
            error!(error = %e, "failed to initialise coordination backend");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(Registry::new(build.port));
    let _monitor = registry.spawn_status_monitor();

    #[cfg(feature = "etcd")]
    let _etcd_tasks = if let Some(etcd) = build.etcd.as_ref() {
        let ttl_refresher = etcd
            .spawn_ttl_refresher(settings.etcd_lease_ttl_secs)
            .await
            .context("starting etcd lease refresher")?;
        let command_watcher =
            scheduler_core::coordination::etcd::spawn_command_watcher(etcd, registry.clone());
        Some((ttl_refresher, command_watcher))
    } else {
        None
    };

    info!(
        etcd_enable = settings.etcd_enable,
        base_package = %settings.base_package,
        "scheduler registry ready; awaiting task registration from the embedding application"
    );

    shutdown_signal().await;

    let lifecycle = Lifecycle::new(registry.clone(), Duration::from_millis(settings.shutdown_timeout_ms));
    lifecycle.shutdown().await;

    info!("scheduler shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_args_parse_config_dir() {
        let args = CliArgs::parse_from(["scheduler-cli", "/etc/scheduler"]);
        assert_eq!(args.config_dir, PathBuf::from("/etc/scheduler"));
        assert!(args.etcd_enable.is_none());
    }

    #[test]
    fn cli_args_parse_overrides() {
        let args = CliArgs::parse_from([
            "scheduler-cli",
            "/etc/scheduler",
            "--etcd-enable",
            "true",
            "--shutdown-timeout-ms",
            "5000",
        ]);
        assert_eq!(args.etcd_enable, Some(true));
        assert_eq!(args.shutdown_timeout_ms, Some(5000));
    }
}
