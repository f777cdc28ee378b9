use clap::Parser;
use ddalab_realtime::{
    applications,
    bus::{AmqpTransport, BusTransport, TransportFactory},
    cli::{Cli, Commands},
    RealtimeConfig, RealtimeHost,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often dead background tasks are looked for
const SUPERVISE_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = RealtimeConfig::from_env()?;
    if cli.debug {
        config.debug = true;
    }
    if let Some(url) = cli.bus_url.filter(|url| !url.trim().is_empty()) {
        config.bus_url = url;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let host = RealtimeHost::new(config.clone(), applications::builtin());

    if let Some(Commands::CheckConfig) = cli.command {
        let transport = AmqpTransport::new(config.bus_url.clone(), config.exchange.clone());
        println!("Configuration OK");
        println!("  Broker:            {}", transport.describe());
        println!("  Analysis window:   {}s", config.analysis_window_seconds);
        println!("  Analysis interval: {:?}", config.analysis_interval);
        println!("  Buffer retention:  {}s", config.retention_seconds);
        println!("  Applications:");
        for app in host.applications_summary() {
            println!("    {:<16} {}", app.app_id, app.display_name);
        }
        return Ok(());
    }

    info!("🚀 Starting DDALAB Realtime Analyzer v{}", VERSION);
    info!("📋 Configuration loaded:");
    info!("   Exchange: {}", config.exchange);
    info!("   Analysis window: {}s", config.analysis_window_seconds);
    info!("   Analysis interval: {:?}", config.analysis_interval);
    info!("   Buffer retention: {}s", config.retention_seconds);
    info!("   Parallel device analysis: {}", config.parallel_device_analysis);

    let factory: TransportFactory = {
        let url = config.bus_url.clone();
        let exchange = config.exchange.clone();
        Arc::new(move || {
            Box::new(AmqpTransport::new(url.clone(), exchange.clone())) as Box<dyn BusTransport>
        })
    };
    host.start_background_tasks(factory);

    let mut supervise = time::interval(SUPERVISE_INTERVAL);
    let health_period = Duration::from_secs(cli.health_log_seconds.max(1));
    let mut health_log = time::interval_at(time::Instant::now() + health_period, health_period);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
            _ = supervise.tick() => {
                let relaunched = host.ensure_background_tasks();
                if !relaunched.is_empty() {
                    warn!("Relaunched background tasks: {}", relaunched.join(", "));
                }
            }
            _ = health_log.tick() => {
                let health = host.health();
                if health.bus_connected {
                    debug!(
                        "Health {}: {} devices, {} frames ingested",
                        health.status, health.devices, health.consumer.ingested
                    );
                } else {
                    warn!(
                        "Health {}: bus disconnected ({} reconnects)",
                        health.status, health.consumer.reconnects
                    );
                }
            }
        }
    }

    host.shutdown().await;
    Ok(())
}
