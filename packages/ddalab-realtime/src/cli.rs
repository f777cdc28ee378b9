use clap::{Parser, Subcommand};

/// DDALAB Realtime Analyzer - streaming EEG quality and spectral analysis
#[derive(Parser)]
#[command(name = "ddalab-realtime")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable debug logging (overrides REALTIME_ANALYZER_DEBUG)
    #[arg(long, global = true)]
    pub debug: bool,

    /// AMQP broker URL
    #[arg(long, env = "RABBITMQ_URL", global = true)]
    pub bus_url: Option<String>,

    /// Seconds between periodic health log lines
    #[arg(long, default_value = "60", global = true)]
    pub health_log_seconds: u64,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Consume telemetry and run analysis (default)
    Run,

    /// Validate the configuration and list registered applications
    CheckConfig,
}
