use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;
use tagkeep_core::parse_byte_string;
use tagkeep_node::config::{CleanSettings, ProxySettings};
use tracing::warn;

#[derive(Parser)]
#[command(version, about = "LRU cache proxy for a container image registry", long_about = None)]
struct Cli {
    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy with the provided settings
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// listen port
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// x509 server certificate
    #[arg(long, value_name = "FILE")]
    cert: Option<PathBuf>,

    /// x509 server key
    #[arg(long, value_name = "FILE")]
    key: Option<PathBuf>,

    /// directory holding the usage database
    #[arg(long, value_name = "DIR", default_value = "/var/lib/registry")]
    db_dir: PathBuf,

    /// registry binary used for garbage collection
    #[arg(long, value_name = "FILE", default_value = "/registry/bin/registry")]
    registry_bin: PathBuf,

    /// registry config passed to garbage collection
    #[arg(long, value_name = "FILE", default_value = "/etc/docker/registry/config.yml")]
    registry_conf: PathBuf,

    /// upstream registry host
    #[arg(long, default_value = "127.0.0.1:5000")]
    registry_host: String,

    /// upstream registry scheme
    #[arg(long, default_value = "http")]
    registry_scheme: String,

    /// registry storage directory to measure
    #[arg(long, value_name = "DIR", default_value = "/var/lib/registry")]
    registry_dir: PathBuf,

    /// target disk usage for a clean cycle; scheduled cycles evict tags
    /// until this threshold is met (suffix Ki, Mi or Gi)
    #[arg(long, default_value = "50Gi")]
    target_disk_usage: String,

    /// percentage of least recently used tags to remove per iteration of
    /// a clean cycle until the target usage is reached
    #[arg(long, default_value_t = 10.0)]
    clean_tags_percentage: f64,

    /// pass inbound x-forwarded headers through to the registry
    #[arg(long)]
    use_forwarded_headers: bool,

    /// registry on a separate disk or mount - use the optimized disk
    /// usage calculation
    #[arg(long)]
    separate_disk: bool,

    /// cron schedule for cleaning up the least recently used tags
    #[arg(long, default_value = "0 0 * * *")]
    cleanup_cron: String,

    /// timezone used when evaluating the cron schedule
    #[arg(long, default_value = "UTC")]
    timezone: String,
}

impl StartArgs {
    fn into_settings(self) -> anyhow::Result<(ProxySettings, CleanSettings)> {
        if !(0.0..=100.0).contains(&self.clean_tags_percentage) {
            warn!(
                value = self.clean_tags_percentage,
                "clean-tags-percentage outside 0-100, clamping"
            );
        }
        let clean_tags_percentage = (self.clean_tags_percentage / 100.0).clamp(0.0, 1.0);

        let target_usage_bytes = parse_byte_string(&self.target_disk_usage)
            .with_context(|| format!("invalid --target-disk-usage {:?}", self.target_disk_usage))?;

        let proxy = ProxySettings {
            port: self.port,
            cert_file: self.cert,
            key_file: self.key,
            db_dir: self.db_dir,
            registry_host: self.registry_host,
            registry_scheme: self.registry_scheme,
            use_forwarded_headers: self.use_forwarded_headers,
        };
        let clean = CleanSettings {
            registry_dir: self.registry_dir,
            use_optimized_disk_calculation: self.separate_disk,
            target_usage_bytes,
            clean_tags_percentage,
            cron_schedule: self.cleanup_cron,
            time_zone: self.timezone,
            registry_binary: self.registry_bin,
            registry_config: self.registry_conf,
        };
        Ok((proxy, clean))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match cli.cmd {
        Commands::Start(args) => {
            let (proxy, clean) = args.into_settings()?;
            tagkeep_node::run(proxy, clean).await
        }
    }
}
