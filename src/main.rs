use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hickory_proto::rr::RecordType;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use resolver_scan_rs::config::{Credentials, ScanConfig, ValidationConfig};
use resolver_scan_rs::output;
use resolver_scan_rs::prober::DnsProber;
use resolver_scan_rs::proxy_check::HttpProxyProbe;
use resolver_scan_rs::ranges::RangeList;
use resolver_scan_rs::server;
use resolver_scan_rs::session::Session;
use resolver_scan_rs::tool::ValidationTool;
use resolver_scan_rs::types::ScanOutcome;

/// resolver-scan-rs: find responsive DNS resolvers across IPv4 ranges and
/// optionally check which of them can carry a DNS tunnel.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "resolver-scan-rs",
    version,
    about = "Async discovery of responsive DNS resolvers across CIDR ranges, with optional tunnel-proxy validation.",
    long_about = None
)]
struct Cli {
    /// File with one CIDR or bare IPv4 address per line; `#` starts a comment.
    #[arg(long)]
    ranges: PathBuf,

    /// Domain to query.
    #[arg(long)]
    domain: String,

    /// Record type to query (A, AAAA, TXT, ...).
    #[arg(long = "record-type", default_value = "A")]
    record_type: RecordType,

    /// Max concurrent DNS probes.
    #[arg(long, default_value_t = 100)]
    concurrency: usize,

    /// Addresses dispatched per batch.
    #[arg(long = "batch-size", default_value_t = 500)]
    batch_size: usize,

    /// Per-probe timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 2000)]
    timeout_ms: u64,

    #[arg(long = "dns-port", default_value_t = 53)]
    dns_port: u16,

    /// Prefix every query with a random label to bypass resolver caches.
    #[arg(long = "random-subdomain", default_value_t = false)]
    random_subdomain: bool,

    /// Validate found resolvers by running a tunnel through each.
    #[arg(long, default_value_t = false)]
    validate: bool,

    /// Path to the tunnel client executable.
    #[arg(long)]
    tool: Option<PathBuf>,

    /// Directory holding per-platform tunnel client builds, used when `--tool` is absent.
    #[arg(long = "tool-dir", default_value = "bin")]
    tool_dir: PathBuf,

    #[arg(long = "validation-concurrency", default_value_t = 5)]
    validation_concurrency: usize,

    /// First local port handed to tunnel clients.
    #[arg(long = "base-port", default_value_t = 10800)]
    base_port: u16,

    #[arg(long = "proxy-user", requires = "proxy_pass")]
    proxy_user: Option<String>,

    #[arg(long = "proxy-pass", requires = "proxy_user")]
    proxy_pass: Option<String>,

    #[arg(long = "output-dir", default_value = "results")]
    output_dir: PathBuf,

    /// Expose the JSON control API while scanning.
    #[arg(long = "serve-api", default_value_t = false)]
    serve_api: bool,

    #[arg(long = "api-bind", default_value = server::DEFAULT_BIND)]
    api_bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut scan = ScanConfig::new(cli.domain.clone());
    scan.record_type = cli.record_type;
    scan.concurrency = cli.concurrency;
    scan.batch_size = cli.batch_size;
    scan.probe_timeout = Duration::from_millis(cli.timeout_ms);
    scan.random_subdomain = cli.random_subdomain;
    scan.dns_port = cli.dns_port;
    scan.validate()?;

    let ranges = RangeList::load_async(cli.ranges.clone()).await?;
    info!(
        ranges = ranges.ranges().len(),
        skipped = ranges.skipped(),
        addresses = ranges.total_addresses(),
        file = %cli.ranges.display(),
        "loaded ranges"
    );

    let prober = Arc::new(DnsProber::from_config(&scan));
    let mut session = Session::new(scan.clone(), ranges, prober);

    if cli.validate {
        let tool = match &cli.tool {
            Some(path) => ValidationTool::verify(path.clone()),
            None => ValidationTool::locate(&cli.tool_dir),
        }
        .context("tunnel client is required for --validate")?;
        let mut vcfg = ValidationConfig::new(tool.path());
        vcfg.concurrency = cli.validation_concurrency;
        vcfg.base_port = cli.base_port;
        vcfg.credentials = match (cli.proxy_user.clone(), cli.proxy_pass.clone()) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        };
        vcfg.validate()?;
        info!(tool = %tool.path().display(), concurrency = vcfg.concurrency, "tunnel validation enabled");
        let proxy = Arc::new(HttpProxyProbe::from_config(&vcfg));
        session = session.with_validation(vcfg, tool, proxy)?;
    }

    let handle = session.handle();

    if cli.serve_api {
        let bind = cli.api_bind.clone();
        let api_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(&bind, api_handle).await {
                error!(error = %e, "control API server error");
            }
        });
    }

    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping scan");
            ctrl_c_handle.stop();
        }
    });

    let summary = session.run().await?;
    output::print_results_table(&summary.ranked);

    if summary.outcome == ScanOutcome::Completed {
        if let Err(e) = output::write_results(&cli.output_dir, &summary, &scan) {
            error!(error = %e, "failed to write results");
        }
    } else {
        info!("scan was stopped; result files not written");
    }

    Ok(())
}
