use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use proxychain::app::run_probe;
use proxychain::common::{Address, TlsContext};
use proxychain::config::{load_config, Config};
use proxychain::Tunnel;

/// Check that a target is reachable through the configured proxy chain.
#[derive(Parser, Debug)]
#[command(name = "proxychain", version, about = "Proxy chain connectivity probe")]
struct Args {
    /// Config file path (yaml/json).
    #[arg(default_value = "config.yaml")]
    config: String,

    /// Override the target host and port together, as `host:port`.
    #[arg(long, conflicts_with_all = ["host", "port"])]
    target: Option<Address>,

    /// Override the probe host.
    #[arg(long)]
    host: Option<String>,

    /// Override the probe port.
    #[arg(long)]
    port: Option<u16>,

    /// Upgrade the tunnel to TLS before probing.
    #[arg(long)]
    tls: bool,

    /// Skip certificate verification (with --tls).
    #[arg(long)]
    insecure: bool,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Log level override.
    #[arg(long)]
    log_level: Option<String>,
}

fn init_tracing(config: &Config, cli_level: Option<&str>) {
    let directive = cli_level.unwrap_or_else(|| config.log.filter_directive());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)),
        )
        .init();
}

async fn run(args: Args) -> Result<bool> {
    let mut config = load_config(&args.config)?;
    if let Some(target) = &args.target {
        config.probe.host = target.host();
        config.probe.port = target.port();
    }
    if let Some(host) = args.host {
        config.probe.host = host;
    }
    if let Some(port) = args.port {
        config.probe.port = port;
    }
    init_tracing(&config, args.log_level.as_deref());

    let target: Address = config.probe.target();
    let mut tunnel = Tunnel::from_config(&config)?;
    if args.tls {
        tunnel = tunnel.with_tls(TlsContext::for_host(&target.host(), args.insecure)?);
    }
    info!(
        config = args.config.as_str(),
        hops = tunnel.hops().len(),
        target = %target,
        "probing"
    );

    let outcome = run_probe(&tunnel, target, Some(Duration::from_secs(args.timeout))).await;
    println!("{}", outcome);
    Ok(outcome.is_ok())
}


#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            // tracing may not be initialised yet
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}
