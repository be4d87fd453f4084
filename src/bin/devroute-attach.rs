//! Wire a domain to a local server that just started listening
//!
//! Usage:
//!   devroute-attach <domain> <port> [--config FILE] [--admin-url URL] [--server-id ID]
//!
//! Meant to be called from a dev server's startup hook. A domain held by
//! another live process is reported but does not fail the command; only an
//! unreachable or rejecting admin API does.

use anyhow::Context;
use clap::Parser;
use devroute::admin::AdminClient;
use devroute::config::{Config, ConflictPolicy};
use devroute::error::WireError;
use devroute::probe::TcpProbe;
use devroute::startup::wire;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "devroute-attach", version, about = "Point a domain at a freshly started local server")]
struct Args {
    /// Domain to route
    domain: String,

    /// Port the local server is listening on
    port: u16,

    #[arg(long)]
    admin_url: Option<String>,

    #[arg(long)]
    server_id: Option<String>,

    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Warn instead of failing when another live process holds the domain
    #[arg(long)]
    lenient: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devroute=info".parse().expect("valid log directive")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load_or_default(args.config.as_deref())?;
    if let Some(url) = args.admin_url {
        config.admin_url = url;
    }
    if let Some(id) = args.server_id {
        config.server_id = id;
    }
    if args.lenient {
        config.conflict_policy = ConflictPolicy::Lenient;
    }
    config.validate()?;

    let client = AdminClient::new(&config.admin_url)?;
    let probe = TcpProbe::new(config.probe_timeout());

    match wire(&client, &probe, &config, &args.domain, args.port).await {
        Ok(report) => {
            info!(
                domain = %report.domain,
                port = report.port,
                outcome = ?report.reconciliation.outcome,
                pruned = report.reconciliation.pruned,
                "Attach finished"
            );
            Ok(())
        }
        Err(e @ WireError::Conflict { .. }) => {
            error!(error = %e, "Not routing domain");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| {
            format!("failed to wire {} via {}", args.domain, config.admin_url)
        }),
    }
}
