use clap::Parser;
use devroute::admin::AdminClient;
use devroute::config::Config;
use devroute::inventory::{load_inventory, teardown, DomainEntry, Inventory, TeardownAction};
use devroute::process::SystemProcesses;
use std::path::PathBuf;

/// Inspect and tear down routes managed in the local reverse proxy
#[derive(Debug, Parser)]
#[command(name = "devroute", version, about, long_about = None)]
struct Cli {
    /// Domain to inspect; lists every domain when omitted
    domain: Option<String>,

    /// Base URL of the proxy's admin API
    #[arg(long)]
    admin_url: Option<String>,

    /// Id of the proxy server entry holding the routes
    #[arg(long)]
    server_id: Option<String>,

    /// Configuration file (defaults to ./devroute.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Terminate the process on the domain's port, then remove its routes
    #[arg(long, requires = "domain", conflicts_with = "unmap")]
    kill: bool,

    /// Remove the domain's routes without touching any process
    #[arg(long, requires = "domain")]
    unmap: bool,

    /// Port to kill when the domain maps to several
    #[arg(long, requires = "kill")]
    port: Option<u16>,
}

impl Cli {
    fn action(&self) -> Option<TeardownAction> {
        if self.kill {
            Some(TeardownAction::Kill { port: self.port })
        } else if self.unmap {
            Some(TeardownAction::Unmap)
        } else {
            None
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devroute=warn".parse().expect("valid log directive")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(url) = &cli.admin_url {
        config.admin_url = url.clone();
    }
    if let Some(id) = &cli.server_id {
        config.server_id = id.clone();
    }
    config.validate()?;

    let client = AdminClient::new(&config.admin_url)?;

    let Some(domain) = cli.domain.as_deref() else {
        let inventory = load_inventory(&client, &config.server_id).await?;
        print_inventory(&config.server_id, &inventory);
        return Ok(());
    };

    let Some(action) = cli.action() else {
        let inventory = load_inventory(&client, &config.server_id).await?;
        let entry = inventory
            .get(domain)
            .ok_or_else(|| anyhow::anyhow!("no route matches {}", domain))?;
        print_entry(entry);
        return Ok(());
    };

    let report = teardown(&client, &SystemProcesses, &config.server_id, domain, action).await?;

    if let Some(port) = report.killed_port {
        if report.terminated == 0 {
            println!("No process listening on port {}", port);
        } else {
            println!(
                "Terminated {} process(es) listening on port {}",
                report.terminated, port
            );
        }
    }
    println!("Unmapped {} ({} route(s) removed)", report.domain, report.deleted);

    Ok(())
}

fn print_inventory(server_id: &str, inventory: &Inventory) {
    if inventory.is_empty() {
        println!("No routes on server '{}'", server_id);
        return;
    }

    let width = inventory
        .entries()
        .map(|e| e.domain.len())
        .max()
        .unwrap_or(0)
        .max("DOMAIN".len());

    println!("{:<width$}  {:<16}  ROUTES", "DOMAIN", "PORTS", width = width);
    for entry in inventory.entries() {
        println!(
            "{:<width$}  {:<16}  {}",
            entry.domain,
            format_ports(entry),
            join(entry.indices.iter()),
            width = width
        );
    }
}

fn print_entry(entry: &DomainEntry) {
    println!("Domain:  {}", entry.domain);
    println!("Ports:   {}", format_ports(entry));
    println!("Routes:  {}", join(entry.indices.iter()));

    match entry.ports.len() {
        0 => println!("\nNo known port; use --unmap to remove the routes."),
        1 => println!("\nUse --kill to stop the process and remove the routes, or --unmap to remove the routes only."),
        _ => println!("\nSeveral ports map here; use --kill --port <PORT> to choose which process to stop."),
    }
}

fn format_ports(entry: &DomainEntry) -> String {
    let mut ports: Vec<String> = entry.ports.iter().map(u16::to_string).collect();
    if entry.has_unknown_port {
        ports.push("?".to_string());
    }
    if ports.is_empty() {
        "-".to_string()
    } else {
        ports.join(",")
    }
}

fn join<T: ToString>(items: impl Iterator<Item = T>) -> String {
    items.map(|i| i.to_string()).collect::<Vec<_>>().join(",")
}
