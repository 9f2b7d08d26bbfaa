//! Registers a single mDNS service from command-line flags and keeps it
//! alive until Ctrl-C, demonstrating the public API end to end. Not part
//! of the library's public surface.

use std::net::Ipv4Addr;

use clap::Parser;
use rdnssd::config::ResponderOptions;
use rdnssd::{Responder, Service};
use tracing::{error, info};

#[derive(Parser)]
#[command(about = "Advertise a single mDNS/DNS-SD service on the local network")]
struct Cli {
    /// Service instance name, e.g. "My Printer".
    #[clap(short, long)]
    instance: String,
    /// Service type, e.g. "_http._tcp.local".
    #[clap(short = 't', long)]
    service_type: String,
    /// Port the service listens on.
    #[clap(short, long)]
    port: u16,
    /// TXT record entries as `key=value`, may be given multiple times.
    #[clap(long = "txt", value_parser = parse_txt)]
    txt: Vec<(String, String)>,
    /// Overrides the advertised hostname (defaults to the system hostname).
    #[clap(long)]
    hostname: Option<String>,
    /// Interface to bind the multicast socket to.
    #[clap(long, default_value = "0.0.0.0")]
    bind_addr: Ipv4Addr,
    #[clap(long)]
    debug: bool,
}

fn parse_txt(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("{raw:?} is not in key=value form"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    rdnssd::logging::init(if cli.debug { "debug" } else { "info" });

    let options = ResponderOptions {
        hostname: cli.hostname.clone(),
        bind_addr: cli.bind_addr,
        ..ResponderOptions::default()
    };

    let service = Service::new(cli.instance, cli.service_type, cli.hostname, cli.port, cli.txt)?;

    let responder = Responder::builder().with_options(options).build()?;
    let registered = responder.register(service).await?;
    info!(
        full_name = %registered.full_name(),
        hostname = %registered.hostname,
        port = registered.port,
        "service established"
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to install Ctrl-C handler");
    }

    info!("shutting down, sending goodbye");
    responder.close().await;
    Ok(())
}
