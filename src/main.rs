use std::net::IpAddr;
use std::process;

use clap::Parser;
use env_logger::Builder;
use log::{debug, error, info, LevelFilter};

use wg_routed::config::{self, RunConfig};
use wg_routed::handler;

#[derive(Parser, Debug)]
#[clap(name = "wg-routed", rename_all = "kebab-case")]
/// Route propagation daemon for WireGuard backbone overlays
struct Args {
    /// Path to the daemon config; defaults apply when omitted
    config_path: Option<String>,
    /// IP address to listen on
    #[clap(short, long)]
    address: Option<IpAddr>,
    /// TCP port to exchange control frames on
    #[clap(short, long)]
    port: Option<u16>,
    /// Sets the level of logging verbosity
    #[clap(short, parse(from_occurrences))]
    verbose: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let (crate_level, other_level) = match args.verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("wg_routed"), crate_level)
        .filter(None, other_level)
        .init();
    info!("Logging at levels {}/{}", crate_level, other_level);

    let mut config = match args.config_path.as_deref() {
        Some(path) => match config::from_file(path) {
            Ok(config) => {
                debug!(
                    "Watching {} client interfaces from {}",
                    config.client_ifaces.len(),
                    path
                );
                config
            }
            Err(err) => {
                error!("Unable to read config {}: {}", path, err);
                process::exit(1);
            }
        },
        None => RunConfig::default(),
    };
    if let Some(address) = args.address {
        config.listen_addr = address;
    }
    if let Some(port) = args.port {
        config.control_port = port;
    }

    if let Err(err) = handler::serve(config).await {
        error!("{}", err);
        process::exit(1);
    }
}
