//! Example of running a p2p node front end.

use bitcoin_network_p2p::{Authority, P2p, Settings};
use clap::Parser;
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to accept inbound connections on.
    #[arg(short, long, default_value = "8333")]
    port: u16,

    /// Maximum number of inbound connections; 0 disables the listener.
    #[arg(long, default_value = "8")]
    inbound: u32,

    /// Number of outbound connection slots to keep filled.
    #[arg(long, default_value = "8")]
    outbound: u32,

    /// Seed endpoint to fill an empty hosts pool from (repeatable).
    #[arg(short, long)]
    seed: Vec<Authority>,

    /// Endpoint to maintain a manual connection to (repeatable).
    #[arg(short, long)]
    connect: Vec<Authority>,

    /// Where the hosts pool persists between runs.
    #[arg(long, default_value = "hosts.cache")]
    hosts_file: String,

    /// Custom user agent (optional).
    #[arg(short, long)]
    user_agent: Option<String>,

    /// Log level.
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    // Configure fern logger
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] {} - {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log_level)
        .chain(std::io::stderr())
        .apply()
        .unwrap();

    let mut settings = Settings::default();
    settings.inbound_port = args.port;
    settings.inbound_connections = args.inbound;
    settings.outbound_connections = args.outbound;
    settings.seeds = args.seed;
    settings.peers = args.connect;
    settings.hosts_file = args.hosts_file.into();
    if let Some(user_agent) = args.user_agent {
        log::debug!("Using custom user agent: {user_agent}");
        settings.user_agent = user_agent;
    }

    let network = P2p::new(settings);
    network.start().await.map_err(|e| format!("Start failed: {e}"))?;
    if let Some(listen) = network.listen_address() {
        log::info!("Listening on {listen}");
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    network.stop().await;

    Ok(())
}
