use std::{net::Ipv4Addr, process::ExitCode};

use clap::{Parser, Subcommand};
use tracing::{error, warn};
use unison::{Config, Peer, logging};

#[derive(Parser)]
#[command(name = "unison", version, about = "replicate one value across a cluster of peers")]
struct Cli {
    /// Spawn a resident node
    #[arg(short = 'n', long = "node")]
    node: bool,

    /// Join the cluster at the specified multicast group
    #[arg(short = 'j', long = "join", value_name = "ADDR")]
    join: Option<Ipv4Addr>,

    /// Listen on the specified TCP port
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Logging sink: console, or a file name
    #[arg(short = 'l', long = "log", default_value = "console", value_name = "TYPE")]
    log: String,

    /// Logging verbosity: off, trace, info, warn, err
    #[arg(short = 'v', long = "verbosity", default_value = "info", value_name = "LEVEL")]
    verbosity: String,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Set the value shared across the cluster
    Set { value: String },
    /// Get the value shared across the cluster
    Get,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(&cli.log, &cli.verbosity) {
        eprintln!("logger init failed: {e}");
        return ExitCode::FAILURE;
    }

    let mut cfg = Config { daemon: cli.node, ..Config::default() };
    if let Some(group) = cli.join {
        cfg.multicast_group = group;
    }
    if let Some(port) = cli.port {
        cfg.listen_port = port;
    }
    match cli.cmd {
        Some(Cmd::Set { value }) => {
            cfg.get_mode = false;
            cfg.set_value = Some(value);
        }
        Some(Cmd::Get) => cfg.get_mode = true,
        None => cfg.get_mode = !cli.node,
    }

    let peer = match Peer::new(cfg) {
        Ok(peer) => peer,
        Err(e) => {
            error!(%e, "initialization failed");
            return ExitCode::FAILURE;
        }
    };

    let stop = peer.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || stop.request_exit()) {
        warn!(%e, "cannot install signal handler");
    }

    match peer.run() {
        Ok(Some(value)) => {
            println!("{value}");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "peer terminated");
            ExitCode::FAILURE
        }
    }
}
