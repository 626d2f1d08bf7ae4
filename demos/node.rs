//! Run a single node, optionally joining a network, until Ctrl+C.

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use kadnode::{Dht, Id};
use tracing::{info, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Hex Id of this node, random by default
    #[arg(long)]
    id: Option<String>,
    /// Id length in bytes
    #[arg(long, default_value_t = 4)]
    id_length: usize,
    /// Ipv4 address to listen on
    #[arg(long, default_value_t = Ipv4Addr::LOCALHOST)]
    ip: Ipv4Addr,
    /// Port to listen on, random by default
    #[arg(long)]
    port: Option<u16>,
    /// Address of a node to bootstrap from, `ip:port`
    #[arg(long)]
    bootstrap: Option<SocketAddrV4>,
    /// Directory to persist state in
    #[arg(long)]
    storage: Option<PathBuf>,
    /// Store `key=value` at this node once connected
    #[arg(long)]
    put: Option<String>,
    /// Seconds between status reports
    #[arg(long, default_value_t = 30)]
    interval: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_thread_names(true)
        .init();

    let cli = Cli::parse();

    let mut builder = Dht::builder().id_length(cli.id_length).ip(cli.ip);

    if let Some(id) = &cli.id {
        builder = builder.id(Id::parse(id, cli.id_length).expect("invalid id"));
    }
    if let Some(port) = cli.port {
        builder = builder.port(port);
    }
    if let Some(storage) = cli.storage {
        builder = builder.storage(storage);
    }

    let dht = builder.build().expect("Failed to create node");

    if let Some(address) = cli.bootstrap {
        dht.bootstrap(address).expect("node was shutdown");
    }

    if let Some(put) = &cli.put {
        let (key, value) = put.split_once('=').expect("expected key=value");
        let key = Id::from_str(key).expect("invalid key");

        dht.put(key, value).expect("failed to store");
    }

    let (stop, stopped) = flume::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop.try_send(());
    })
    .expect("Error setting Ctrl-C handler");

    info!("Node is running! Press Ctrl+C to stop.");

    while stopped
        .recv_timeout(Duration::from_secs(cli.interval))
        .is_err()
    {
        let info = dht.info().expect("node was shutdown");

        info!(
            id = %info.id(),
            address = %info.local_addr(),
            contacts = info.known_contacts(),
            entries = info.stored_entries(),
            lookups = info.pending_lookups(),
            "Status"
        );
    }

    dht.shutdown().expect("node was already shutdown");
}
