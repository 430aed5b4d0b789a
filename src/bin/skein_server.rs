use std::{error::Error, net::SocketAddr, sync::Arc};

use clap::Parser;
use log::info;
use skein::{RpcServer, cli::TransportArgs, demo::DemoHandler};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connections at address
    #[arg(default_value = "127.0.0.1:13304")]
    address: SocketAddr,

    #[command(flatten)]
    transport: TransportArgs,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli
        .transport
        .into_config(cli.address.ip().to_string(), cli.address.port());
    let server = Arc::new(RpcServer::bind(cli.address, config, DemoHandler::new())?);

    let handle = Arc::clone(&server);
    ctrlc::set_handler(move || {
        info!("interrupted, shutting down");
        handle.shutdown();
    })?;

    server.serve()?;
    Ok(())
}
