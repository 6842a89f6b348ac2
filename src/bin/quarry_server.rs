use std::{error::Error, net::SocketAddr};

use clap::Parser;
use log::info;
use quarry::{
    connection::DEFAULT_CLIENT_VERSION,
    protocol::{NodeServer, NodeServices, ProcessInfo},
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connections at address
    address: SocketAddr,
    /// Protocol version answered in the handshake
    #[arg(long, default_value = DEFAULT_CLIENT_VERSION)]
    protocol_version: String,
    /// Name reported by session.nodeName and admin.getProcesses
    #[arg(long, default_value = "node-0")]
    node_name: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = NodeServer::bind(cli.address, &cli.protocol_version, NodeServices::new(&cli.node_name))?;
    let address = server.local_addr();

    // report ourselves so admin discovery finds this node
    let services = NodeServices::new(&cli.node_name).with_process(ProcessInfo {
        process_name: cli.node_name.clone(),
        host_name: address.ip().to_string(),
        port: address.port(),
        tls_port: None,
        enabled: true,
        running: true,
    });
    let server = server.with_handler(services);

    let stop = server.stop_handle();
    ctrlc::set_handler(move || {
        info!("shutting down");
        stop.stop();
    })?;

    server.listen()?;
    Ok(())
}
