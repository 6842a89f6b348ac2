use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use log::error;
use quarry::{
    ConnectionConfig, ConnectionError, ResilientConnection, Value,
    connection::DiscoveryStrategy,
    protocol::{ProcessInfo, WireObject},
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Connection URL, e.g. `mm://host1:31000,host2:31000;socketTimeout=5000`
    url: String,
    /// Retry a call once on another node when its node fails
    #[arg(long)]
    failover: bool,
    /// How candidate nodes are found
    #[arg(long, value_enum, default_value_t = Discovery::Url)]
    discovery: Discovery,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Discovery {
    Url,
    Admin,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Round trip to the bound node
    Ping,
    /// Send text and print what comes back
    Echo { text: String },
    /// List the processes the cluster reports
    Processes,
}

fn run(cli: Cli) -> Result<(), ConnectionError> {
    let config: ConnectionConfig = cli.url.parse()?;
    let failover = cli.failover || config.auto_failover;
    let discovery = match cli.discovery {
        Discovery::Url => config.discovery,
        Discovery::Admin => DiscoveryStrategy::Admin,
    };
    let config = config.with_failover(failover).with_discovery(discovery);

    let connection = ResilientConnection::connect(config)?;
    if let Some(host) = connection.bound_host() {
        println!("connected to {host}");
    }

    match cli.command {
        Command::Ping => {
            let reply = connection.invoke("session", "ping", vec![])?;
            println!("{}", reply.as_str()?);
        }
        Command::Echo { text } => {
            let reply = connection.invoke("session", "echo", vec![Value::from(text)])?;
            println!("{}", reply.as_str()?);
        }
        Command::Processes => {
            let listing = connection.invoke("admin", "getProcesses", vec![])?;
            for entry in listing.into_list()? {
                let process = ProcessInfo::from_value(entry)?;
                println!(
                    "{}\t{}:{}\tenabled={}\trunning={}",
                    process.process_name,
                    process.host_name,
                    process.port,
                    process.enabled,
                    process.running
                );
            }
        }
    }

    connection.close();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            // EX_TEMPFAIL: worth trying again later
            if e.is_retryable() {
                ExitCode::from(75)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
