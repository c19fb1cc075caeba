//! nikobus-bridge: command-line front end for the Nikobus bus engine.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info};

use nikobus_bridge::discovery::DiscoveryOutcome;
use nikobus_bridge::logging;
use nikobus_bridge::{BridgeConfig, BusEvent, JsonFileStore, NikobusBridge};
use nikobus_protocol::{Group, ModuleAddress};

/// nikobus-bridge - talk to a Nikobus installation through a PC-Link
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Connection string: host:port or a serial device
    #[arg(short, long)]
    connection: Option<String>,

    /// Serial speed
    #[arg(long)]
    baud_rate: Option<u32>,

    /// Directory holding the module and button documents
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Print bus events until interrupted
    Listen,
    /// Read the state of one output group
    Get {
        /// Module address, 4 hex digits
        address: ModuleAddress,
        /// Group number (1 or 2)
        group: u8,
    },
    /// Set one output channel
    Set {
        address: ModuleAddress,
        /// Channel number (1-12)
        channel: u8,
        /// Output value, 0-255 (0xFF is fully on)
        value: u8,
    },
    /// Run discovery and update the configuration documents
    Discover {
        /// Only read the registers of this module
        #[arg(long)]
        module: Option<ModuleAddress>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Config file and environment, then command line
    let mut config = BridgeConfig::load(args.config.as_deref())?;
    if let Some(connection) = &args.connection {
        config.connection.connection_string = connection.clone();
    }
    if let Some(baud_rate) = args.baud_rate {
        config.connection.baud_rate = baud_rate;
    }
    if let Some(dir) = &args.config_dir {
        config.storage.config_dir = dir.clone();
    }
    if let Some(dir) = &args.log_dir {
        config.logging.log_dir = dir.clone();
    }

    logging::init_logging(
        &config.logging.log_dir,
        config.logging.retention_days,
        config.logging.level.as_deref(),
        args.verbose,
    )?;

    info!("nikobus-bridge starting...");
    info!("  Connection: {}", config.connection.connection_string);
    info!("  Config directory: {}", config.storage.config_dir.display());

    let store = Arc::new(JsonFileStore::new(&config.storage.config_dir));
    let bridge = match NikobusBridge::connect(&config, store).await {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("Failed to start: {}", e);
            return Err(e.into());
        }
    };

    let result = run(&bridge, args.command).await;
    bridge.shutdown().await?;
    result
}

async fn run(bridge: &NikobusBridge, action: Action) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        Action::Listen => listen(bridge).await,
        Action::Get { address, group } => {
            let group = Group::from_number(group).ok_or("group must be 1 or 2")?;
            let state = bridge.commands().get_output_state(&address, group).await?;
            println!("{} group {}: {}", address, group.number(), state);
            Ok(())
        }
        Action::Set {
            address,
            channel,
            value,
        } => {
            bridge
                .commands()
                .set_output_state(&address, channel, value)
                .await?;
            println!("{} channel {} set to {:02X}", address, channel, value);
            Ok(())
        }
        Action::Discover { module } => {
            let outcome = match module {
                Some(address) => DiscoveryOutcome {
                    addresses: None,
                    modules: vec![bridge.discovery().discover_module(&address).await?],
                },
                None => bridge.discovery().discover_all().await?,
            };
            print_outcome(&outcome);
            Ok(())
        }
    }
}

async fn listen(bridge: &NikobusBridge) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = bridge.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(BusEvent::ConnectionLost { reason }) => {
                    return Err(format!("connection lost: {}", reason).into());
                }
                Ok(event) => println!("{:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("(missed {} events)", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn print_outcome(outcome: &DiscoveryOutcome) {
    if let Some(report) = &outcome.addresses {
        println!("Devices:");
        for device in &report.devices {
            println!("  {:<6} {:<40} {}", device.address, device.name, device.model);
        }
        for device in &report.unknown {
            println!("  {:<6} {}", device.address, device.name);
        }
    }
    for report in &outcome.modules {
        println!(
            "Module {} ({}): {} links",
            report.target.address,
            report.target.kind,
            report.mappings.len()
        );
        for mapping in &report.mappings {
            let channels: Vec<String> = mapping
                .outputs
                .iter()
                .map(|o| format!("{} {}", o.channel, o.mode))
                .collect();
            println!(
                "  button {} key {:X}: {}",
                mapping.push_button_address,
                mapping.key,
                channels.join(", ")
            );
        }
    }
}
