use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use usbridge_core::{BridgeConfig, Command, CommandDispatcher, CommandOutput, NusbBackend};

#[derive(Parser, Debug)]
#[command(author, version, about = "USB serial bridge tool", long_about = None)]
struct Cli {
    /// Bridge config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List attached bridges of allow-listed vendors
    List {
        #[arg(long, default_value_t = 16)]
        max: u32,
    },
    /// Open a device and send a zero-length liveness check
    Ping(DeviceArgs),
    /// Write hex bytes and read back the reply
    Echo {
        #[command(flatten)]
        device: DeviceArgs,

        /// Payload as hex, e.g. 01020304
        data: String,
    },
}

#[derive(Args, Debug)]
struct DeviceArgs {
    /// Vendor id (hex with 0x prefix, or decimal)
    #[arg(long, value_parser = parse_id)]
    vid: u16,

    /// Product id (hex with 0x prefix, or decimal)
    #[arg(long, value_parser = parse_id)]
    pid: u16,

    /// Serial number to match
    #[arg(long)]
    serial: Option<String>,
}

impl DeviceArgs {
    fn open_command(&self) -> Command {
        Command::Open {
            vendor_id: self.vid,
            product_id: self.pid,
            serial: self.serial.clone(),
        }
    }
}

fn parse_id(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid id {s:?}: {e}"))
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => BridgeConfig::load_from_file(path)?,
        None => BridgeConfig::default(),
    };
    let mut bridge = CommandDispatcher::new(Arc::new(NusbBackend::new()), &config);

    match cli.command {
        Commands::List { max } => {
            let CommandOutput::Devices(devices) = bridge.execute(Command::List {
                max_results: max as usize,
            })?
            else {
                bail!("unexpected list output");
            };
            if devices.is_empty() {
                info!("No matching devices");
            }
            for d in devices {
                println!(
                    "{:04X}:{:04X}  {:<16}  {}",
                    d.vendor_id, d.product_id, d.serial, d.description
                );
            }
        }
        Commands::Ping(device) => {
            bridge.execute(device.open_command())?;
            let alive = matches!(bridge.execute(Command::Ping)?, CommandOutput::Bool(true));
            bridge.execute(Command::Close)?;
            println!("{}", if alive { "alive" } else { "no response" });
            if !alive {
                bail!("device did not accept a zero-length packet");
            }
        }
        Commands::Echo { device, data } => {
            let payload = hex::decode(data.trim()).context("payload must be hex")?;
            bridge.execute(device.open_command())?;

            let result = echo(&mut bridge, payload);
            bridge.execute(Command::Close)?;
            let (sent, reply) = result?;

            println!("{}", hex::encode(&reply));
            if reply != sent {
                bail!("reply differs from payload ({} of {} bytes)", reply.len(), sent.len());
            }
        }
    }
    Ok(())
}

fn echo(bridge: &mut CommandDispatcher, payload: Vec<u8>) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let len = payload.len();
    bridge.execute(Command::Write(payload.clone()))?;
    let CommandOutput::Bytes(reply) = bridge.execute(Command::Read { count: len.max(1) })? else {
        bail!("unexpected read output");
    };
    Ok((payload, reply))
}
