// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Command line utility for interacting with hardware wallets

use std::path::PathBuf;

use clap::Parser;
use log::{debug, error, info, LevelFilter};

use hwlink::{
    calls::{GetEntropy, GetFeatures, Ping},
    config::{BridgeOptions, EmulatorOptions},
    proto::SchemaSet,
    CallOptions, Session, SessionBuilder, TransportKind,
};

mod helpers;
use helpers::*;

/// Hardware wallet command line utility
#[derive(Clone, PartialEq, Debug, Parser)]
struct Options {
    /// Transport for device discovery and communication
    #[clap(long, value_enum, default_value = "bridge")]
    transport: TransportKind,

    /// Device index (where more than one device is available)
    #[clap(long, default_value = "0")]
    device_index: usize,

    /// Schema bundle (JSON), defaults to the built-in bundle
    #[clap(long)]
    schema: Option<PathBuf>,

    /// Transport configuration file (JSON)
    #[clap(long)]
    config: Option<PathBuf>,

    #[clap(flatten)]
    bridge: BridgeOptions,

    #[clap(flatten)]
    emulator: EmulatorOptions,

    /// Subcommand to execute
    #[clap(subcommand)]
    cmd: Actions,

    /// Enable verbose logging
    #[clap(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, PartialEq, Debug, Parser)]
#[non_exhaustive]
enum Actions {
    /// List available devices
    List,

    /// Fetch device features
    Features,

    /// Ping the device
    Ping {
        /// Message to echo
        #[clap(default_value = "ping")]
        message: String,

        /// Require button confirmation
        #[clap(long)]
        button_protection: bool,
    },

    /// Fetch entropy from the device
    Entropy {
        /// Number of bytes requested
        #[clap(long, default_value = "32")]
        size: u32,
    },

    /// Issue an arbitrary call with JSON fields
    Call {
        /// Message name
        name: String,

        /// Message fields as a JSON object
        #[clap(default_value = "{}")]
        fields: JsonFields,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Options::parse();

    // Setup logging
    let log_cfg = simplelog::ConfigBuilder::new()
        .add_filter_ignore_str("hyper")
        .add_filter_ignore_str("reqwest")
        .build();
    simplelog::SimpleLogger::init(args.log_level, log_cfg)?;

    // Load transport options, command line bridge / emulator options take precedence
    let mut opts = match &args.config {
        Some(p) => hwlink::config::Options::load(p)?,
        None => Default::default(),
    };
    opts.bridge = args.bridge.clone();
    opts.emulator = args.emulator.clone();

    debug!("Using transport: {} ({:?})", args.transport, opts);

    let s = SessionBuilder::new(args.transport).options(opts).open()?;

    // Install schemas
    match &args.schema {
        Some(p) => {
            let bundle = tokio::fs::read_to_string(p).await?;
            let schemas = SchemaSet::from_json(&bundle)?;
            s.configure_schemas(schemas)?;
        }
        None => s.configure_default()?,
    }

    // List available devices
    let devices = s.enumerate().await?;
    if devices.is_empty() {
        return Err(anyhow::anyhow!("No devices found"));
    }

    // Handle list command
    if args.cmd == Actions::List {
        info!("Devices:");
        for (i, d) in devices.iter().enumerate() {
            info!("  {}: {}", i, d);
        }

        return Ok(());
    }

    // Select device by index
    let d = match devices.get(args.device_index) {
        Some(d) => d,
        None => {
            return Err(anyhow::anyhow!(
                "Invalid device index: {} (max: {})",
                args.device_index,
                devices.len() - 1
            ))
        }
    };

    debug!("Using device {}: {}", args.device_index, d);

    // Acquire device
    let h = match s.acquire(&d.id).await {
        Ok(h) => h,
        Err(e) => {
            error!("Failed to acquire device: {}", d);
            return Err(e.into());
        }
    };

    // Execute command, releasing the device regardless of outcome
    let r = execute(&s, &h.id, args.cmd).await;

    s.release(&h.id).await?;

    r
}

/// Execute a command against an acquired device
async fn execute(s: &Session, id: &str, cmd: Actions) -> anyhow::Result<()> {
    debug!("Executing command: {:?}", cmd);

    match cmd {
        Actions::Features => {
            let f = s.typed_call(id, &GetFeatures {}).await?;

            info!("firmware version: {}", f.version());
            print_json(&f)?;
        }
        Actions::Ping {
            message,
            button_protection,
        } => {
            if button_protection {
                info!("Confirm on device");
            }

            let r = s
                .typed_call(
                    id,
                    &Ping {
                        message: Some(message),
                        button_protection: Some(button_protection),
                    },
                )
                .await?;

            info!("response: {}", r.message.unwrap_or_default());
        }
        Actions::Entropy { size } => {
            info!("requesting {} bytes of entropy", size);

            let r = s.typed_call(id, &GetEntropy { size }).await?;

            info!("value: {}", hex::encode(r.bytes()?));
        }
        Actions::Call { name, fields } => {
            let m = s.call(id, &name, fields.0, CallOptions::default()).await?;

            info!("response: {}", m.name);
            print_json(&m.fields)?;
        }
        Actions::List => unreachable!(),
    }

    Ok(())
}
