#![warn(unused_crate_dependencies)]

use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;

mod comms;
mod config;
mod device;
mod logic;
mod tags;
mod utils;

use config::VERSION;
use device::FieldDevice;

/// A simulation startup for programmable field devices.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file to load
    #[arg(long, value_name = "PATH")]
    file: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration before anything else; a bad file is the only
    // fatal startup error
    let config = match config::load_config(&args.file) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("ERROR: failed when loading the field device configuration file: {}", err);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    utils::logging::setup(config.field_device.logging);

    info!(
        "starting field device {} (v{})",
        config.field_device.name, VERSION
    );

    let device = FieldDevice::start(config.field_device).await;

    // Run until interrupted
    _ = signal::ctrl_c().await;
    info!("shutting down field device {}", device.name());
    device.halt();

    ExitCode::SUCCESS
}
