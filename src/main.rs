// Copyright (C) 2024 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! A thin `clap`-driven shell over `stagehub`'s library code: `start` runs
//! the hub until interrupted, `check` validates a config and cue list
//! without connecting to anything, `devices` lists what a config would
//! bring up. No business logic lives here.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use stagehub::config;
use stagehub::cue::ingest;
use stagehub::hub::Hub;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = "0.1.0",
    about = "A production control hub for live events."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Starts the hub: binds the OSC listener, connects every configured
    /// driver, loads the cue list, and runs until interrupted.
    Start {
        /// Path to the hub's YAML config.
        config_path: String,
        /// Path to the cue list to load at startup.
        cuelist_path: String,
    },
    /// Validates the config and cue list without connecting to any device.
    /// Exits non-zero on the first problem found.
    Check {
        /// Path to the hub's YAML config.
        config_path: String,
        /// Path to a cue list to validate alongside the config, if any.
        cuelist_path: Option<String>,
    },
    /// Lists the drivers a config would bring up.
    Devices {
        /// Path to the hub's YAML config.
        config_path: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config_path,
            cuelist_path,
        } => start(&config_path, &cuelist_path).await,
        Commands::Check {
            config_path,
            cuelist_path,
        } => check(&config_path, cuelist_path.as_deref()),
        Commands::Devices { config_path } => devices(&config_path),
    }
}

async fn start(config_path: &str, cuelist_path: &str) -> ExitCode {
    let cfg = match config::load(&PathBuf::from(config_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(err = %e, config_path, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    let cue_list = match ingest::load_cue_list(&PathBuf::from(cuelist_path)) {
        Ok(list) => list,
        Err(e) => {
            error!(err = %e, cuelist_path, "failed to load cue list");
            return ExitCode::FAILURE;
        }
    };

    let hub = match Hub::start(cfg).await {
        Ok(hub) => hub,
        Err(e) => {
            error!(err = %e, "failed to start hub");
            return ExitCode::FAILURE;
        }
    };
    hub.sequencer().load(cue_list).await;

    info!("hub started, awaiting ctrl-c");
    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to install ctrl-c handler, shutting down anyway");
    }

    info!("shutdown requested");
    hub.shutdown().await;
    hub.join().await;
    ExitCode::SUCCESS
}

fn check(config_path: &str, cuelist_path: Option<&str>) -> ExitCode {
    match config::load(&PathBuf::from(config_path)) {
        Ok(cfg) => {
            println!("config ok: {} device(s) configured", cfg.devices.len());
        }
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::FAILURE;
        }
    }

    if let Some(cuelist_path) = cuelist_path {
        match ingest::load_cue_list(&PathBuf::from(cuelist_path)) {
            Ok(list) => println!("cue list ok: {} cue(s)", list.cues.len()),
            Err(e) => {
                eprintln!("cue list error: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

fn devices(config_path: &str) -> ExitCode {
    let cfg = match config::load(&PathBuf::from(config_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cfg.devices.is_empty() {
        println!("No devices configured.");
        return ExitCode::SUCCESS;
    }

    println!("Devices:");
    for device in &cfg.devices {
        println!("- {}", device.prefix());
    }
    ExitCode::SUCCESS
}
