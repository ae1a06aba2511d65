// CLI module - command-line argument parsing and handlers
//
// Subcommands:
// - serve: run the server process (components, maintenance, monitoring API)
// - worker: run a worker process (claim loops against the shared store)
// - config --show/--reset/--path: configuration management

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};

/// Brain - personal cognitive sidecar
#[derive(Parser)]
#[command(name = "brain")]
#[command(version = VERSION)]
#[command(about = "Persistent memory, queued code execution, and sessions for an agent", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the server process
    Serve,

    /// Run a worker process
    Worker {
        /// Claim-loop slots (clamped into the configured worker range)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Stable worker id (defaults to hostname-pid)
        #[arg(long)]
        worker_id: Option<String>,
    },

    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Reset config file to defaults
        #[arg(long)]
        reset: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle the `config` subcommand. Returns true if it was handled (exit after).
pub fn handle_config(show: bool, reset: bool, path: bool) -> bool {
    if path {
        match Config::config_path() {
            Some(p) => println!("{}", p.display()),
            None => eprintln!("No config directory available on this platform"),
        }
    } else if reset {
        match Config::config_path() {
            Some(p) => {
                if let Some(parent) = p.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                match std::fs::write(&p, Config::default().to_toml()) {
                    Ok(()) => println!("Config reset: {}", p.display()),
                    Err(e) => eprintln!("Failed to write {}: {e}", p.display()),
                }
            }
            None => eprintln!("No config directory available on this platform"),
        }
    } else if show {
        println!("{}", Config::load().to_toml());
    } else {
        println!("Usage: brain config [--show|--reset|--path]");
        println!();
        println!("Options:");
        println!("  --show    Display effective configuration");
        println!("  --reset   Reset config file to defaults");
        println!("  --path    Show config file path");
    }
    true
}
