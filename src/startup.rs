// Startup module - displays banner and component loading status
//
// Shows version info, the config file in effect, per-component status with
// checkmarks, and where the monitoring API is listening.

use crate::config::{Config, VERSION};

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
    pub const MAGENTA: &str = "\x1b[35m";
}

/// Print the startup banner for the server process.
pub fn print_startup(config: &Config) {
    use colors::*;

    println!();
    println!("  {BOLD}{CYAN}Brain{RESET} {DIM}v{VERSION}{RESET}");
    println!("  {DIM}Personal cognitive sidecar{RESET}");
    println!();

    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("  {DIM}Config:{RESET} {GREEN}✓{RESET} {}", path.display());
        } else {
            println!("  {DIM}Config:{RESET} {DIM}(using defaults){RESET}");
        }
    }
    println!("  {DIM}Data:{RESET}   {}", config.data_dir.display());
    println!();

    let components = [
        ("memory", format!("tiered store, hot cap {}", config.hot_capacity)),
        ("sessions", format!("{}h inactivity timeout", config.session_timeout_hours)),
        (
            "executions",
            format!(
                "{}s wall clock, {} KiB inline cap",
                config.execution_timeout_secs,
                config.inline_output_cap / 1024
            ),
        ),
    ];
    for (name, detail) in &components {
        println!("  {GREEN}✓{RESET} {name:<12} {DIM}{detail}{RESET}");
    }
    println!();

    println!(
        "  {MAGENTA}▸{RESET} Monitoring API on {BOLD}{}{RESET}",
        config.monitor_addr
    );
    println!();
}

/// Log the effective configuration at startup (visible in file logs and
/// headless runs).
pub fn log_startup(config: &Config) {
    tracing::info!(
        version = VERSION,
        data_dir = %config.data_dir.display(),
        hot_capacity = config.hot_capacity,
        session_timeout_hours = config.session_timeout_hours,
        execution_timeout_secs = config.execution_timeout_secs,
        monitor_addr = %config.monitor_addr,
        "brain starting"
    );
}
