//! # evo_halcmd
//!
//! Command front-end of the EVO HAL: attaches to (or creates) the HAL
//! segment and executes interpreter commands from a script file, from the
//! command line, or from standard input.
//!
//! # Usage
//!
//! ```bash
//! # One inline command against the segment named in hal.toml
//! evo_halcmd --config /etc/evo/hal.toml show pin
//!
//! # Run a script, continuing past failing lines
//! evo_halcmd --config hal.toml -f machine.hal --keep-going
//!
//! # Run a script and keep its threads alive until Ctrl-C
//! evo_halcmd --config hal.toml -f machine.hal --wait
//! ```
//!
//! Exit status is 0 on success and 1 if any command failed.

use clap::Parser;
use evo_common::config::load_hal_config;
use evo_common::hal::config::HalConfig;
use evo_hal::{Hal, Interpreter};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// EVO HAL command interpreter
#[derive(Parser, Debug)]
#[command(name = "evo_halcmd")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Inspect and configure the EVO HAL")]
#[command(long_about = None)]
struct Args {
    /// Path to the HAL configuration file (hal.toml). Without it a
    /// private anonymous segment is used.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Execute commands from this script file
    #[arg(short = 'f', long = "file", value_name = "SCRIPT")]
    file: Option<PathBuf>,

    /// Continue after a failing command
    #[arg(short = 'k', long)]
    keep_going: bool,

    /// Stay attached until Ctrl-C after executing, so threads keep running
    #[arg(short, long)]
    wait: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    /// Inline command, e.g. `show pin`
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() {
    match run() {
        Ok(0) => {}
        Ok(failed) => {
            error!("{} command(s) failed", failed);
            std::process::exit(1);
        }
        Err(e) => {
            error!("evo_halcmd failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<usize, Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);

    let config = match &args.config {
        Some(path) => {
            info!("Loading HAL config from {:?}", path);
            load_hal_config(path)?
        }
        None => HalConfig::default(),
    };
    let hal = Hal::open(config)?;
    let cmd = Interpreter::new(&hal);
    let print = |s: &str| println!("{s}");

    let mut failed = 0;
    if let Some(path) = &args.file {
        let script = std::fs::read_to_string(path)?;
        failed += cmd.run_script(&script, args.keep_going, print)?;
    }
    if !args.command.is_empty() {
        failed += cmd.run_script(&args.command.join(" "), args.keep_going, print)?;
    } else if args.file.is_none() {
        for line in std::io::stdin().lock().lines() {
            failed += cmd.run_script(&line?, true, print)?;
        }
    }

    if args.wait {
        wait_for_signal()?;
        hal.stop_threads()?;
    }
    Ok(failed)
}

/// Block until SIGINT/SIGTERM.
fn wait_for_signal() -> Result<(), ctrlc::Error> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })?;
    info!("Waiting for Ctrl-C");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose { Level::DEBUG } else { Level::WARN };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
