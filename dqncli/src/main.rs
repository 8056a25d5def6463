use std::path::{Path, PathBuf};
use std::sync::atomic::{self, AtomicBool, AtomicU8};
use std::time::Duration;

use clap::Parser;
use colored::Colorize;

/// Print an error message and exit with the given code.
macro_rules! fatal_error {
    ($code:expr, $($arg:tt)*) => {{
        eprintln!("{} {}", "Error:".red().bold(), format!($($arg)*));
        std::process::exit($code)
    }};
}

mod commands;
use commands::Command;

/// Bit 1: training is running. Bit 0: an interrupt was received during training.
static RUNNING_STATE: AtomicU8 = AtomicU8::new(0);
/// Checked by the training loops between steps.
static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(author, version, about = "Train and evaluate a DQN agent for the space shooter.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

fn format_duration(duration: &Duration) -> String {
    let seconds = duration.as_secs();
    let millis = duration.subsec_millis();
    if seconds >= 3600 {
        format!(
            "{}h {:02}m {:02}s",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    } else if seconds >= 60 {
        format!("{}m {:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{}.{:03}s", seconds, millis)
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let handler = ctrlc::set_handler(|| {
        let state = RUNNING_STATE.fetch_or(1, atomic::Ordering::SeqCst);
        if state & 2 == 0 || state & 1 == 1 {
            // Not training or interrupted twice.
            std::process::exit(130);
        }
        STOP_REQUESTED.store(true, atomic::Ordering::SeqCst);
        eprintln!(
            "\n{}",
            "Interrupt received, stopping after the current step. Press Ctrl-C again to exit."
                .yellow()
        );
    });
    if let Err(err) = handler {
        log::warn!("Cannot set the interrupt handler: {}", err);
    }

    let cli = Cli::parse();
    cli.command.run();
}
