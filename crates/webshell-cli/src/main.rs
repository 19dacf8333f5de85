//! webshell: offline tools for session recordings.
//!
//! Plays a recording back to the terminal or prints what it contains.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use webshell_core::ttyrec::DEFAULT_SPEED;

/// webshell: session recording tools
#[derive(Parser)]
#[command(name = "webshell", version, about = "Play and inspect webshell session recordings")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Play a recording to stdout
    Play {
        /// Recording file
        file: PathBuf,

        /// Speed factor; negative values slow playback down, 0 plays without pauses
        #[arg(short, long, default_value_t = DEFAULT_SPEED, allow_hyphen_values = true)]
        speed: i64,

        /// Render a single frame instead of the whole recording
        #[arg(short, long)]
        frame: Option<usize>,

        /// Do not pause between frames
        #[arg(long)]
        no_delay: bool,
    },

    /// Print header fields and stream sizes of a recording
    Inspect {
        /// Recording file
        file: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("webshell=debug,webshell_cli=debug,webshell_core=debug")
            .with_writer(std::io::stderr)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("webshell=warn,webshell_cli=warn,webshell_core=warn")
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let result = match cli.command {
        Command::Play {
            file,
            speed,
            frame,
            no_delay,
        } => commands::play::run(&file, speed, frame, no_delay),
        Command::Inspect { file, json } => commands::inspect::run(&file, json),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("webshell: {e:#}");
        std::process::exit(1);
    }
}
