mod cmd;
mod output;
mod prompt;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    checkpoint::CheckpointSubcommand, config::ConfigSubcommand,
    permission::PermissionSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "turnstile",
    about = "Turn checkpoints over git refs and a permission gate for agent tool calls",
    version,
    propagate_version = true
)]
struct Cli {
    /// Repository root (default: walk up to the nearest .git)
    #[arg(long, global = true, env = "TURNSTILE_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, inspect, restore and delete checkpoints
    Checkpoint {
        #[command(subcommand)]
        subcommand: CheckpointSubcommand,
    },

    /// Classify commands and manage the permission level
    Permission {
        #[command(subcommand)]
        subcommand: PermissionSubcommand,
    },

    /// Inspect and validate settings
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Serve the JSON-lines hook protocol on stdin/stdout
    Hook {
        /// Session active before the host sends session_start (default: random)
        #[arg(long)]
        session: Option<String>,

        /// Never prompt; anything that would ask is blocked
        #[arg(long)]
        no_prompt: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Hook { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    // stdout carries command output and hook responses; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Checkpoint { subcommand } => cmd::checkpoint::run(&root, subcommand, cli.json),
        Commands::Permission { subcommand } => cmd::permission::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Hook { session, no_prompt } => cmd::hook::run(&root, session, no_prompt),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
