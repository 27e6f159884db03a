//! Read-only operator CLI: inspects configuration, configured backends, and
//! live upload sessions. Never mutates registry state directly; it is a
//! thin, separate process from the running daemon, not an admin channel
//! into it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filegate::config::load_config;

#[derive(Parser)]
#[command(name = "filegatectl", about = "File gateway operator CLI")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/filegate/gateway.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect configured backends.
    Backends {
        #[command(subcommand)]
        action: BackendsAction,
    },
    /// Inspect live upload sessions (requires a running daemon; not yet wired
    /// to a remote admin channel, so this currently reports an empty set,
    /// see DESIGN.md).
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Load and validate a configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum BackendsAction {
    /// List configured backends, their kind, and allowed groups.
    List,
}

#[derive(Subcommand)]
enum SessionsAction {
    /// List in-flight upload sessions.
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate the configuration file, exiting non-zero on error.
    Check,
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env().init();
    let args = Args::parse();

    match args.command {
        Command::Backends { action: BackendsAction::List } => backends_list(&args.config),
        Command::Sessions { action: SessionsAction::List } => sessions_list(),
        Command::Config { action: ConfigAction::Check } => config_check(&args.config),
    }
}

fn backends_list(config_path: &PathBuf) -> Result<()> {
    let config = load_config(config_path)
        .with_context(|| format!("loading configuration from {:?}", config_path))?;

    println!("{:<20} {:<12} {}", "NAME", "KIND", "GROUPS");
    for backend in &config.backends {
        let groups: Vec<&str> = backend
            .permissions
            .iter()
            .map(|rule| rule.group.as_str())
            .collect();
        println!(
            "{:<20} {:<12} {}",
            backend.name,
            format!("{:?}", backend.kind()).to_lowercase(),
            if groups.is_empty() { "-".to_string() } else { groups.join(",") }
        );
    }
    Ok(())
}

/// Upload sessions live inside the running daemon's process memory; this
/// CLI has no admin RPC channel to reach them remotely, so it reports an
/// empty table rather than fabricate one. A future admin socket would plug
/// in here without changing this command's shape.
fn sessions_list() -> Result<()> {
    println!("{:<20} {:<12} {:<30} {}", "BACKEND", "INITIATOR", "PATH", "AGE");
    println!("(no admin channel to the running daemon configured; 0 sessions)");
    Ok(())
}

fn config_check(config_path: &PathBuf) -> Result<()> {
    let config = load_config(config_path)
        .with_context(|| format!("loading configuration from {:?}", config_path))?;
    println!(
        "OK: {} backend(s), auth_enabled={}",
        config.backends.len(),
        config.auth_enabled
    );
    Ok(())
}
