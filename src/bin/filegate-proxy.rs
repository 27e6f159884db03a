//! The file gateway daemon: loads configuration, builds `GatewayState`, and
//! serves the upload/download/hub endpoints until terminated.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use filegate::config::load_config;
use filegate::state::GatewayState;

#[derive(Parser)]
#[command(name = "filegate-proxy", about = "Multi-tenant file gateway daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/filegate/gateway.toml")]
    config: PathBuf,

    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "127.0.0.1:8007")]
    listen: SocketAddr,

    /// Also log to syslog, in addition to stderr.
    #[arg(long)]
    syslog: bool,
}

/// `--syslog` swaps the global logger for a syslog-backed one; otherwise
/// stderr via `env_logger`.
fn init_logging(use_syslog: bool) {
    if !use_syslog {
        env_logger::Builder::from_default_env().init();
        return;
    }

    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_DAEMON,
        hostname: None,
        process: "filegate-proxy".into(),
        pid: std::process::id() as i32,
    };
    match syslog::unix(formatter) {
        Ok(logger) => {
            let _ = log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
                .map(|()| log::set_max_level(log::LevelFilter::Info));
        }
        Err(e) => {
            env_logger::Builder::from_default_env().init();
            log::warn!("failed to connect to syslog, falling back to stderr: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.syslog);

    let config = load_config(&args.config)
        .with_context(|| format!("loading configuration from {:?}", args.config))?;
    log::info!(
        "loaded configuration with {} backend(s), auth_enabled={}",
        config.backends.len(),
        config.auth_enabled
    );

    let state = GatewayState::new(config);
    filegate::server::run(state, args.listen)
        .await
        .context("gateway server exited with an error")?;
    Ok(())
}
