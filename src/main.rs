//! Mediahub daemon entry point.
//!
//! Wires the pieces together: configuration, the front-end bridge, the
//! HTTP server on its background threads, and the Controller on a
//! single-threaded tokio runtime.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use mediahub::web::WebServer;
use mediahub::{bridge, Config, Controller};

/// Control-plane hub for the media pipeline daemons.
#[derive(Parser)]
#[command(name = "mediahub")]
#[command(version)]
#[command(about = "Control hub bridging a web UI to the media pipeline backends")]
struct Cli {
    /// HTTP listen address (overrides MEDIAHUB_HTTP_ADDR).
    #[arg(long)]
    http_addr: Option<String>,

    /// Abstract socket name prefix of the backend control servers.
    #[arg(long)]
    socket_base: Option<String>,

    /// Front-end request timeout in milliseconds.
    #[arg(long)]
    bridge_timeout_ms: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let mut config = Config::load();
    if let Some(addr) = cli.http_addr {
        config.http_addr = addr;
    }
    if let Some(base) = cli.socket_base {
        config.socket_base = base;
    }
    if let Some(ms) = cli.bridge_timeout_ms {
        config.bridge_timeout_ms = ms;
    }

    log::info!(
        "mediahub v{} starting (http {}, sockets @{}*)",
        env!("CARGO_PKG_VERSION"),
        config.http_addr,
        config.socket_base
    );

    let (front, core) = bridge::channel(config.bridge_timeout());
    WebServer::start(&config.http_addr, Arc::new(front));

    // The core is strictly single-threaded; peer tasks, the Controller and
    // its timers all share this one thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let controller = Controller::new(&config, core);
        tokio::select! {
            () = controller.run() => {
                log::warn!("control loop exited");
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    log::error!("signal handler failed: {e}");
                }
                log::info!("shutdown requested");
            }
        }
    });

    Ok(())
}
