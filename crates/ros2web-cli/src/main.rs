//! `ros2web` – rosbridge v2 gateway.
//!
//! Exposes the middleware graph to WebSocket clients speaking the rosbridge
//! v2 JSON protocol.
//!
//! ```bash
//! # Serve ws://0.0.0.0:9090
//! ros2web
//!
//! # Custom port, report warnings too
//! ros2web --port 9191 --status-level warning
//!
//! # Client mode: dial out to a remote endpoint and keep reconnecting
//! ros2web --address ws://dashboard.local:9090
//! ```
//!
//! Settings come from `~/.ros2web/config.toml`, then `ROS2WEB_*` environment
//! variables, then the flags below.  Ctrl-C shuts the gateway down.

mod config;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use ros2web_bridge::BridgeServer;
use ros2web_middleware::LocalNode;
use ros2web_types::BridgeError;
use tracing::{error, info};

use config::Config;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "ros2web")]
#[command(about = "rosbridge v2 WebSocket gateway")]
#[command(version)]
struct Args {
    /// Configuration file (default: ~/.ros2web/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Remote ws:// address to connect to instead of listening
    #[arg(short, long)]
    address: Option<String>,

    /// Initial status level of every connection (error, warning, info, none)
    #[arg(short = 'l', long)]
    status_level: Option<String>,

    /// Maximum buffered bytes of an incomplete command
    #[arg(long)]
    max_frame_bytes: Option<usize>,

    /// Maximum concurrent WebSocket connections
    #[arg(long)]
    max_connections: Option<usize>,
}

impl Args {
    /// Overlay the flags that were given onto `cfg`.
    fn apply(&self, cfg: &mut Config) {
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(bind) = &self.bind {
            cfg.bind = bind.clone();
        }
        if let Some(address) = &self.address {
            cfg.address = Some(address.clone());
        }
        if let Some(level) = &self.status_level {
            cfg.status_level = level.clone();
        }
        if let Some(bytes) = self.max_frame_bytes {
            cfg.max_frame_bytes = bytes;
        }
        if let Some(max) = self.max_connections {
            cfg.max_connections = max;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _guard = telemetry::init_tracing("ros2web");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "ros2web stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), BridgeError> {
    let mut cfg = config::load(args.config.as_deref())?;
    args.apply(&mut cfg);
    let options = cfg.server_options()?;
    let addr = cfg.listen_addr()?;

    let node = Arc::new(
        LocalNode::new(cfg.node_name.clone()).with_types(cfg.known_types.iter().cloned()),
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %cfg.node_name,
        status_level = %options.bridge.status_level,
        "starting ros2web"
    );
    let server = BridgeServer::new(node, options);

    let serving = async {
        match cfg.address.as_deref() {
            Some(url) => server.connect(url).await,
            None => server.clone().listen(addr).await,
        }
    };

    tokio::select! {
        result = serving => result?,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("Ctrl-C received, shutting down");
        }
    }

    server.shutdown();
    Ok(())
}
