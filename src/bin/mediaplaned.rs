//! mediaplane daemon.
//!
//! Serves a context backed by the software stage backend on a Unix socket.
//!
//! ```text
//! mediaplaned [SOCKET_PATH] [--no-stdin]
//! ```
//!
//! The daemon stops when its standard input reaches end of file or reads a
//! `quit` line. With `--no-stdin` it runs until killed; a stale socket file
//! is removed on the next start.
//!
//! Environment: `RUST_LOG` (default `info`), `MEDIAPLANE_SOCKET`,
//! `MEDIAPLANE_WRITE_TIMEOUT_MS`, `MEDIAPLANE_MAX_SESSIONS`.

use mediaplane::config::{ContextConfig, ServerConfig};
use mediaplane::context::Context;
use mediaplane::observability::init_metrics;
use mediaplane::rpc::RpcServer;
use mediaplane::stage::loopback::LoopbackBackend;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    init_metrics();

    if let Err(e) = run() {
        error!(error = %e, "mediaplaned failed");
        std::process::exit(1);
    }
}

fn run() -> mediaplane::Result<()> {
    let mut config = ServerConfig::from_env()?;
    let mut watch_stdin = true;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--no-stdin" => watch_stdin = false,
            path => config.socket_path = PathBuf::from(path),
        }
    }

    let ctx = Arc::new(Context::new(
        ContextConfig::default(),
        Arc::new(LoopbackBackend::with_generator()),
    )?);
    let server = RpcServer::spawn(Arc::clone(&ctx), config)?;
    info!(path = %server.path().display(), "mediaplaned ready");

    if watch_stdin {
        for line in std::io::stdin().lock().lines() {
            if line?.trim() == "quit" {
                break;
            }
        }
    } else {
        loop {
            std::thread::park();
        }
    }

    server.shutdown();
    ctx.shutdown();
    info!("mediaplaned exiting");
    Ok(())
}
