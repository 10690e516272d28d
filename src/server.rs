mod routes;

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Runtime;
use tracing::info;

use crate::cli::Serve;
use crate::transport::StopFlag;

pub fn run_serve(serve: Serve) -> Result<()> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    {
        let stop = stop_flag.clone();
        let _ = ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        });
    }

    let listener = bind(serve.host)?;
    serve_with_shutdown(listener, stop_flag)
}

pub(crate) fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).with_context(|| format!("Binding TCP listener at {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("Setting TCP listener non-blocking mode")?;
    Ok(listener)
}

/// Resolves once the stop flag is raised.
async fn stopped(stop: StopFlag) {
    while !stop.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Serves on `listener` until the stop flag is raised. Blocks the calling
/// thread on a dedicated Tokio runtime.
pub(crate) fn serve_with_shutdown(listener: TcpListener, stop_flag: StopFlag) -> Result<()> {
    let local = listener.local_addr().context("Reading listener address")?;
    let runtime = Runtime::new().context("Constructing Tokio runtime for server")?;
    info!(host = %local, version = env!("CARGO_PKG_VERSION"), "Starting qospeedtest server");

    runtime.block_on(async {
        let listener = tokio::net::TcpListener::from_std(listener).context("Registering TCP listener")?;
        let app = routes::router(stop_flag.clone());
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(stopped(stop_flag.clone()))
            .await
            .context("Serving HTTP")
    })?;

    info!("Shutting down");
    Ok(())
}
