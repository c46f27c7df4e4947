//! HTTP control surface.
//!
//! JSON over HTTP on all interfaces. The server must serve requests
//! concurrently: the human-interaction handler parks its request for up to
//! minutes, and serial reads run for seconds, while `/api/devices` pollers
//! keep arriving.

mod api;
pub mod payload;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::supervisor::Supervisor;

pub fn app(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/api/devices", get(api::devices))
        .route("/api/info", get(api::info))
        .route("/api/discover", get(api::discover))
        .route("/api/hotplug", post(api::hotplug))
        .route("/api/start", post(api::start_slot))
        .route("/api/stop", post(api::stop_slot))
        .route("/api/serial/reset", post(api::serial_reset))
        .route("/api/serial/monitor", post(api::serial_monitor))
        .route("/api/serial/recover", post(api::serial_recover))
        .route("/api/serial/release", post(api::serial_release))
        .route("/api/log", get(api::log_entries))
        .route("/api/human-interaction", post(api::human_request))
        .route("/api/human/status", get(api::human_status))
        .route("/api/human/done", post(api::human_done))
        .route("/api/human/cancel", post(api::human_cancel))
        .route("/api/wifi/ping", get(api::wifi_ping))
        .route("/api/wifi/mode", get(api::wifi_get_mode).post(api::wifi_set_mode))
        .route("/api/wifi/ap_start", post(api::wifi_ap_start))
        .route("/api/wifi/ap_stop", post(api::wifi_ap_stop))
        .route("/api/wifi/ap_status", get(api::wifi_ap_status))
        .route("/api/wifi/sta_join", post(api::wifi_sta_join))
        .route("/api/wifi/sta_leave", post(api::wifi_sta_leave))
        .route("/api/wifi/scan", get(api::wifi_scan))
        .route("/api/wifi/http", post(api::wifi_http))
        .route("/api/wifi/events", get(api::wifi_events))
        .route("/api/wifi/lease", post(api::wifi_lease))
        .fallback(api::not_found)
        .with_state(supervisor)
}

/// Handle to a started server, for tests and orderly shutdown.
#[derive(Debug)]
pub struct RunningServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningServer {
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Bind and serve in the background.
pub async fn start(supervisor: Arc<Supervisor>, bind: SocketAddr) -> anyhow::Result<RunningServer> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind control surface on {bind}"))?;
    let addr = listener.local_addr().context("Failed to read bound address")?;
    let cancel = CancellationToken::new();

    let app = app(supervisor);
    let shutdown = cancel.clone();
    let handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        // Per-connection I/O errors (clients hanging up mid-response) are
        // swallowed by hyper; only a listener-level failure lands here.
        if let Err(e) = serve.await {
            error!("control surface stopped: {e}");
        }
    });

    info!("control surface listening on {addr}");
    Ok(RunningServer { addr, cancel, handle })
}
