//! Radio collaborator seam.
//!
//! The host radio can be multiplexed between two mutually exclusive roles:
//! a WiFi test instrument (SoftAP / station / scan / HTTP relay) and a plain
//! management-network client. The controller implementing that lives outside
//! this crate; the supervisor only forwards `/api/wifi/*` requests to this
//! interface and passes the result objects through unchanged.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Result objects are loose JSON maps merged into the HTTP response by
/// explicit field copying.
pub type RadioResult = Result<Map<String, Value>, RadioError>;

#[derive(Error, Debug)]
pub enum RadioError {
    #[error("radio controller not available")]
    Unavailable,
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetModeRequest {
    pub mode: String,
    #[serde(default)]
    pub ssid: String,
    #[serde(default, rename = "pass")]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApStartRequest {
    pub ssid: String,
    #[serde(default, rename = "pass")]
    pub password: String,
    #[serde(default)]
    pub channel: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaJoinRequest {
    pub ssid: String,
    #[serde(default, rename = "pass")]
    pub password: String,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpRelayRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Option<Map<String, Value>>,
    /// Base64-encoded request body.
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaseEvent {
    pub action: String,
    pub mac: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub hostname: String,
}

/// Operations the radio controller must provide. The supervisor treats this
/// as an opaque collaborator: calls are forwarded, errors are surfaced as
/// `{ok: false, error}` on the corresponding endpoint.
#[async_trait]
pub trait RadioController: Send + Sync + fmt::Debug {
    async fn ping(&self) -> RadioResult;
    async fn get_mode(&self) -> RadioResult;
    async fn set_mode(&self, req: SetModeRequest) -> RadioResult;
    async fn ap_start(&self, req: ApStartRequest) -> RadioResult;
    async fn ap_stop(&self) -> RadioResult;
    async fn ap_status(&self) -> RadioResult;
    async fn sta_join(&self, req: StaJoinRequest) -> RadioResult;
    async fn sta_leave(&self) -> RadioResult;
    async fn scan(&self) -> RadioResult;
    async fn http_relay(&self, req: HttpRelayRequest) -> RadioResult;
    /// Long-poll drain of the collaborator's event queue.
    async fn get_events(&self, timeout: Duration) -> Result<Vec<Value>, RadioError>;
    async fn handle_lease_event(&self, event: LeaseEvent) -> RadioResult;
    async fn shutdown(&self);
}

/// Bounded event queue with long-poll semantics, for controller
/// implementations to embed. A full queue drops the oldest pending events
/// on the floor rather than backpressuring the radio path.
#[derive(Debug)]
pub struct EventQueue {
    tx: mpsc::Sender<Value>,
    rx: Mutex<mpsc::Receiver<Value>>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    const CAPACITY: usize = 64;

    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(Self::CAPACITY);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn push(&self, event: Value) {
        if self.tx.try_send(event).is_err() {
            tracing::warn!("radio event queue full, dropping event");
        }
    }

    /// Wait up to `timeout` for the first event, then drain whatever else is
    /// queued. A zero timeout drains without waiting.
    pub async fn drain(&self, timeout: Duration) -> Vec<Value> {
        let mut rx = self.rx.lock().await;
        let mut events = Vec::new();

        if !timeout.is_zero() {
            if let Ok(Some(event)) = tokio::time::timeout(timeout, rx.recv()).await {
                events.push(event);
            }
        }
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Placeholder wired in when no radio controller is configured.
#[derive(Debug, Default)]
pub struct UnavailableRadio;

macro_rules! unavailable {
    () => {
        Err(RadioError::Unavailable)
    };
}

#[async_trait]
impl RadioController for UnavailableRadio {
    async fn ping(&self) -> RadioResult {
        unavailable!()
    }
    async fn get_mode(&self) -> RadioResult {
        unavailable!()
    }
    async fn set_mode(&self, _req: SetModeRequest) -> RadioResult {
        unavailable!()
    }
    async fn ap_start(&self, _req: ApStartRequest) -> RadioResult {
        unavailable!()
    }
    async fn ap_stop(&self) -> RadioResult {
        unavailable!()
    }
    async fn ap_status(&self) -> RadioResult {
        unavailable!()
    }
    async fn sta_join(&self, _req: StaJoinRequest) -> RadioResult {
        unavailable!()
    }
    async fn sta_leave(&self) -> RadioResult {
        unavailable!()
    }
    async fn scan(&self) -> RadioResult {
        unavailable!()
    }
    async fn http_relay(&self, _req: HttpRelayRequest) -> RadioResult {
        unavailable!()
    }
    async fn get_events(&self, _timeout: Duration) -> Result<Vec<Value>, RadioError> {
        Ok(Vec::new())
    }
    async fn handle_lease_event(&self, _event: LeaseEvent) -> RadioResult {
        unavailable!()
    }
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_empty() {
        let queue = EventQueue::new();
        let events = queue.drain(Duration::from_secs(2)).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn drain_returns_first_event_and_backlog() {
        let queue = EventQueue::new();
        queue.push(json!({"type": "STA_CONNECT", "mac": "aa:bb"}));
        queue.push(json!({"type": "STA_DISCONNECT", "mac": "aa:bb"}));

        let events = queue.drain(Duration::from_secs(5)).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "STA_CONNECT");
    }

    #[tokio::test]
    async fn zero_timeout_drains_without_waiting() {
        let queue = EventQueue::new();
        assert!(queue.drain(Duration::ZERO).await.is_empty());
        queue.push(json!({"type": "STA_CONNECT"}));
        assert_eq!(queue.drain(Duration::ZERO).await.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_radio_reports_error_but_empty_events() {
        let radio = UnavailableRadio;
        assert!(matches!(radio.ping().await, Err(RadioError::Unavailable)));
        assert!(radio.get_events(Duration::ZERO).await.unwrap().is_empty());
    }
}
