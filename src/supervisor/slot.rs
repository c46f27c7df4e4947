//! Per-slot state.
//!
//! A slot is an immutable physical USB position. Its mutable half lives
//! behind a per-slot mutex; every state transition and every field the
//! hotplug path or the recovery engine touches is serialised by that lock.

use std::collections::VecDeque;
use std::time::Instant;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::process::Child;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::SlotConfig;

/// Slot lifecycle states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    #[default]
    Absent,
    Idle,
    Resetting,
    Monitoring,
    Flapping,
    Recovering,
    DownloadMode,
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Absent => "absent",
            Self::Idle => "idle",
            Self::Resetting => "resetting",
            Self::Monitoring => "monitoring",
            Self::Flapping => "flapping",
            Self::Recovering => "recovering",
            Self::DownloadMode => "download_mode",
        };
        write!(f, "{name}")
    }
}

/// The immutable identity of a slot plus its guarded mutable state.
#[derive(Debug)]
pub struct Slot {
    pub key: String,
    pub label: Option<String>,
    /// Reserved localhost proxy port; `None` means tracked but not serviced.
    pub tcp_port: Option<u16>,
    pub gpio_boot: Option<u8>,
    pub gpio_en: Option<u8>,
    pub probe_open: Option<bool>,
    inner: Mutex<SlotInner>,
}

/// Mutable slot fields. Only reachable through [`Slot::lock`].
#[derive(Debug, Default)]
pub struct SlotInner {
    pub present: bool,
    pub devnode: Option<String>,
    pub running: bool,
    pub pid: Option<u32>,
    pub url: Option<String>,
    pub state: SlotState,
    pub flapping: bool,
    pub recovering: bool,
    pub recover_retries: u32,
    /// Sliding window of recent hotplug event times.
    pub event_times: VecDeque<Instant>,
    pub seq: u64,
    pub last_action: Option<String>,
    pub last_event_ts: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    /// The proxy child, kept so stop can signal and reap it.
    pub child: Option<Child>,
}

impl SlotInner {
    /// Clear all proxy bookkeeping after the child is gone.
    pub fn clear_proxy(&mut self) {
        self.running = false;
        self.pid = None;
        self.url = None;
        self.child = None;
    }
}

impl Slot {
    pub fn from_config(cfg: SlotConfig) -> Self {
        Self {
            key: cfg.slot_key,
            label: cfg.label,
            tcp_port: cfg.tcp_port,
            gpio_boot: cfg.gpio_boot,
            gpio_en: cfg.gpio_en,
            probe_open: cfg.probe_open,
            inner: Mutex::new(SlotInner::default()),
        }
    }

    /// A dynamic slot discovered at runtime: tracked, never serviced.
    pub fn dynamic(key: &str) -> Self {
        Self {
            key: key.to_string(),
            label: None,
            tcp_port: None,
            gpio_boot: None,
            gpio_en: None,
            probe_open: None,
            inner: Mutex::new(SlotInner::default()),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().await
    }

    /// Whether the settle probe may open this slot's device node. Opening a
    /// native-USB CDC node asserts modem-control lines and can interrupt the
    /// device's boot, so `ttyACM`-style nodes default to a no-open probe.
    pub fn probe_may_open(&self, devnode: &str) -> bool {
        self.probe_open.unwrap_or_else(|| !devnode.contains("ttyACM"))
    }

    /// JSON projection for the control surface. Excludes the raw event
    /// window and the child handle.
    pub fn project(&self, inner: &SlotInner) -> SlotStatus {
        SlotStatus {
            slot_key: self.key.clone(),
            label: self.label.clone(),
            tcp_port: self.tcp_port,
            gpio_boot: self.gpio_boot,
            gpio_en: self.gpio_en,
            present: inner.present,
            devnode: inner.devnode.clone(),
            running: inner.running,
            pid: inner.pid,
            url: inner.url.clone(),
            state: inner.state,
            flapping: inner.flapping,
            recovering: inner.recovering,
            seq: inner.seq,
            last_action: inner.last_action.clone(),
            last_event_ts: inner.last_event_ts,
            last_error: inner.last_error.clone(),
        }
    }
}

/// Public, serialisable view of one slot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub slot_key: String,
    pub label: Option<String>,
    pub tcp_port: Option<u16>,
    pub gpio_boot: Option<u8>,
    pub gpio_en: Option<u8>,
    pub present: bool,
    pub devnode: Option<String>,
    pub running: bool,
    pub pid: Option<u32>,
    pub url: Option<String>,
    pub state: SlotState,
    pub flapping: bool,
    pub recovering: bool,
    pub seq: u64,
    pub last_action: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_ts: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}
