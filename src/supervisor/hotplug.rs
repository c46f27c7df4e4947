//! Hotplug event ingestion.
//!
//! The only entry point that writes slot lifecycle. An external udev rule
//! POSTs add/remove notifications here; the ingest path updates bookkeeping,
//! arms flap detection and returns immediately. Proxy start/stop always
//! happens on a background task because starting blocks for seconds, and
//! hotplug producers must never be backpressured.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::activity::Category;

use super::recovery;
use super::slot::{Slot, SlotState};
use super::Supervisor;

/// Native-USB CDC devices re-enumerate while their firmware boots; give
/// them this long before opening the node for the proxy.
const USB_BOOT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HotplugAction {
    Add,
    Remove,
}

impl std::fmt::Display for HotplugAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// A hotplug notification as delivered by the udev rule.
#[derive(Debug, Clone, Deserialize)]
pub struct HotplugEvent {
    pub action: HotplugAction,
    #[serde(default)]
    pub devnode: Option<String>,
    #[serde(default)]
    pub id_path: Option<String>,
    #[serde(default)]
    pub devpath: Option<String>,
}

/// Synchronous ingest acknowledgement. `accepted` reflects whether the slot
/// is configured for service at all.
#[derive(Debug, Clone, Serialize)]
pub struct HotplugAck {
    pub slot_key: String,
    pub seq: u64,
    pub accepted: bool,
    pub flapping: bool,
    pub recovering: bool,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("event carries neither id_path nor devpath")]
    NoSlotKey,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

impl Supervisor {
    /// Ingest one hotplug event. Returns quickly; any proxy work runs on a
    /// spawned task that re-acquires the slot mutex itself.
    pub async fn ingest_hotplug(
        self: &Arc<Self>,
        event: HotplugEvent,
    ) -> Result<HotplugAck, IngestError> {
        let slot_key = non_empty(event.id_path.clone())
            .or_else(|| non_empty(event.devpath.clone()))
            .ok_or(IngestError::NoSlotKey)?;

        let slot = self.ensure_slot(&slot_key);
        let seq = self.next_seq();
        debug!("hotplug {} {} seq={seq}", event.action, slot_key);

        let mut inner = slot.lock().await;
        inner.seq = seq;
        inner.last_action = Some(event.action.to_string());
        inner.last_event_ts = Some(OffsetDateTime::now_utc());

        // The recovery engine owns the slot and produces synthetic kernel
        // events through rebind; those must not feed back into detection.
        if inner.recovering {
            info!("{slot_key}: dropping hotplug {} during recovery", event.action);
            self.activity.log(
                format!("{slot_key}: ignored {} while recovering", event.action),
                Category::Info,
            );
            return Ok(HotplugAck {
                slot_key,
                seq,
                accepted: slot.tcp_port.is_some(),
                flapping: inner.flapping,
                recovering: true,
            });
        }

        recovery::note_event(&mut inner.event_times, Instant::now());

        let mut triggered = false;
        if inner.flapping {
            recovery::maybe_clear_flap(&mut inner);
        } else if recovery::storming(&inner.event_times) {
            inner.flapping = true;
            inner.state = SlotState::Flapping;
            inner.last_error = Some(format!(
                "hotplug storm: {} events within {}s",
                inner.event_times.len(),
                recovery::FLAP_WINDOW.as_secs()
            ));
            triggered = true;
            self.activity.log(
                format!("{slot_key}: flapping, starting recovery"),
                Category::Error,
            );
        }

        match event.action {
            HotplugAction::Add => {
                inner.present = true;
                inner.devnode = event.devnode.clone();
                if !inner.flapping {
                    if inner.state == SlotState::Absent {
                        inner.state = SlotState::Idle;
                    }
                    if slot.tcp_port.is_some() && inner.state != SlotState::DownloadMode {
                        if let Some(devnode) = inner.devnode.clone() {
                            self.spawn_proxy_restart(slot.clone(), devnode);
                        }
                    }
                }
            }
            HotplugAction::Remove => {
                inner.present = false;
                if !inner.flapping {
                    inner.state = SlotState::Absent;
                }
                if inner.running {
                    let sup = self.clone();
                    let slot = slot.clone();
                    tokio::spawn(async move {
                        sup.stop_proxy(&slot).await;
                    });
                }
            }
        }

        let ack = HotplugAck {
            slot_key,
            seq,
            accepted: slot.tcp_port.is_some(),
            flapping: inner.flapping,
            recovering: inner.recovering,
        };
        drop(inner);

        if triggered {
            self.spawn_flap_recovery(slot);
        }
        Ok(ack)
    }

    /// Restart the proxy off the ingest path. The boot grace only applies
    /// to native-CDC nodes, whose firmware is still starting up when the
    /// node appears.
    fn spawn_proxy_restart(self: &Arc<Self>, slot: Arc<Slot>, devnode: String) {
        let sup = self.clone();
        tokio::spawn(async move {
            if devnode.contains("ttyACM") {
                tokio::time::sleep(USB_BOOT_GRACE).await;
            }
            {
                let inner = slot.lock().await;
                if inner.flapping || inner.recovering || !inner.present {
                    return;
                }
            }
            // start_proxy re-checks ownership under the lock.
            let _ = sup.start_proxy(&slot).await;
        });
    }
}
