//! The slot supervisor.
//!
//! One [`Supervisor`] value owns everything mutable in the process: the slot
//! registry, the global hotplug sequence counter, the activity log, the UDP
//! log ring, the human rendezvous gate and the hardware seams (GPIO, USB
//! rebind, proxy runner, radio collaborator). `main` builds it once and
//! hands `Arc` clones to the HTTP handlers and background tasks.

pub mod hotplug;
pub mod proxy;
pub mod recovery;
pub mod slot;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::activity::{ActivityLog, Category};
use crate::config::SlotConfig;
use crate::gpio::GpioControl;
use crate::radio::RadioController;
use crate::udplog::UdpRing;

use self::proxy::{ProxyError, ProxyRunner};
use self::recovery::UsbRebinder;
use self::slot::{Slot, SlotState, SlotStatus};

/// Everything the supervisor needs injected at construction.
#[derive(Debug)]
pub struct SupervisorOptions {
    pub slots: Vec<SlotConfig>,
    pub proxy: ProxyRunner,
    pub usb: UsbRebinder,
    pub gpio: Arc<dyn GpioControl>,
    pub radio: Arc<dyn RadioController>,
}

#[derive(Debug)]
pub struct Supervisor {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    seq: AtomicU64,
    pub activity: Arc<ActivityLog>,
    pub udp_ring: Arc<UdpRing>,
    pub human: crate::human::HumanGate,
    pub gpio: Arc<dyn GpioControl>,
    pub radio: Arc<dyn RadioController>,
    pub(crate) usb: UsbRebinder,
    pub(crate) proxy: ProxyRunner,
    started: Instant,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Arc<Self> {
        let mut slots = HashMap::new();
        for cfg in options.slots {
            let slot = Slot::from_config(cfg);
            slots.insert(slot.key.clone(), Arc::new(slot));
        }
        info!("registry loaded with {} configured slot(s)", slots.len());

        Arc::new(Self {
            slots: RwLock::new(slots),
            seq: AtomicU64::new(0),
            activity: Arc::new(ActivityLog::new()),
            udp_ring: Arc::new(UdpRing::new()),
            human: crate::human::HumanGate::new(),
            gpio: options.gpio,
            radio: options.radio,
            usb: options.usb,
            proxy: options.proxy,
            started: Instant::now(),
        })
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn slot(&self, key: &str) -> Option<Arc<Slot>> {
        self.slots.read().unwrap().get(key).cloned()
    }

    /// Resolve a slot reference from the control surface: label first, then
    /// slot key.
    pub fn find_slot(&self, name: &str) -> Option<Arc<Slot>> {
        let slots = self.slots.read().unwrap();
        slots
            .values()
            .find(|s| s.label.as_deref() == Some(name))
            .or_else(|| slots.get(name))
            .cloned()
    }

    /// Look a slot up, inserting a dynamic (tracked, unserviced) record for
    /// keys we have never seen. Slots are never removed again.
    pub fn ensure_slot(&self, key: &str) -> Arc<Slot> {
        if let Some(slot) = self.slot(key) {
            return slot;
        }
        let mut slots = self.slots.write().unwrap();
        slots
            .entry(key.to_string())
            .or_insert_with(|| {
                info!("tracking unconfigured slot {key}");
                self.activity
                    .log(format!("tracking unconfigured slot {key}"), Category::Info);
                Arc::new(Slot::dynamic(key))
            })
            .clone()
    }

    pub fn all_slots(&self) -> Vec<Arc<Slot>> {
        let mut slots: Vec<_> = self.slots.read().unwrap().values().cloned().collect();
        slots.sort_by(|a, b| a.key.cmp(&b.key));
        slots
    }

    /// Snapshot every slot for `/api/devices`. Doubles as the periodic
    /// observation point: dead proxies are noticed and stale flaps cleared
    /// here, under each slot's mutex.
    pub async fn project_all(&self) -> Vec<SlotStatus> {
        let mut statuses = Vec::new();
        for slot in self.all_slots() {
            let mut inner = slot.lock().await;
            self.proxy.health_check(&mut inner);
            recovery::maybe_clear_flap(&mut inner);
            statuses.push(slot.project(&inner));
        }
        statuses
    }

    /// Force-start the proxy for a slot. Acquires the slot mutex itself, so
    /// callers must not hold it. Refuses slots the recovery engine owns or
    /// that are parked in download mode, re-checked under the lock.
    pub async fn start_proxy(&self, slot: &Slot) -> Result<(), ProxyError> {
        let mut inner = slot.lock().await;
        if inner.flapping || inner.recovering {
            return Err(ProxyError::Flapping);
        }
        if inner.state == SlotState::DownloadMode {
            return Err(ProxyError::DownloadMode);
        }
        self.proxy.stop(&mut inner).await;
        match self.proxy.start(slot, &mut inner, &host_ip()).await {
            Ok(()) => {
                let url = inner.url.clone().unwrap_or_default();
                drop(inner);
                self.activity
                    .log(format!("{}: proxy listening at {url}", slot.key), Category::Ok);
                Ok(())
            }
            Err(e) => {
                inner.last_error = Some(e.to_string());
                if inner.state == SlotState::Absent && inner.present {
                    inner.state = SlotState::Idle;
                }
                drop(inner);
                self.activity
                    .log(format!("{}: proxy start failed: {e}", slot.key), Category::Error);
                Err(e)
            }
        }
    }

    /// Stop the proxy for a slot. Idempotent.
    pub async fn stop_proxy(&self, slot: &Slot) {
        let mut inner = slot.lock().await;
        let was_running = inner.running;
        self.proxy.stop(&mut inner).await;
        if !inner.flapping && !inner.recovering {
            inner.state = if inner.present {
                SlotState::Idle
            } else {
                SlotState::Absent
            };
        }
        drop(inner);
        if was_running {
            self.activity
                .log(format!("{}: proxy stopped", slot.key), Category::Info);
        }
    }

    /// Walk existing serial device nodes at startup, recover their slot keys
    /// from udev and bring configured slots up without waiting for a fresh
    /// hotplug event.
    pub async fn boot_scan(self: &Arc<Self>) {
        let nodes = match enumerate_serial_nodes("/dev") {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("boot scan: cannot enumerate /dev: {e}");
                return;
            }
        };
        for devnode in nodes {
            let Some(props) = udev_properties(&devnode).await else {
                warn!("boot scan: no udev properties for {devnode}");
                continue;
            };
            let Some(slot_key) = props
                .get("ID_PATH")
                .or_else(|| props.get("DEVPATH"))
                .cloned()
            else {
                debug!("boot scan: {devnode} has neither ID_PATH nor DEVPATH");
                continue;
            };

            let slot = self.ensure_slot(&slot_key);
            {
                let mut inner = slot.lock().await;
                inner.present = true;
                inner.devnode = Some(devnode.clone());
                if inner.state == SlotState::Absent {
                    inner.state = SlotState::Idle;
                }
            }
            self.activity
                .log(format!("boot scan: {devnode} at {slot_key}"), Category::Info);
            if slot.tcp_port.is_some() {
                let _ = self.start_proxy(&slot).await;
            }
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Orderly shutdown: stop every proxy child, then the collaborator.
    pub async fn shutdown_all(&self) {
        for slot in self.all_slots() {
            let mut inner = slot.lock().await;
            self.proxy.stop(&mut inner).await;
        }
        self.radio.shutdown().await;
        info!("all proxies stopped");
    }
}

/// Serial device nodes eligible for the boot scan.
fn enumerate_serial_nodes(dev_dir: &str) -> std::io::Result<Vec<String>> {
    let mut nodes = Vec::new();
    for entry in std::fs::read_dir(dev_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("ttyACM") || name.starts_with("ttyUSB") {
            nodes.push(format!("{dev_dir}/{name}"));
        }
    }
    nodes.sort();
    Ok(nodes)
}

/// `udevadm info -q property -n <devnode>`, parsed into a key/value map.
/// The supervisor never talks to udev directly at runtime; hotplug events
/// arrive over HTTP from a udev rule. The boot scan recovers the same
/// properties for devices that were already plugged in.
async fn udev_properties(devnode: &str) -> Option<HashMap<String, String>> {
    let output = tokio::process::Command::new("udevadm")
        .args(["info", "-q", "property", "-n", devnode])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Some(parse_udev_properties(&text))
}

fn parse_udev_properties(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// The LAN address advertised in proxy URLs. Routing a datagram socket at a
/// public address tells us which local interface would carry it; nothing is
/// actually sent.
pub fn host_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}

pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
