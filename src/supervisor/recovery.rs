//! Flap detection and recovery.
//!
//! A crashing device that re-enumerates in a loop produces a hotplug storm.
//! Detection is a sliding window over event times; recovery unbinds the USB
//! device at the kernel (which silences the storm at the source), optionally
//! coerces the device into its ROM loader through board-control pins, and
//! rebinds.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::activity::Category;
use crate::gpio::PinValue;
use crate::usbpath;

use super::slot::{Slot, SlotInner, SlotState};
use super::Supervisor;

/// Sliding-window size for flap detection.
pub const FLAP_WINDOW: Duration = Duration::from_secs(30);
/// Events within the window that mean the device is storming.
pub const FLAP_THRESHOLD: usize = 6;
/// Quiet time that clears a flap, and the settle pause inside recovery.
pub const FLAP_COOLDOWN: Duration = Duration::from_secs(10);
/// No-GPIO recovery attempts before requiring operator action.
pub const MAX_RECOVER_RETRIES: u32 = 2;

/// Kernel enumeration settle after rebind.
const ENUMERATION_SETTLE: Duration = Duration::from_secs(2);
/// LOW dwell when pulsing the enable line.
const EN_PULSE_DWELL: Duration = Duration::from_millis(100);

/// Record a hotplug event and drop everything older than the window.
pub fn note_event(times: &mut VecDeque<Instant>, now: Instant) {
    times.push_back(now);
    prune(times, now);
}

pub fn prune(times: &mut VecDeque<Instant>, now: Instant) {
    while times
        .front()
        .is_some_and(|&t| now.duration_since(t) > FLAP_WINDOW)
    {
        times.pop_front();
    }
}

/// Threshold reached?
pub fn storming(times: &VecDeque<Instant>) -> bool {
    times.len() >= FLAP_THRESHOLD
}

/// A flap has quieted down once the window has aged out to fewer than two
/// events, or the two newest events are at least a cooldown apart.
pub fn quiet(times: &VecDeque<Instant>) -> bool {
    let n = times.len();
    if n < 2 {
        return true;
    }
    times[n - 1].duration_since(times[n - 2]) >= FLAP_COOLDOWN
}

/// Clear a stale flap. Runs from the ingest path and from every
/// `/api/devices` projection, so a slot that went quiet without producing a
/// new event still leaves `Flapping`. Caller holds the slot mutex.
pub fn maybe_clear_flap(inner: &mut SlotInner) -> bool {
    if !inner.flapping || inner.recovering {
        return false;
    }
    prune(&mut inner.event_times, Instant::now());
    if !quiet(&inner.event_times) {
        return false;
    }
    inner.flapping = false;
    inner.last_error = None;
    inner.state = if inner.present {
        SlotState::Idle
    } else {
        SlotState::Absent
    };
    true
}

/// Kernel-level USB unbind/rebind through the usb driver's sysfs knobs.
#[derive(Debug, Clone)]
pub struct UsbRebinder {
    driver_dir: PathBuf,
}

impl UsbRebinder {
    pub fn new(driver_dir: PathBuf) -> Self {
        Self { driver_dir }
    }

    pub async fn unbind(&self, device: &str) -> std::io::Result<()> {
        tokio::fs::write(self.driver_dir.join("unbind"), device).await
    }

    pub async fn bind(&self, device: &str) -> std::io::Result<()> {
        tokio::fs::write(self.driver_dir.join("bind"), device).await
    }
}

impl Supervisor {
    /// Launch the recovery task for a flapping slot. The task owns the slot
    /// until `recovering` is cleared; hotplug events are dropped meanwhile.
    pub(crate) fn spawn_flap_recovery(self: &Arc<Self>, slot: Arc<Slot>) {
        let sup = self.clone();
        tokio::spawn(async move {
            sup.run_flap_recovery(&slot).await;
        });
    }

    async fn run_flap_recovery(&self, slot: &Slot) {
        {
            let mut inner = slot.lock().await;
            if !inner.flapping || inner.recovering {
                return;
            }
            inner.recovering = true;
            inner.state = SlotState::Recovering;
            self.proxy.stop(&mut inner).await;
        }
        self.activity
            .log(format!("{}: starting flap recovery", slot.key), Category::Step);

        let device = match usbpath::sysfs_device_name(&slot.key) {
            Ok(device) => device,
            Err(e) => {
                self.park_flapping(slot, format!("recovery aborted: {e}")).await;
                return;
            }
        };

        if let Err(e) = self.usb.unbind(&device).await {
            self.park_flapping(slot, format!("usb unbind of {device} failed: {e}"))
                .await;
            return;
        }
        self.activity
            .log(format!("{}: unbound usb device {device}", slot.key), Category::Step);

        match slot.gpio_boot {
            Some(boot_pin) => self.recover_with_gpio(slot, &device, boot_pin).await,
            None => self.recover_without_gpio(slot, &device).await,
        }
    }

    /// Hard path: hold the boot-strap pin so the chip lands in its ROM
    /// loader, reset it into that state, rebind and park in download mode
    /// for external flashing tooling.
    async fn recover_with_gpio(&self, slot: &Slot, device: &str, boot_pin: u8) {
        tokio::time::sleep(FLAP_COOLDOWN).await;

        if let Err(e) = self.gpio.set_pin(boot_pin, PinValue::Low) {
            let _ = self.usb.bind(device).await;
            self.park_flapping(slot, format!("gpio_boot {boot_pin} failed: {e}"))
                .await;
            return;
        }
        if let Some(en_pin) = slot.gpio_en {
            if let Err(e) = self.pulse_enable(en_pin).await {
                let _ = self.usb.bind(device).await;
                self.park_flapping(slot, format!("gpio_en {en_pin} failed: {e}"))
                    .await;
                return;
            }
        }

        if let Err(e) = self.usb.bind(device).await {
            self.park_flapping(slot, format!("usb rebind of {device} failed: {e}"))
                .await;
            return;
        }
        tokio::time::sleep(ENUMERATION_SETTLE).await;

        let mut inner = slot.lock().await;
        inner.state = SlotState::DownloadMode;
        inner.flapping = false;
        inner.recover_retries = 0;
        inner.recovering = false;
        inner.event_times.clear();
        inner.last_error = None;
        drop(inner);
        info!("{}: entered download mode", slot.key);
        self.activity.log(
            format!("{}: device held in download mode, ready for flashing", slot.key),
            Category::Ok,
        );
    }

    /// Soft path: rebind and hope the device boots stably this time. If the
    /// storm resumes, detection fires again with the retry counter bumped.
    async fn recover_without_gpio(&self, slot: &Slot, device: &str) {
        let retries = slot.lock().await.recover_retries;
        if retries >= MAX_RECOVER_RETRIES {
            let mut inner = slot.lock().await;
            inner.last_error = Some(format!(
                "still flapping after {MAX_RECOVER_RETRIES} recovery attempts; needs manual intervention"
            ));
            inner.state = SlotState::Flapping;
            inner.recovering = false;
            drop(inner);
            self.activity.log(
                format!("{}: recovery retries exhausted, operator action required", slot.key),
                Category::Error,
            );
            return;
        }

        tokio::time::sleep(FLAP_COOLDOWN).await;

        {
            let mut inner = slot.lock().await;
            inner.recover_retries += 1;
            inner.flapping = false;
            inner.event_times.clear();
            inner.recovering = false;
            inner.state = SlotState::Idle;
        }

        if let Err(e) = self.usb.bind(device).await {
            let mut inner = slot.lock().await;
            inner.flapping = true;
            inner.state = SlotState::Flapping;
            inner.last_error = Some(format!("usb rebind of {device} failed: {e}"));
            drop(inner);
            self.activity
                .log(format!("{}: usb rebind failed: {e}", slot.key), Category::Error);
            return;
        }
        self.activity.log(
            format!("{}: rebound usb device, watching for stability", slot.key),
            Category::Ok,
        );
    }

    async fn pulse_enable(&self, en_pin: u8) -> Result<(), crate::gpio::GpioError> {
        self.gpio.set_pin(en_pin, PinValue::Low)?;
        tokio::time::sleep(EN_PULSE_DWELL).await;
        self.gpio.set_pin(en_pin, PinValue::High)
    }

    async fn park_flapping(&self, slot: &Slot, message: String) {
        warn!("{}: {message}", slot.key);
        self.activity
            .log(format!("{}: {message}", slot.key), Category::Error);
        let mut inner = slot.lock().await;
        inner.last_error = Some(message);
        inner.recovering = false;
        inner.state = SlotState::Flapping;
    }

    /// Operator override: reset the retry budget and force a new recovery
    /// cycle, even when the cap was hit.
    pub async fn operator_recover(self: &Arc<Self>, slot: &Arc<Slot>) -> Result<(), String> {
        {
            let mut inner = slot.lock().await;
            if inner.recovering {
                return Err("recovery already in progress".to_string());
            }
            inner.recover_retries = 0;
            inner.flapping = true;
            inner.state = SlotState::Flapping;
        }
        self.activity.log(
            format!("{}: operator requested recovery", slot.key),
            Category::Step,
        );
        self.spawn_flap_recovery(slot.clone());
        Ok(())
    }

    /// Leave download mode: float the boot pin (input with pull-up), pulse
    /// the enable line so the device reboots into the freshly flashed
    /// firmware.
    pub async fn release_slot(&self, slot: &Slot) -> Result<(), String> {
        let Some(boot_pin) = slot.gpio_boot else {
            return Err("slot has no gpio_boot configured".to_string());
        };
        let mut inner = slot.lock().await;
        if inner.state != SlotState::DownloadMode {
            return Err("slot is not in download mode".to_string());
        }
        self.gpio
            .set_pin(boot_pin, PinValue::HighZ)
            .map_err(|e| e.to_string())?;
        if let Some(en_pin) = slot.gpio_en {
            self.pulse_enable(en_pin).await.map_err(|e| e.to_string())?;
        }
        inner.state = SlotState::Idle;
        drop(inner);
        self.activity
            .log(format!("{}: released from download mode", slot.key), Category::Ok);
        Ok(())
    }
}
