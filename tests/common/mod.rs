//! Shared in-process server harness for the integration suites.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use usbslotd::config::SlotConfig;
use usbslotd::gpio::NoopGpio;
use usbslotd::radio::UnavailableRadio;
use usbslotd::server::{self, RunningServer};
use usbslotd::supervisor::proxy::ProxyRunner;
use usbslotd::supervisor::recovery::UsbRebinder;
use usbslotd::supervisor::{Supervisor, SupervisorOptions};

pub struct TestServer {
    pub base_url: String,
    pub client: reqwest::Client,
    pub supervisor: Arc<Supervisor>,
    pub gpio: Arc<NoopGpio>,
    pub sysfs: tempfile::TempDir,
    server: RunningServer,
}

impl TestServer {
    /// Start the full HTTP surface on an ephemeral port with a fake sysfs
    /// tree, recorded GPIO and no proxy executable.
    pub async fn start(slots: Vec<SlotConfig>) -> anyhow::Result<Self> {
        let sysfs = tempfile::tempdir()?;
        let gpio = Arc::new(NoopGpio::new());
        let supervisor = Supervisor::new(SupervisorOptions {
            slots,
            proxy: ProxyRunner::new(PathBuf::from("/nonexistent/rfc2217_server.py")),
            usb: UsbRebinder::new(sysfs.path().to_path_buf()),
            gpio: gpio.clone(),
            radio: Arc::new(UnavailableRadio),
        });

        let server = server::start(
            supervisor.clone(),
            SocketAddr::from(([127, 0, 0, 1], 0)),
        )
        .await?;
        let base_url = format!("http://{}", server.addr());
        let client = reqwest::Client::new();

        // Ensure the server is accepting connections before returning.
        let mut ready = false;
        for _ in 0..50 {
            if let Ok(resp) = client.get(format!("{base_url}/api/info")).send().await {
                if resp.status().is_success() {
                    ready = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        anyhow::ensure!(ready, "/api/info did not become ready in time");

        Ok(Self {
            base_url,
            client,
            supervisor,
            gpio,
            sysfs,
            server,
        })
    }

    pub async fn shutdown(self) {
        self.server.shutdown().await;
    }

    pub async fn get(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        Ok(self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await?
            .json()
            .await?)
    }

    pub async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        Ok(self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await?
            .json()
            .await?)
    }

    /// Status of the one slot named `slot_key` in `/api/devices`.
    pub async fn slot_status(&self, slot_key: &str) -> anyhow::Result<serde_json::Value> {
        let devices = self.get("/api/devices").await?;
        devices["slots"]
            .as_array()
            .and_then(|slots| {
                slots
                    .iter()
                    .find(|s| s["slot_key"] == slot_key)
                    .cloned()
            })
            .ok_or_else(|| anyhow::anyhow!("slot {slot_key} not in /api/devices"))
    }

    /// Poll until the slot reaches `state` or `deadline` passes.
    pub async fn wait_for_state(
        &self,
        slot_key: &str,
        state: &str,
        deadline: Duration,
    ) -> anyhow::Result<serde_json::Value> {
        let until = tokio::time::Instant::now() + deadline;
        loop {
            let status = self.slot_status(slot_key).await?;
            if status["state"] == state {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= until {
                anyhow::bail!("slot {slot_key} never reached {state}, last: {status}");
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

pub fn slot_cfg(key: &str, label: Option<&str>, tcp_port: Option<u16>) -> SlotConfig {
    serde_json::from_value(serde_json::json!({
        "slot_key": key,
        "label": label,
        "tcp_port": tcp_port,
    }))
    .unwrap()
}

pub fn gpio_slot_cfg(key: &str, label: &str, boot: u8, en: u8) -> SlotConfig {
    serde_json::from_value(serde_json::json!({
        "slot_key": key,
        "label": label,
        "tcp_port": 4001,
        "gpio_boot": boot,
        "gpio_en": en,
    }))
    .unwrap()
}
