//! RFC2217 proxy child lifecycle.
//!
//! One external proxy process per serviced slot, spawned in its own process
//! group with discarded stdio. Start is only reported once the child has
//! survived its first half second and its TCP listen port accepts; stop is
//! SIGTERM to the group with a SIGKILL escalation.

use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::libc;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

use super::slot::{Slot, SlotInner, SlotState};

/// How long a device node may take to appear after enumeration.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE_POLL: Duration = Duration::from_millis(100);
/// Children that die faster than this are treated as spawn failures.
const SPAWN_GRACE: Duration = Duration::from_millis(500);
const LISTEN_TIMEOUT: Duration = Duration::from_secs(2);
const LISTEN_POLL: Duration = Duration::from_millis(100);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("slot has no reserved tcp port")]
    NotConfigured,
    #[error("slot has no device node")]
    NoDevnode,
    #[error("slot is flapping or recovering")]
    Flapping,
    #[error("slot is held in download mode")]
    DownloadMode,
    #[error("proxy executable {0} does not exist")]
    ExeMissing(PathBuf),
    #[error("device node {0} did not settle within 5s")]
    DeviceNotReady(String),
    #[error("failed to spawn proxy: {0}")]
    Spawn(std::io::Error),
    #[error("proxy exited immediately with {0}")]
    ExitedEarly(std::process::ExitStatus),
    #[error("proxy never accepted on 127.0.0.1:{0}")]
    NeverAccepted(u16),
}

/// Spawns and supervises the external RFC2217 server.
#[derive(Debug, Clone)]
pub struct ProxyRunner {
    interpreter: PathBuf,
    exe: PathBuf,
}

impl ProxyRunner {
    pub fn new(exe: PathBuf) -> Self {
        Self {
            interpreter: PathBuf::from("python3"),
            exe,
        }
    }

    /// Replace the interpreter the proxy is launched with.
    pub fn with_interpreter(mut self, interpreter: PathBuf) -> Self {
        self.interpreter = interpreter;
        self
    }

    /// Start the proxy for `slot`. The caller holds the slot mutex and has
    /// verified the slot is not flapping; any previous child is stopped
    /// first so at most one proxy ever exists per slot.
    pub async fn start(
        &self,
        slot: &Slot,
        inner: &mut SlotInner,
        host_ip: &str,
    ) -> Result<(), ProxyError> {
        let tcp_port = slot.tcp_port.ok_or(ProxyError::NotConfigured)?;
        let devnode = inner.devnode.clone().ok_or(ProxyError::NoDevnode)?;

        if !self.exe.exists() {
            return Err(ProxyError::ExeMissing(self.exe.clone()));
        }

        self.stop(inner).await;
        wait_for_devnode(&devnode, slot.probe_may_open(&devnode)).await?;

        debug!("spawning proxy for {} on port {tcp_port}", slot.key);
        let mut child = Command::new(&self.interpreter)
            .arg(&self.exe)
            .arg("-p")
            .arg(tcp_port.to_string())
            .arg(&devnode)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(ProxyError::Spawn)?;

        tokio::time::sleep(SPAWN_GRACE).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(ProxyError::ExitedEarly(status));
        }

        if !wait_for_listen(tcp_port, LISTEN_TIMEOUT).await {
            terminate(&mut child).await;
            return Err(ProxyError::NeverAccepted(tcp_port));
        }

        inner.pid = child.id();
        inner.child = Some(child);
        inner.running = true;
        inner.url = Some(format!("rfc2217://{host_ip}:{tcp_port}"));
        inner.last_error = None;
        inner.state = SlotState::Idle;
        Ok(())
    }

    /// Stop the proxy child if one exists. Idempotent.
    pub async fn stop(&self, inner: &mut SlotInner) {
        if let Some(mut child) = inner.child.take() {
            terminate(&mut child).await;
        }
        inner.clear_proxy();
    }

    /// Detect a proxy that died behind our back and fall the slot back to
    /// `Idle`/`Absent`.
    pub fn health_check(&self, inner: &mut SlotInner) {
        if !inner.running {
            return;
        }
        let alive = match inner.child.as_mut() {
            // try_wait reaps zombies, which a bare kill(pid, 0) would miss.
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => inner
                .pid
                .is_some_and(|pid| kill(Pid::from_raw(pid as i32), None).is_ok()),
        };
        if !alive {
            warn!("proxy child died unexpectedly (pid {:?})", inner.pid);
            inner.clear_proxy();
            inner.last_error = Some("process died".to_string());
            inner.state = if inner.present {
                SlotState::Idle
            } else {
                SlotState::Absent
            };
        }
    }
}

/// SIGTERM the child's process group, escalate to SIGKILL after 5 s, reap.
async fn terminate(child: &mut tokio::process::Child) {
    let Some(pid) = child.id() else {
        // Already reaped.
        let _ = child.wait().await;
        return;
    };
    let pgid = Pid::from_raw(pid as i32);
    let _ = killpg(pgid, Signal::SIGTERM);
    match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("proxy pid {pid} ignored SIGTERM, sending SIGKILL");
            let _ = killpg(pgid, Signal::SIGKILL);
            let _ = child.wait().await;
        }
    }
}

/// Wait for the device node to exist. For nodes where opening is safe, the
/// probe is a non-blocking read/write open that is closed immediately; for
/// native-USB CDC nodes mere existence is enough, since opening asserts
/// modem-control lines mid-boot.
async fn wait_for_devnode(devnode: &str, may_open: bool) -> Result<(), ProxyError> {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    let path = Path::new(devnode);
    loop {
        let ready = if may_open {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
                .open(path)
                .is_ok()
        } else {
            path.exists()
        };
        if ready {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ProxyError::DeviceNotReady(devnode.to_string()));
        }
        tokio::time::sleep(SETTLE_POLL).await;
    }
}

/// Poll `connect()` against the proxy's port until it accepts.
pub(crate) async fn wait_for_listen(tcp_port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if TcpStream::connect(("127.0.0.1", tcp_port)).await.is_ok() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(LISTEN_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlotConfig;

    fn serviced_slot(tcp_port: u16) -> Slot {
        Slot::from_config(SlotConfig {
            slot_key: "test-usb-0:1.1:1.0".to_string(),
            label: None,
            tcp_port: Some(tcp_port),
            gpio_boot: None,
            gpio_en: None,
            probe_open: None,
        })
    }

    #[tokio::test]
    async fn start_fails_without_port_or_devnode() {
        let runner = ProxyRunner::new(PathBuf::from("/bin/true"));
        let slot = Slot::dynamic("k");
        let mut inner = SlotInner::default();
        assert!(matches!(
            runner.start(&slot, &mut inner, "127.0.0.1").await,
            Err(ProxyError::NotConfigured)
        ));

        let slot = serviced_slot(47123);
        assert!(matches!(
            runner.start(&slot, &mut inner, "127.0.0.1").await,
            Err(ProxyError::NoDevnode)
        ));
    }

    #[tokio::test]
    async fn start_fails_when_exe_missing() {
        let runner = ProxyRunner::new(PathBuf::from("/nonexistent/rfc2217_server.py"));
        let slot = serviced_slot(47124);
        let mut inner = SlotInner {
            devnode: Some("/dev/null".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            runner.start(&slot, &mut inner, "127.0.0.1").await,
            Err(ProxyError::ExeMissing(_))
        ));
        assert!(!inner.running);
    }

    #[tokio::test]
    async fn immediately_exiting_child_is_a_spawn_failure() {
        // /bin/sh <exe=/dev/null> -p <port> <devnode> runs an empty script
        // and exits 0 straight away.
        let runner =
            ProxyRunner::new(PathBuf::from("/dev/null")).with_interpreter(PathBuf::from("/bin/sh"));
        let slot = serviced_slot(47125);
        let mut inner = SlotInner {
            devnode: Some("/dev/null".to_string()),
            ..Default::default()
        };
        let result = runner.start(&slot, &mut inner, "127.0.0.1").await;
        assert!(matches!(result, Err(ProxyError::ExitedEarly(_))));
        assert!(!inner.running);
        assert!(inner.pid.is_none());
    }

    #[tokio::test]
    async fn missing_devnode_trips_the_settle_probe() {
        let start = std::time::Instant::now();
        let err = wait_for_devnode("/dev/nonexistent-tty-xyz", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::DeviceNotReady(_)));
        assert!(start.elapsed() >= SETTLE_TIMEOUT);
    }

    #[tokio::test]
    async fn listen_poll_sees_a_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(wait_for_listen(port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn listen_poll_gives_up_without_listener() {
        // Bind-then-drop to find a port nothing listens on.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!wait_for_listen(port, Duration::from_millis(300)).await);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let runner = ProxyRunner::new(PathBuf::from("/bin/true"));
        let mut inner = SlotInner::default();
        runner.stop(&mut inner).await;
        runner.stop(&mut inner).await;
        assert!(!inner.running);
    }

    #[tokio::test]
    async fn stop_terminates_a_long_running_child() {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 60")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let mut inner = SlotInner {
            running: true,
            pid: Some(pid),
            child: Some(child),
            ..Default::default()
        };

        let runner = ProxyRunner::new(PathBuf::from("/bin/true"));
        runner.stop(&mut inner).await;
        assert!(!inner.running);
        assert!(inner.pid.is_none());
        // The process group is gone.
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());
    }
}
