//! UDP log sink.
//!
//! Devices under test often spray free-form text logs over UDP. The sink
//! absorbs datagrams, keeps the newest lines in a bounded ring and mirrors
//! them into the activity log with the sender address prefixed, so a single
//! `/api/log` poll shows supervisor and device output interleaved.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::activity::{ActivityLog, Category};

const RING_CAPACITY: usize = 2000;
const MAX_DATAGRAM: usize = 4096;

/// Newest-last ring of raw device log lines.
#[derive(Debug, Default)]
pub struct UdpRing {
    lines: Mutex<VecDeque<String>>,
}

impl UdpRing {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == RING_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }
}

/// Receive datagrams until `cancel` fires.
///
/// Datagrams are decoded as UTF-8 with replacement and split on newlines;
/// empty lines are dropped.
pub async fn run_udp_sink(
    socket: UdpSocket,
    ring: Arc<UdpRing>,
    activity: Arc<ActivityLog>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    info!(
        "UDP log sink listening on {}",
        socket.local_addr().map_or_else(|_| "?".to_string(), |a| a.to_string())
    );
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let Ok((len, peer)) = received else { continue };
                let text = String::from_utf8_lossy(&buf[..len]);
                for line in text.lines() {
                    let line = line.trim_end_matches('\r');
                    if line.is_empty() {
                        continue;
                    }
                    ring.push(line.to_string());
                    activity.log(format!("{}: {line}", peer.ip()), Category::Info);
                }
            }
        }
    }
    debug!("UDP log sink stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datagrams_land_in_ring_and_activity() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let ring = Arc::new(UdpRing::new());
        let activity = Arc::new(ActivityLog::new());
        let cancel = CancellationToken::new();

        let sink = tokio::spawn(run_udp_sink(
            socket,
            ring.clone(),
            activity.clone(),
            cancel.clone(),
        ));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"boot ok\r\n\nsecond line", addr).await.unwrap();

        let mut lines = Vec::new();
        for _ in 0..100 {
            lines = ring.snapshot();
            if lines.len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(lines, vec!["boot ok".to_string(), "second line".to_string()]);

        let mirrored = activity.since(None);
        assert_eq!(mirrored.len(), 2);
        assert!(mirrored[0].message.starts_with("127.0.0.1: boot ok"));

        cancel.cancel();
        sink.await.unwrap();
    }

    #[test]
    fn ring_is_bounded() {
        let ring = UdpRing::new();
        for i in 0..(RING_CAPACITY + 5) {
            ring.push(format!("{i}"));
        }
        let lines = ring.snapshot();
        assert_eq!(lines.len(), RING_CAPACITY);
        assert_eq!(lines[0], "5");
    }
}
