//! Direct serial access around the proxy.
//!
//! Two operator conveniences need to touch the wire themselves: the reset
//! pulse (open the device node, wiggle DTR/RTS, read whatever the device
//! prints while rebooting) and the monitor (attach to the proxy's own TCP
//! port and read until a pattern shows up). The proxy speaks RFC2217, so the
//! monitor strips telnet IAC negotiation before looking at the text.

use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::libc;
use nix::sys::termios::{self, BaudRate, SetArg};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::debug;

const PULSE_DWELL: Duration = Duration::from_millis(50);
const READ_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("termios setup failed: {0}")]
    Termios(nix::errno::Errno),
    #[error("modem line ioctl failed: {0}")]
    ModemLines(nix::errno::Errno),
    #[error("background serial task failed")]
    TaskFailed,
}

nix::ioctl_write_ptr_bad!(tiocmbis, libc::TIOCMBIS, libc::c_int);
nix::ioctl_write_ptr_bad!(tiocmbic, libc::TIOCMBIC, libc::c_int);

fn set_modem_bits(fd: i32, bits: libc::c_int, assert: bool) -> Result<(), SerialError> {
    // SAFETY: fd is a valid open tty descriptor owned by the calling
    // function for the duration of the call, and the pointer is to a live
    // stack variable.
    let res = unsafe {
        if assert {
            tiocmbis(fd, &bits)
        } else {
            tiocmbic(fd, &bits)
        }
    };
    res.map(|_| ()).map_err(SerialError::ModemLines)
}

/// Pulse DTR then RTS on `devnode` and collect the device's boot chatter.
///
/// Asserts DTR for 50 ms, de-asserts, then the same for RTS; most
/// dev-board auto-reset circuits translate that into a clean reset. The
/// node is then read for `read_window`, and the decoded non-empty lines are
/// returned. The caller must have stopped the proxy first; the node is
/// opened exclusively by some RFC2217 servers.
pub async fn reset_pulse_and_read(
    devnode: &Path,
    read_window: Duration,
) -> Result<Vec<String>, SerialError> {
    let devnode = devnode.to_path_buf();
    tokio::task::spawn_blocking(move || reset_blocking(&devnode, read_window))
        .await
        .map_err(|_| SerialError::TaskFailed)?
}

fn reset_blocking(devnode: &Path, read_window: Duration) -> Result<Vec<String>, SerialError> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
        .open(devnode)
        .map_err(|source| SerialError::Open {
            path: devnode.display().to_string(),
            source,
        })?;

    let mut tio = termios::tcgetattr(&file).map_err(SerialError::Termios)?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetspeed(&mut tio, BaudRate::B115200).map_err(SerialError::Termios)?;
    termios::tcsetattr(&file, SetArg::TCSANOW, &tio).map_err(SerialError::Termios)?;

    let fd = file.as_raw_fd();
    debug!("pulsing DTR/RTS on {}", devnode.display());
    set_modem_bits(fd, libc::TIOCM_DTR, true)?;
    std::thread::sleep(PULSE_DWELL);
    set_modem_bits(fd, libc::TIOCM_DTR, false)?;
    set_modem_bits(fd, libc::TIOCM_RTS, true)?;
    std::thread::sleep(PULSE_DWELL);
    set_modem_bits(fd, libc::TIOCM_RTS, false)?;

    // Collect whatever the device prints while it reboots.
    let deadline = Instant::now() + read_window;
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    while Instant::now() < deadline {
        match file.read(&mut buf) {
            Ok(0) => std::thread::sleep(READ_POLL),
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(READ_POLL);
            }
            Err(_) => break,
        }
    }

    Ok(decode_lines(&collected))
}

/// Attach to the proxy's listen port and read lines until `pattern` shows up
/// in the accumulated text or `timeout` elapses. Returns the decoded lines
/// and whether the pattern matched.
pub async fn monitor_port(
    tcp_port: u16,
    pattern: Option<&str>,
    timeout: Duration,
) -> std::io::Result<(Vec<String>, bool)> {
    let mut stream = TcpStream::connect(("127.0.0.1", tcp_port)).await?;
    let deadline = tokio::time::Instant::now() + timeout;
    let mut raw = Vec::new();
    let mut matched = false;
    let mut buf = [0u8; 1024];

    while tokio::time::Instant::now() < deadline {
        let read = tokio::time::timeout_at(deadline, stream.read(&mut buf)).await;
        match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                raw.extend_from_slice(&buf[..n]);
                if let Some(pattern) = pattern {
                    let text = String::from_utf8_lossy(&strip_telnet_iac(&raw)).into_owned();
                    if text.contains(pattern) {
                        matched = true;
                        break;
                    }
                }
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        }
    }

    Ok((decode_lines(&strip_telnet_iac(&raw)), matched))
}

/// Remove telnet in-band negotiation (RFC 854/2217) from a byte stream.
///
/// `IAC IAC` is an escaped data byte; `IAC WILL/WONT/DO/DONT <opt>` is three
/// bytes; `IAC SB ... IAC SE` brackets subnegotiation; any other `IAC <cmd>`
/// is two bytes.
pub fn strip_telnet_iac(input: &[u8]) -> Vec<u8> {
    const IAC: u8 = 255;
    const SB: u8 = 250;
    const SE: u8 = 240;

    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let byte = input[i];
        if byte != IAC {
            out.push(byte);
            i += 1;
            continue;
        }
        match input.get(i + 1) {
            Some(&IAC) => {
                out.push(IAC);
                i += 2;
            }
            Some(&SB) => {
                // Skip to IAC SE, or the end if the stream was cut mid-block.
                let mut j = i + 2;
                while j + 1 < input.len() && !(input[j] == IAC && input[j + 1] == SE) {
                    j += 1;
                }
                i = if j + 1 < input.len() { j + 2 } else { input.len() };
            }
            Some(&(251..=254)) => i += 3,
            Some(_) => i += 2,
            None => i += 1,
        }
    }
    out
}

fn decode_lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn strips_option_negotiation() {
        // IAC WILL COM-PORT-OPTION, then plain text.
        let input = [255, 251, 44, b'h', b'i'];
        assert_eq!(strip_telnet_iac(&input), b"hi");
    }

    #[test]
    fn unescapes_doubled_iac() {
        let input = [b'a', 255, 255, b'b'];
        assert_eq!(strip_telnet_iac(&input), vec![b'a', 255, b'b']);
    }

    #[test]
    fn skips_subnegotiation_blocks() {
        let input = [b'x', 255, 250, 44, 1, 2, 3, 255, 240, b'y'];
        assert_eq!(strip_telnet_iac(&input), b"xy");
    }

    #[test]
    fn tolerates_truncated_sequences() {
        assert_eq!(strip_telnet_iac(&[b'a', 255]), b"a");
        assert_eq!(strip_telnet_iac(&[255, 250, 44, 1]), b"");
    }

    #[test]
    fn decode_lines_drops_blank_and_cr() {
        assert_eq!(
            decode_lines(b"boot ok\r\n\r\nready\n"),
            vec!["boot ok".to_string(), "ready".to_string()]
        );
    }

    #[tokio::test]
    async fn monitor_matches_pattern_early() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Telnet negotiation first, like a real RFC2217 server.
            stream.write_all(&[255, 251, 44]).await.unwrap();
            stream.write_all(b"booting\r\nREADY\r\n").await.unwrap();
            // Keep the connection open past the match to prove early return.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let started = Instant::now();
        let (lines, matched) = monitor_port(port, Some("READY"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(matched);
        assert!(lines.contains(&"booting".to_string()));
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }

    #[tokio::test]
    async fn monitor_times_out_without_pattern() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"nothing to see\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (lines, matched) = monitor_port(port, Some("READY"), Duration::from_millis(300))
            .await
            .unwrap();
        assert!(!matched);
        assert_eq!(lines, vec!["nothing to see".to_string()]);
        server.abort();
    }
}
