//! This module implements the CLI interface.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Slot configuration file.
    #[arg(long, env = "USBSLOTD_SLOTS", default_value = "/etc/rfc2217/slots.json")]
    pub slots: PathBuf,

    /// The external RFC2217 server launched per slot (run with python3).
    #[arg(long, default_value = "/usr/local/bin/rfc2217_server.py")]
    pub proxy_exe: PathBuf,

    /// Control surface port, bound on all interfaces.
    #[arg(long, default_value_t = 8080)]
    pub http_port: u16,

    /// UDP port absorbing free-form device logs. 0 disables the sink.
    #[arg(long, default_value_t = 5555)]
    pub udp_log_port: u16,

    /// The usb driver's sysfs directory with the unbind/bind knobs.
    #[arg(long, default_value = "/sys/bus/usb/drivers/usb")]
    pub sysfs_usb_driver: PathBuf,
}
