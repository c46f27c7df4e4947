//! usbslotd

mod cli;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use usbslotd::gpio::{GpioControl, NoopGpio};
use usbslotd::radio::UnavailableRadio;
use usbslotd::supervisor::proxy::ProxyRunner;
use usbslotd::supervisor::recovery::UsbRebinder;
use usbslotd::supervisor::{Supervisor, SupervisorOptions};
use usbslotd::{config, server, udplog};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    // Log messages from the log crate as well.
    tracing_log::LogTracer::init()?;

    let supervisor = Supervisor::new(SupervisorOptions {
        slots: config::load_slots(&args.slots),
        proxy: ProxyRunner::new(args.proxy_exe.clone()),
        usb: UsbRebinder::new(args.sysfs_usb_driver.clone()),
        gpio: open_gpio(),
        radio: Arc::new(UnavailableRadio),
    });

    supervisor.boot_scan().await;

    let cancel = CancellationToken::new();
    let mut udp_sink = None;
    if args.udp_log_port != 0 {
        let socket = tokio::net::UdpSocket::bind(("0.0.0.0", args.udp_log_port))
            .await
            .context("Failed to bind UDP log sink")?;
        udp_sink = Some(tokio::spawn(udplog::run_udp_sink(
            socket,
            supervisor.udp_ring.clone(),
            supervisor.activity.clone(),
            cancel.clone(),
        )));
    }

    let bind: SocketAddr = ([0, 0, 0, 0], args.http_port).into();
    let server = server::start(supervisor.clone(), bind)
        .await
        .context("Failed to start control surface")?;

    info!("We're up!");

    wait_for_shutdown_signal().await?;
    info!("shutting down");

    server.shutdown().await;
    cancel.cancel();
    if let Some(sink) = udp_sink {
        let _ = sink.await;
    }
    supervisor.shutdown_all().await;

    Ok(())
}

fn open_gpio() -> Arc<dyn GpioControl> {
    #[cfg(target_os = "linux")]
    match usbslotd::gpio::RppalGpio::open() {
        Ok(gpio) => return Arc::new(gpio),
        Err(e) => warn!("No usable GPIO chip, board-control pins disabled: {e}"),
    }
    Arc::new(NoopGpio::new())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}
