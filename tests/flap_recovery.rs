//! Flap detection and recovery end-to-end, with a fake sysfs tree and
//! recorded GPIO. The with-GPIO path runs its real cooldown, so this suite
//! takes a little while by design.

mod common;

use std::time::Duration;

use common::{gpio_slot_cfg, slot_cfg, TestServer};
use serde_json::json;
use usbslotd::gpio::PinValue;

const GPIO_KEY: &str = "platform-fd500000.pcie-pci-0000:01:00.0-usb-0:1.1.2:1.0";

async fn storm(server: &TestServer, key: &str, events: usize) -> anyhow::Result<serde_json::Value> {
    let mut last = json!(null);
    for i in 0..events {
        let action = if i % 2 == 0 { "add" } else { "remove" };
        last = server
            .post(
                "/api/hotplug",
                json!({"action": action, "devnode": "/dev/ttyUSB9", "id_path": key}),
            )
            .await?;
    }
    Ok(last)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn five_events_do_not_trigger_recovery() -> anyhow::Result<()> {
    let server = TestServer::start(vec![slot_cfg(GPIO_KEY, Some("S1"), None)]).await?;

    let ack = storm(&server, GPIO_KEY, 5).await?;
    assert_eq!(ack["flapping"], false);
    let status = server.slot_status(GPIO_KEY).await?;
    assert_eq!(status["flapping"], false);
    assert_ne!(status["state"], "flapping");

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gpio_recovery_reaches_download_mode_and_releases() -> anyhow::Result<()> {
    let server = TestServer::start(vec![gpio_slot_cfg(GPIO_KEY, "S1", 5, 6)]).await?;

    let ack = storm(&server, GPIO_KEY, 6).await?;
    assert_eq!(ack["flapping"], true);

    // The kernel unbind happens right away, silencing the storm.
    let unbind_path = server.sysfs.path().join("unbind");
    let mut unbound = String::new();
    for _ in 0..40 {
        if let Ok(contents) = std::fs::read_to_string(&unbind_path) {
            unbound = contents;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(unbound, "1-1.1.2");

    // Cooldown, pin coercion, rebind, settle: allow the full sequence.
    let status = server
        .wait_for_state(GPIO_KEY, "download_mode", Duration::from_secs(20))
        .await?;
    assert_eq!(status["flapping"], false);
    assert_eq!(status["recovering"], false);
    assert_eq!(status["running"], false);

    let rebound = std::fs::read_to_string(server.sysfs.path().join("bind"))?;
    assert_eq!(rebound, "1-1.1.2");

    // Boot pin held low, enable pin pulsed low then high.
    let writes = server.gpio.writes();
    assert_eq!(
        writes,
        vec![
            (5, PinValue::Low),
            (6, PinValue::Low),
            (6, PinValue::High),
        ]
    );
    assert_eq!(server.gpio.states()[&5], PinValue::Low);

    // Release: boot pin floats back to input+pull-up, device reboots.
    let body = server.post("/api/serial/release", json!({"slot": "S1"})).await?;
    assert_eq!(body["ok"], true);
    let status = server.slot_status(GPIO_KEY).await?;
    assert_eq!(status["state"], "idle");
    assert_eq!(server.gpio.states()[&5], PinValue::HighZ);
    assert_eq!(server.gpio.states()[&6], PinValue::High);

    // A second release is a business failure.
    let body = server.post("/api/serial/release", json!({"slot": "S1"})).await?;
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().unwrap().contains("not in download mode"));

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_need_the_operator() -> anyhow::Result<()> {
    let key = "pci-0000:01:00.0-usb-0:1.4:1.0";
    let server = TestServer::start(vec![slot_cfg(key, Some("S2"), None)]).await?;

    // Two recovery cycles have already been burned.
    assert!(
        server.supervisor.slot(key).is_none(),
        "slot is created lazily on first event"
    );
    storm(&server, key, 1).await?;
    {
        let slot = server.supervisor.slot(key).unwrap();
        slot.lock().await.recover_retries = 2;
    }

    storm(&server, key, 5).await?;

    // The cap is hit without any cooldown sleep, so this settles fast.
    let mut last_error = String::new();
    for _ in 0..40 {
        let status = server.slot_status(key).await?;
        if let Some(err) = status["last_error"].as_str() {
            if err.contains("manual intervention") {
                last_error = err.to_string();
                assert_eq!(status["state"], "flapping");
                assert_eq!(status["recovering"], false);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(last_error.contains("needs manual intervention"), "got: {last_error}");

    // Further events do not restart recovery on their own.
    storm(&server, key, 2).await?;
    let status = server.slot_status(key).await?;
    assert_eq!(status["recovering"], false);

    // The operator override resets the retry budget and recovers again.
    let body = server.post("/api/serial/recover", json!({"slot": "S2"})).await?;
    assert_eq!(body["ok"], true);
    {
        let slot = server.supervisor.slot(key).unwrap();
        let inner = slot.lock().await;
        assert_eq!(inner.recover_retries, 0);
    }

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hotplug_is_ignored_while_recovering() -> anyhow::Result<()> {
    let key = "pci-0000:01:00.0-usb-0:1.7:1.0";
    let server = TestServer::start(vec![slot_cfg(key, None, None)]).await?;

    storm(&server, key, 1).await?;
    {
        let slot = server.supervisor.slot(key).unwrap();
        let mut inner = slot.lock().await;
        inner.recovering = true;
    }

    let ack = server
        .post(
            "/api/hotplug",
            json!({"action": "remove", "devnode": "/dev/ttyUSB9", "id_path": key}),
        )
        .await?;
    assert_eq!(ack["recovering"], true);

    let slot = server.supervisor.slot(key).unwrap();
    let inner = slot.lock().await;
    // The remove was dropped: still present.
    assert!(inner.present);
    drop(inner);

    server.shutdown().await;
    Ok(())
}
