//! Control-surface handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::activity::Category;
use crate::radio::{
    ApStartRequest, HttpRelayRequest, LeaseEvent, RadioResult, SetModeRequest, StaJoinRequest,
};
use crate::serial;
use crate::supervisor::hotplug::HotplugEvent;
use crate::supervisor::slot::SlotState;
use crate::supervisor::{host_ip, hostname, Supervisor};

use super::payload::{
    fail, ApiError, ApiJson, DevicesResponse, DiscoverDevice, EventsQuery, HumanRequest,
    InfoResponse, LogQuery, MonitorRequest, SlotRef, StartRequest, StopRequest,
};

/// How long the reset handler collects boot chatter from the device.
const RESET_READ_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_MONITOR_TIMEOUT: f64 = 10.0;
const DEFAULT_HUMAN_TIMEOUT: f64 = 300.0;

type Sup = State<Arc<Supervisor>>;

pub async fn devices(State(sup): Sup) -> Json<DevicesResponse> {
    Json(DevicesResponse {
        ok: true,
        slots: sup.project_all().await,
        host_ip: host_ip(),
        hostname: hostname(),
    })
}

pub async fn info(State(sup): Sup) -> Json<InfoResponse> {
    let slots = sup.project_all().await;
    Json(InfoResponse {
        ok: true,
        slots: slots.len(),
        present: slots.iter().filter(|s| s.present).count(),
        running: slots.iter().filter(|s| s.running).count(),
        flapping: slots.iter().filter(|s| s.flapping).count(),
        host_ip: host_ip(),
        hostname: hostname(),
        uptime: sup.uptime_secs(),
    })
}

pub async fn discover(State(sup): Sup) -> Json<Value> {
    let mut devices: Vec<DiscoverDevice> = sup
        .project_all()
        .await
        .into_iter()
        .filter(|s| s.running)
        .filter_map(|s| {
            Some(DiscoverDevice {
                url: s.url.clone()?,
                port: s.tcp_port?,
                tty: s.devnode,
                label: s.label,
                slot_key: s.slot_key,
            })
        })
        .collect();
    devices.sort_by_key(|d| d.port);
    Json(json!({ "ok": true, "devices": devices }))
}

pub async fn hotplug(
    State(sup): Sup,
    ApiJson(event): ApiJson<HotplugEvent>,
) -> Result<Json<Value>, ApiError> {
    let ack = sup
        .ingest_hotplug(event)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let mut body = serde_json::to_value(ack).unwrap_or_default();
    body["ok"] = json!(true);
    Ok(Json(body))
}

pub async fn start_slot(
    State(sup): Sup,
    ApiJson(req): ApiJson<StartRequest>,
) -> Result<Json<Value>, ApiError> {
    let slot = sup
        .slot(&req.slot_key)
        .ok_or_else(|| ApiError::unknown_slot(&req.slot_key))?;
    {
        let mut inner = slot.lock().await;
        if let Some(devnode) = req.devnode {
            inner.devnode = Some(devnode);
        }
        inner.present = true;
    }
    match sup.start_proxy(&slot).await {
        Ok(()) => Ok(Json(json!({ "ok": true }))),
        Err(e) => Ok(fail(e)),
    }
}

pub async fn stop_slot(
    State(sup): Sup,
    ApiJson(req): ApiJson<StopRequest>,
) -> Result<Json<Value>, ApiError> {
    let slot = sup
        .slot(&req.slot_key)
        .ok_or_else(|| ApiError::unknown_slot(&req.slot_key))?;
    sup.stop_proxy(&slot).await;
    Ok(Json(json!({ "ok": true })))
}

pub async fn serial_reset(
    State(sup): Sup,
    ApiJson(req): ApiJson<SlotRef>,
) -> Result<Json<Value>, ApiError> {
    let slot = sup
        .find_slot(&req.slot)
        .ok_or_else(|| ApiError::unknown_slot(&req.slot))?;

    let devnode = {
        let mut inner = slot.lock().await;
        let Some(devnode) = inner.devnode.clone() else {
            return Ok(fail("slot has no device node"));
        };
        // The proxy may hold the node exclusively; take it down first.
        sup.proxy.stop(&mut inner).await;
        inner.state = SlotState::Resetting;
        devnode
    };

    let result = serial::reset_pulse_and_read(std::path::Path::new(&devnode), RESET_READ_WINDOW).await;

    // Reset complete; bring the proxy back for serviced slots.
    {
        let mut inner = slot.lock().await;
        if inner.state == SlotState::Resetting {
            inner.state = SlotState::Idle;
        }
    }
    if slot.tcp_port.is_some() {
        let _ = sup.start_proxy(&slot).await;
    }

    match result {
        Ok(output) => {
            sup.activity
                .log(format!("{}: serial reset pulsed", slot.key), Category::Ok);
            Ok(Json(json!({ "ok": true, "output": output })))
        }
        Err(e) => {
            sup.activity
                .log(format!("{}: serial reset failed: {e}", slot.key), Category::Error);
            Ok(fail(e))
        }
    }
}

pub async fn serial_monitor(
    State(sup): Sup,
    ApiJson(req): ApiJson<MonitorRequest>,
) -> Result<Json<Value>, ApiError> {
    let slot = sup
        .find_slot(&req.slot)
        .ok_or_else(|| ApiError::unknown_slot(&req.slot))?;
    let Some(tcp_port) = slot.tcp_port else {
        return Ok(fail("slot has no reserved tcp port"));
    };
    {
        let mut inner = slot.lock().await;
        if !inner.running {
            return Ok(fail("proxy is not running"));
        }
        inner.state = SlotState::Monitoring;
    }

    let timeout = Duration::from_secs_f64(req.timeout.unwrap_or(DEFAULT_MONITOR_TIMEOUT).max(0.0));
    let result = serial::monitor_port(tcp_port, req.pattern.as_deref(), timeout).await;

    {
        let mut inner = slot.lock().await;
        if inner.state == SlotState::Monitoring {
            inner.state = SlotState::Idle;
        }
    }

    match result {
        Ok((output, matched)) => Ok(Json(json!({
            "ok": true,
            "output": output,
            "matched": matched,
        }))),
        Err(e) => Ok(fail(e)),
    }
}

pub async fn serial_recover(
    State(sup): Sup,
    ApiJson(req): ApiJson<SlotRef>,
) -> Result<Json<Value>, ApiError> {
    let slot = sup
        .find_slot(&req.slot)
        .ok_or_else(|| ApiError::unknown_slot(&req.slot))?;
    match sup.operator_recover(&slot).await {
        Ok(()) => Ok(Json(json!({ "ok": true }))),
        Err(e) => Ok(fail(e)),
    }
}

pub async fn serial_release(
    State(sup): Sup,
    ApiJson(req): ApiJson<SlotRef>,
) -> Result<Json<Value>, ApiError> {
    let slot = sup
        .find_slot(&req.slot)
        .ok_or_else(|| ApiError::unknown_slot(&req.slot))?;
    match sup.release_slot(&slot).await {
        Ok(()) => Ok(Json(json!({ "ok": true }))),
        Err(e) => Ok(fail(e)),
    }
}

pub async fn log_entries(
    State(sup): Sup,
    Query(query): Query<LogQuery>,
) -> Result<Json<Value>, ApiError> {
    let since = match query.since.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            OffsetDateTime::parse(raw, &Rfc3339)
                .map_err(|e| ApiError::bad_request(format!("bad since timestamp: {e}")))?,
        ),
    };
    let entries = sup.activity.since(since);
    Ok(Json(json!({ "ok": true, "entries": entries })))
}

pub async fn human_request(
    State(sup): Sup,
    ApiJson(req): ApiJson<HumanRequest>,
) -> Result<Json<Value>, ApiError> {
    let timeout = Duration::from_secs_f64(req.timeout.unwrap_or(DEFAULT_HUMAN_TIMEOUT).max(0.0));
    sup.activity
        .log(format!("operator needed: {}", req.message), Category::Step);
    let outcome = sup
        .human
        .request(&req.message, timeout)
        .await
        .map_err(|e| ApiError::conflict(e.to_string()))?;
    Ok(Json(json!({
        "ok": true,
        "confirmed": outcome.confirmed,
        "timeout": outcome.timed_out,
    })))
}

pub async fn human_status(State(sup): Sup) -> Json<Value> {
    let status = sup.human.status();
    let mut body = serde_json::to_value(status).unwrap_or_default();
    body["ok"] = json!(true);
    Json(body)
}

pub async fn human_done(State(sup): Sup) -> Json<Value> {
    if sup.human.done() {
        sup.activity.log("operator confirmed", Category::Ok);
        Json(json!({ "ok": true }))
    } else {
        fail("no pending interaction")
    }
}

pub async fn human_cancel(State(sup): Sup) -> Json<Value> {
    if sup.human.cancel() {
        sup.activity.log("operator cancelled", Category::Info);
        Json(json!({ "ok": true }))
    } else {
        fail("no pending interaction")
    }
}

/// Merge a collaborator result object into `{ok: true, ...}` by explicit
/// field copying; `ok` always wins over a collaborator field of the same
/// name. Errors become business failures and an error-category entry.
fn radio_reply(sup: &Supervisor, operation: &str, result: RadioResult) -> Json<Value> {
    match result {
        Ok(fields) => {
            let mut body = serde_json::Map::new();
            body.insert("ok".to_string(), json!(true));
            for (key, value) in fields {
                body.entry(key).or_insert(value);
            }
            Json(Value::Object(body))
        }
        Err(e) => {
            sup.activity
                .log(format!("radio {operation}: {e}"), Category::Error);
            fail(e)
        }
    }
}

pub async fn wifi_ping(State(sup): Sup) -> Json<Value> {
    let result = sup.radio.ping().await;
    radio_reply(&sup, "ping", result)
}

pub async fn wifi_get_mode(State(sup): Sup) -> Json<Value> {
    let result = sup.radio.get_mode().await;
    radio_reply(&sup, "mode", result)
}

pub async fn wifi_set_mode(State(sup): Sup, ApiJson(req): ApiJson<SetModeRequest>) -> Json<Value> {
    let result = sup.radio.set_mode(req).await;
    radio_reply(&sup, "mode", result)
}

pub async fn wifi_ap_start(State(sup): Sup, ApiJson(req): ApiJson<ApStartRequest>) -> Json<Value> {
    let result = sup.radio.ap_start(req).await;
    radio_reply(&sup, "ap_start", result)
}

pub async fn wifi_ap_stop(State(sup): Sup) -> Json<Value> {
    let result = sup.radio.ap_stop().await;
    radio_reply(&sup, "ap_stop", result)
}

pub async fn wifi_ap_status(State(sup): Sup) -> Json<Value> {
    let result = sup.radio.ap_status().await;
    radio_reply(&sup, "ap_status", result)
}

pub async fn wifi_sta_join(State(sup): Sup, ApiJson(req): ApiJson<StaJoinRequest>) -> Json<Value> {
    let result = sup.radio.sta_join(req).await;
    radio_reply(&sup, "sta_join", result)
}

pub async fn wifi_sta_leave(State(sup): Sup) -> Json<Value> {
    let result = sup.radio.sta_leave().await;
    radio_reply(&sup, "sta_leave", result)
}

pub async fn wifi_scan(State(sup): Sup) -> Json<Value> {
    let result = sup.radio.scan().await;
    radio_reply(&sup, "scan", result)
}

pub async fn wifi_http(State(sup): Sup, ApiJson(req): ApiJson<HttpRelayRequest>) -> Json<Value> {
    let result = sup.radio.http_relay(req).await;
    radio_reply(&sup, "http", result)
}

pub async fn wifi_events(State(sup): Sup, Query(query): Query<EventsQuery>) -> Json<Value> {
    let timeout = Duration::from_secs_f64(query.timeout.unwrap_or(0.0).max(0.0));
    match sup.radio.get_events(timeout).await {
        Ok(events) => Json(json!({ "ok": true, "events": events })),
        Err(e) => fail(e),
    }
}

pub async fn wifi_lease(State(sup): Sup, ApiJson(event): ApiJson<LeaseEvent>) -> Json<Value> {
    let result = sup.radio.handle_lease_event(event).await;
    radio_reply(&sup, "lease", result)
}

pub async fn not_found() -> ApiError {
    ApiError::not_found()
}
