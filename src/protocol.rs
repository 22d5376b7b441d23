use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::store::DeviceRecord;

/// Parses one inbound text frame. Anything that is not a JSON object
/// carrying a string `type` field is a protocol violation answered with
/// an `error` frame; an unrecognized `type` value is the caller's
/// problem (logged and ignored, never an error reply).
pub fn parse_frame_text(text: &str) -> Result<Value> {
    let frame: Value = serde_json::from_str(text).context("frame is not valid JSON")?;
    if !frame.is_object() {
        anyhow::bail!("frame is not a JSON object");
    }
    if frame.get("type").and_then(Value::as_str).is_none() {
        anyhow::bail!("frame has no string `type` field");
    }
    Ok(frame)
}

pub fn frame_type(frame: &Value) -> &str {
    frame.get("type").and_then(Value::as_str).unwrap_or_default()
}

/// Non-empty string field accessor; whitespace-only values count as
/// missing so a handler's presence check rejects them.
pub fn required_str<'a>(frame: &'a Value, field: &str) -> Option<&'a str> {
    frame
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub fn connected_frame() -> Value {
    json!({
        "type": "connected",
        "server": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": now_ms(),
    })
}

pub fn error_frame(message: &str) -> Value {
    json!({
        "type": "error",
        "message": message,
    })
}

pub fn ack_frame(kind: &str, fields: Value) -> Value {
    let mut frame = json!({
        "type": kind,
        "success": true,
    });
    if let (Some(map), Some(extra)) = (frame.as_object_mut(), fields.as_object()) {
        for (key, value) in extra {
            map.insert(key.clone(), value.clone());
        }
    }
    frame
}

pub fn heartbeat_response_frame() -> Value {
    json!({
        "type": "heartbeat_response",
        "timestamp": now_ms(),
    })
}

pub fn admin_subscribed_frame(tenant_id: &str, devices: &[DeviceRecord]) -> Value {
    let devices: Vec<Value> = devices.iter().map(device_summary).collect();
    json!({
        "type": "admin_subscribed",
        "tenantId": tenant_id,
        "devices": devices,
    })
}

/// Admin-facing device snapshot, also served by the `devices list` CLI
/// for clients that poll instead of holding a socket open.
pub fn device_summary(record: &DeviceRecord) -> Value {
    json!({
        "id": record.id,
        "name": record.name,
        "status": record.status,
        "lastSeen": record.last_seen_ms,
        "platform": record.platform,
        "model": record.model,
        "config": record.config,
    })
}

pub fn device_connected_frame(record: &DeviceRecord) -> Value {
    json!({
        "type": "device_connected",
        "deviceId": record.id,
        "tenantId": record.tenant_id,
        "name": record.name,
        "status": record.status,
        "timestamp": now_ms(),
    })
}

pub fn device_disconnected_frame(device_id: &str, tenant_id: Option<&str>) -> Value {
    json!({
        "type": "device_disconnected",
        "deviceId": device_id,
        "tenantId": tenant_id,
        "timestamp": now_ms(),
    })
}

pub fn device_status_changed_frame(device_id: &str, status: &str, network_status: &str) -> Value {
    json!({
        "type": "device_status_changed",
        "deviceId": device_id,
        "status": status,
        "networkStatus": network_status,
        "timestamp": now_ms(),
    })
}

pub fn device_config_changed_frame(device_id: &str, config: &Value) -> Value {
    json!({
        "type": "device_config_changed",
        "deviceId": device_id,
        "config": config,
        "timestamp": now_ms(),
    })
}

pub fn admin_control_frame(action: &str, data: Option<&Value>) -> Value {
    json!({
        "type": "admin_control",
        "action": action,
        "data": data.cloned().unwrap_or(Value::Null),
        "timestamp": now_ms(),
    })
}

pub fn slide_update_frame(slide_id: &str, action: &str) -> Value {
    json!({
        "type": "slide_update",
        "slideId": slide_id,
        "action": action,
        "timestamp": now_ms(),
    })
}

pub fn content_update_frame(content: &Value) -> Value {
    json!({
        "type": "content_update",
        "content": content,
        "timestamp": now_ms(),
    })
}

pub fn lifecycle_command_frame(command: &str) -> Value {
    json!({
        "type": command,
        "timestamp": now_ms(),
    })
}

pub fn broadcast_message_frame(message: &str, message_type: Option<&str>) -> Value {
    json!({
        "type": "broadcast_message",
        "message": message,
        "messageType": message_type.unwrap_or("info"),
        "timestamp": now_ms(),
    })
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
