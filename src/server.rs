use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::protocol::{
    ack_frame, admin_control_frame, admin_subscribed_frame, broadcast_message_frame,
    connected_frame, content_update_frame, device_config_changed_frame, device_connected_frame,
    device_disconnected_frame, device_status_changed_frame, error_frame, frame_type,
    heartbeat_response_frame, lifecycle_command_frame, parse_frame_text, required_str,
    slide_update_frame,
};
use crate::rate_limit::ConnectionRateLimiter;
use crate::registry::{
    ConnectionHandle, ConnectionRegistry, Outbound, CLOSE_CODE_RATE_LIMITED,
    CLOSE_CODE_SUPERSEDED,
};
use crate::store::{DeviceInfo, DeviceStore};

/// Standalone presence and control gateway for display/kiosk devices.
/// One registry instance per server; admin dashboards and devices share
/// the same WebSocket endpoint and are told apart by their first
/// identity-bearing message.
pub struct DisplayGateway {
    server: ServerConfig,
    store: Arc<dyn DeviceStore>,
}

struct ServerState {
    registry: ConnectionRegistry,
    store: Arc<dyn DeviceStore>,
    limiter: ConnectionRateLimiter,
    next_conn_id: AtomicU64,
    queue_capacity: usize,
}

impl DisplayGateway {
    pub fn new(server: ServerConfig, store: Arc<dyn DeviceStore>) -> Self {
        Self { server, store }
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.server.bind)
            .await
            .with_context(|| format!("failed binding display gateway on {}", self.server.bind))?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!("display gateway listening on ws://{bound_addr}");

        let state = Arc::new(ServerState {
            registry: ConnectionRegistry::new(),
            store: self.store.clone(),
            limiter: ConnectionRateLimiter::new(
                Duration::from_millis(self.server.rate_limit_window_ms),
                self.server.rate_limit_max_attempts,
            ),
            next_conn_id: AtomicU64::new(0),
            queue_capacity: self.server.outbound_queue_capacity.max(8),
        });
        let liveness_task = spawn_liveness_task(
            state.clone(),
            Duration::from_millis(self.server.ping_interval_ms.max(100)),
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let state = state.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, remote_addr, state).await {
                                    warn!("display gateway connection failed: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("display gateway accept failed: {err}");
                        }
                    }
                }
            }
        }

        liveness_task.abort();
        let _ = liveness_task.await;
        Ok(())
    }
}

/// Two-tick liveness check: every interval each connection either has
/// answered the previous ping (flag set) and gets a fresh ping, or it
/// has not and is terminated through the shared disconnect routine.
fn spawn_liveness_task(state: Arc<ServerState>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so fresh connections get
        // a full interval before their first ping.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for handle in state.registry.all_handles().await {
                if handle.alive.swap(false, Ordering::AcqRel) {
                    let _ = handle.tx.try_send(Outbound::Frame(Message::Ping(Vec::new())));
                } else {
                    debug!(conn_id = handle.conn_id, "terminating silent connection");
                    let _ = handle.tx.try_send(Outbound::Terminate);
                    disconnect(&state, handle.conn_id).await;
                }
            }
        }
    })
}

/// Shared cleanup for every way a connection can end: clean close, read
/// error, liveness termination. Eviction is idempotent, so the offline
/// notification goes out at most once per connection.
async fn disconnect(state: &ServerState, conn_id: u64) {
    let Some(evicted) = state.registry.evict(conn_id).await else {
        return;
    };
    if evicted.was_admin {
        debug!(conn_id, "admin connection closed");
        return;
    }
    if let Some(device_id) = evicted.device_id {
        if let Err(err) = state.store.mark_offline(&device_id).await {
            warn!("failed marking device {device_id} offline: {err:#}");
        }
        state
            .registry
            .send_to_admins(&device_disconnected_frame(
                &device_id,
                evicted.tenant_id.as_deref(),
            ))
            .await;
        info!(device_id, "device disconnected");
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    remote_addr: std::net::SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let ws = accept_async(stream)
        .await
        .with_context(|| format!("websocket upgrade failed for {remote_addr}"))?;
    let (mut write, mut read) = ws.split();

    // Rejection happens before registry admission and before the
    // welcome frame; a limited attempt never becomes a tracked
    // connection.
    if !state.limiter.admit(remote_addr.ip()).await {
        debug!("rate limited connection attempt from {remote_addr}");
        let _ = write
            .send(Message::Close(Some(close_frame(
                CLOSE_CODE_RATE_LIMITED,
                "rate limit exceeded",
            ))))
            .await;
        return Ok(());
    }

    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(state.queue_capacity);
    let handle = ConnectionHandle::new(conn_id, out_tx);
    let alive = handle.alive.clone();
    state.registry.attach(handle.clone()).await;

    if let Err(err) = write
        .send(Message::Text(connected_frame().to_string()))
        .await
    {
        disconnect(&state, conn_id).await;
        return Err(err).context("failed sending welcome frame");
    }
    debug!(conn_id, "connection open from {remote_addr}");

    loop {
        tokio::select! {
            command = out_rx.recv() => match command {
                None => break,
                Some(Outbound::Frame(message)) => {
                    if write.send(message).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close(code, reason)) => {
                    let _ = write
                        .send(Message::Close(Some(close_frame(code, reason))))
                        .await;
                    break;
                }
                Some(Outbound::Terminate) => break,
            },
            inbound = read.next() => {
                let Some(inbound) = inbound else { break };
                let inbound = match inbound {
                    Ok(message) => message,
                    Err(err) => {
                        debug!(conn_id, "inbound error: {err}");
                        break;
                    }
                };
                match inbound {
                    Message::Text(text) => route_frame(&state, &handle, &text).await,
                    Message::Ping(payload) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Message::Pong(_) => {
                        alive.store(true, Ordering::Release);
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) | Message::Frame(_) => {}
                }
            }
        }
    }

    disconnect(&state, conn_id).await;
    Ok(())
}

/// Dispatches one inbound frame. Malformed input gets an `error` reply
/// and the connection stays open; an unknown `type` is logged and
/// dropped without a reply.
async fn route_frame(state: &Arc<ServerState>, conn: &ConnectionHandle, text: &str) {
    let frame = match parse_frame_text(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(conn_id = conn.conn_id, "malformed frame: {err}");
            conn.send_frame(&error_frame("Invalid message format"));
            return;
        }
    };

    match frame_type(&frame) {
        "device_register" => handle_device_register(state, conn, &frame).await,
        "device_status_update" => handle_device_status_update(state, conn, &frame).await,
        "device_config_update" => handle_device_config_update(state, conn, &frame).await,
        "device_heartbeat" => handle_device_heartbeat(state, conn, &frame).await,
        "admin_subscribe" => handle_admin_subscribe(state, conn, &frame).await,
        "admin_device_control" => handle_admin_device_control(state, conn, &frame).await,
        "admin_slide_update" => handle_admin_slide_update(state, conn, &frame).await,
        "admin_content_update" => handle_admin_content_update(state, conn, &frame).await,
        "admin_device_restart" => handle_admin_lifecycle(state, conn, &frame, "restart").await,
        "admin_device_stop" => handle_admin_lifecycle(state, conn, &frame, "stop").await,
        "admin_device_start" => handle_admin_lifecycle(state, conn, &frame, "start").await,
        "admin_broadcast_message" => handle_admin_broadcast_message(state, conn, &frame).await,
        other => {
            debug!(conn_id = conn.conn_id, "ignoring unknown message type {other:?}");
        }
    }
}

fn reply_missing(conn: &ConnectionHandle, field: &str) {
    conn.send_frame(&error_frame(&format!("{field} is required")));
}

async fn handle_device_register(
    state: &Arc<ServerState>,
    conn: &ConnectionHandle,
    frame: &Value,
) {
    let Some(device_id) = required_str(frame, "deviceId") else {
        return reply_missing(conn, "deviceId");
    };
    let Some(tenant_id) = required_str(frame, "tenantId") else {
        return reply_missing(conn, "tenantId");
    };
    let Some(device_info) = frame.get("deviceInfo") else {
        return reply_missing(conn, "deviceInfo");
    };
    let info: DeviceInfo = serde_json::from_value(device_info.clone()).unwrap_or_default();

    let outcome = match state.store.register(device_id, tenant_id, info).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!("device register persist failed for {device_id}: {err:#}");
            conn.send_frame(&error_frame("Failed to register device"));
            return;
        }
    };

    // A reconnect silently replaces any prior socket holding this id;
    // the replaced socket is closed with the superseded code instead of
    // being left dangling.
    if let Some(superseded) = state
        .registry
        .register_device(conn.conn_id, device_id, tenant_id)
        .await
    {
        debug!(device_id, old_conn = superseded.conn_id, "superseding stale socket");
        let _ = superseded
            .tx
            .try_send(Outbound::Close(CLOSE_CODE_SUPERSEDED, "superseded"));
    }

    conn.send_frame(&ack_frame(
        "device_registered",
        json!({"deviceId": device_id}),
    ));
    state
        .registry
        .send_to_admins(&device_connected_frame(&outcome.record))
        .await;
    info!(
        device_id,
        tenant_id,
        created = outcome.created,
        "device registered"
    );
}

async fn handle_device_status_update(
    state: &Arc<ServerState>,
    conn: &ConnectionHandle,
    frame: &Value,
) {
    let Some(device_id) = required_str(frame, "deviceId") else {
        return reply_missing(conn, "deviceId");
    };
    let Some(status) = required_str(frame, "status") else {
        return reply_missing(conn, "status");
    };
    let network_status = required_str(frame, "networkStatus");

    match state
        .store
        .update_status(device_id, status, network_status)
        .await
    {
        Ok(Some(record)) => {
            conn.send_frame(&ack_frame("status_updated", json!({"deviceId": device_id})));
            state
                .registry
                .send_to_admins(&device_status_changed_frame(
                    device_id,
                    &record.status,
                    &record.network_status,
                ))
                .await;
        }
        Ok(None) => {
            conn.send_frame(&error_frame("Device not registered"));
        }
        Err(err) => {
            warn!("status update persist failed for {device_id}: {err:#}");
            conn.send_frame(&error_frame("Failed to update device status"));
        }
    }
}

async fn handle_device_config_update(
    state: &Arc<ServerState>,
    conn: &ConnectionHandle,
    frame: &Value,
) {
    let Some(device_id) = required_str(frame, "deviceId") else {
        return reply_missing(conn, "deviceId");
    };
    let Some(config) = frame.get("config") else {
        return reply_missing(conn, "config");
    };

    match state.store.replace_config(device_id, config.clone()).await {
        Ok(Some(record)) => {
            conn.send_frame(&ack_frame("config_updated", json!({"deviceId": device_id})));
            state
                .registry
                .send_to_admins(&device_config_changed_frame(device_id, &record.config))
                .await;
        }
        Ok(None) => {
            conn.send_frame(&error_frame("Device not registered"));
        }
        Err(err) => {
            warn!("config update persist failed for {device_id}: {err:#}");
            conn.send_frame(&error_frame("Failed to update device config"));
        }
    }
}

async fn handle_device_heartbeat(
    state: &Arc<ServerState>,
    conn: &ConnectionHandle,
    frame: &Value,
) {
    let Some(device_id) = required_str(frame, "deviceId") else {
        return reply_missing(conn, "deviceId");
    };
    match state.store.touch_heartbeat(device_id).await {
        Ok(Some(_)) => conn.send_frame(&heartbeat_response_frame()),
        Ok(None) => conn.send_frame(&error_frame("Device not registered")),
        Err(err) => {
            warn!("heartbeat persist failed for {device_id}: {err:#}");
            conn.send_frame(&error_frame("Failed to record heartbeat"));
        }
    }
}

async fn handle_admin_subscribe(
    state: &Arc<ServerState>,
    conn: &ConnectionHandle,
    frame: &Value,
) {
    let Some(tenant_id) = required_str(frame, "tenantId") else {
        return reply_missing(conn, "tenantId");
    };
    let devices = match state.store.list_for_tenant(tenant_id).await {
        Ok(devices) => devices,
        Err(err) => {
            warn!("device listing failed for tenant {tenant_id}: {err:#}");
            conn.send_frame(&error_frame("Failed to load device list"));
            return;
        }
    };
    state.registry.mark_admin(conn.conn_id, tenant_id).await;
    conn.send_frame(&admin_subscribed_frame(tenant_id, &devices));
    info!(tenant_id, conn_id = conn.conn_id, "admin subscribed");
}

async fn handle_admin_device_control(
    state: &Arc<ServerState>,
    conn: &ConnectionHandle,
    frame: &Value,
) {
    let Some(device_id) = required_str(frame, "deviceId") else {
        return reply_missing(conn, "deviceId");
    };
    let Some(action) = required_str(frame, "action") else {
        return reply_missing(conn, "action");
    };
    let Some(target) = state.registry.device_handle(device_id).await else {
        // No offline command queue: an unreachable target is an
        // immediate first-class error, never a deferred delivery.
        conn.send_frame(&error_frame("Device not connected"));
        return;
    };
    target.send_frame(&admin_control_frame(action, frame.get("data")));
    conn.send_frame(&ack_frame(
        "control_sent",
        json!({"deviceId": device_id, "action": action}),
    ));
}

async fn handle_admin_slide_update(
    state: &Arc<ServerState>,
    conn: &ConnectionHandle,
    frame: &Value,
) {
    let Some(tenant_id) = required_str(frame, "tenantId") else {
        return reply_missing(conn, "tenantId");
    };
    let Some(slide_id) = required_str(frame, "slideId") else {
        return reply_missing(conn, "slideId");
    };
    let Some(action) = required_str(frame, "action") else {
        return reply_missing(conn, "action");
    };
    state
        .registry
        .send_to_tenant_devices(tenant_id, &slide_update_frame(slide_id, action))
        .await;
    conn.send_frame(&ack_frame(
        "slide_update_sent",
        json!({"tenantId": tenant_id, "slideId": slide_id}),
    ));
}

async fn handle_admin_content_update(
    state: &Arc<ServerState>,
    conn: &ConnectionHandle,
    frame: &Value,
) {
    let Some(tenant_id) = required_str(frame, "tenantId") else {
        return reply_missing(conn, "tenantId");
    };
    let Some(content) = frame.get("content") else {
        return reply_missing(conn, "content");
    };
    state
        .registry
        .send_to_tenant_devices(tenant_id, &content_update_frame(content))
        .await;
    conn.send_frame(&ack_frame(
        "content_update_sent",
        json!({"tenantId": tenant_id}),
    ));
}

async fn handle_admin_lifecycle(
    state: &Arc<ServerState>,
    conn: &ConnectionHandle,
    frame: &Value,
    verb: &str,
) {
    let Some(device_id) = required_str(frame, "deviceId") else {
        return reply_missing(conn, "deviceId");
    };
    let Some(target) = state.registry.device_handle(device_id).await else {
        conn.send_frame(&error_frame("Device not connected"));
        return;
    };
    target.send_frame(&lifecycle_command_frame(&format!("{verb}_device")));
    conn.send_frame(&ack_frame(
        &format!("{verb}_sent"),
        json!({"deviceId": device_id}),
    ));
}

async fn handle_admin_broadcast_message(
    state: &Arc<ServerState>,
    conn: &ConnectionHandle,
    frame: &Value,
) {
    let Some(tenant_id) = required_str(frame, "tenantId") else {
        return reply_missing(conn, "tenantId");
    };
    let Some(message) = required_str(frame, "message") else {
        return reply_missing(conn, "message");
    };
    let message_type = required_str(frame, "messageType");
    state
        .registry
        .send_to_tenant_devices(tenant_id, &broadcast_message_frame(message, message_type))
        .await;
    conn.send_frame(&ack_frame(
        "broadcast_sent",
        json!({"tenantId": tenant_id}),
    ));
}

fn close_frame(code: u16, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }
}
