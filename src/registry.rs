use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Application close code sent when a reconnecting device replaces a
/// still-open socket holding the same device id.
pub const CLOSE_CODE_SUPERSEDED: u16 = 4001;
/// Application close code for connection attempts over the rate limit.
pub const CLOSE_CODE_RATE_LIMITED: u16 = 4429;

pub type ConnId = u64;

/// Command queued toward a connection's writer loop.
#[derive(Debug)]
pub enum Outbound {
    Frame(Message),
    /// Graceful close with an application close code and reason.
    Close(u16, &'static str),
    /// Hard termination, no close frame. Used by the liveness monitor.
    Terminate,
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: ConnId,
    pub tx: mpsc::Sender<Outbound>,
    /// Cleared on each liveness sweep, set again by a pong. A handle
    /// found cleared on the next sweep is terminated.
    pub alive: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(conn_id: ConnId, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            conn_id,
            tx,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Fire-and-forget send; "sent" means handed to the writer queue,
    /// never that the peer received it.
    pub fn send_frame(&self, frame: &Value) {
        let _ = self
            .tx
            .try_send(Outbound::Frame(Message::Text(frame.to_string())));
    }
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    device_id: Option<String>,
    tenant_id: Option<String>,
    is_admin: bool,
}

/// What an eviction removed, so the shared disconnect routine can mark
/// the device offline and notify admins exactly once.
#[derive(Debug)]
pub struct Evicted {
    pub device_id: Option<String>,
    pub tenant_id: Option<String>,
    pub was_admin: bool,
}

struct RegistryInner {
    connections: HashMap<ConnId, ConnectionEntry>,
    devices: HashMap<String, ConnId>,
}

/// In-memory map of live connections and their device/admin identity.
/// One instance per server; injected into the router and the liveness
/// monitor rather than living in a global.
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                connections: HashMap::new(),
                devices: HashMap::new(),
            }),
        }
    }

    /// Tracks a freshly accepted, still-anonymous connection.
    pub async fn attach(&self, handle: ConnectionHandle) {
        let mut inner = self.inner.lock().await;
        inner.connections.insert(
            handle.conn_id,
            ConnectionEntry {
                handle,
                device_id: None,
                tenant_id: None,
                is_admin: false,
            },
        );
    }

    /// Binds a device identity to a connection. Last writer wins: if
    /// another live connection already holds `device_id`, its claim is
    /// released and its handle returned so the caller can close it.
    pub async fn register_device(
        &self,
        conn_id: ConnId,
        device_id: &str,
        tenant_id: &str,
    ) -> Option<ConnectionHandle> {
        let mut inner = self.inner.lock().await;
        let superseded = match inner.devices.insert(device_id.to_owned(), conn_id) {
            Some(old_conn) if old_conn != conn_id => {
                // The old entry loses its device identity so its later
                // eviction does not emit a second offline notification.
                inner.connections.get_mut(&old_conn).map(|entry| {
                    entry.device_id = None;
                    entry.tenant_id = None;
                    entry.handle.clone()
                })
            }
            _ => None,
        };
        if let Some(entry) = inner.connections.get_mut(&conn_id) {
            entry.device_id = Some(device_id.to_owned());
            entry.tenant_id = Some(tenant_id.to_owned());
            entry.is_admin = false;
        }
        superseded
    }

    /// Flags a connection as an admin viewer for `tenant_id`. The tenant
    /// tag is recorded but admin fan-out itself is process-wide; every
    /// subscribed admin sees every tenant's presence events.
    ///
    /// A connection that had registered as a device gives up that
    /// identity: its device claim is released here so the id stops
    /// resolving to an admin socket and the claim cannot outlive the
    /// entry.
    pub async fn mark_admin(&self, conn_id: ConnId, tenant_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.connections.get_mut(&conn_id) else {
            return;
        };
        entry.is_admin = true;
        entry.tenant_id = Some(tenant_id.to_owned());
        let released = entry.device_id.take();
        if let Some(device_id) = released {
            // Only release the claim if this connection still holds it.
            if inner.devices.get(&device_id) == Some(&conn_id) {
                inner.devices.remove(&device_id);
            }
        }
    }

    pub async fn device_handle(&self, device_id: &str) -> Option<ConnectionHandle> {
        let inner = self.inner.lock().await;
        let conn_id = inner.devices.get(device_id)?;
        inner
            .connections
            .get(conn_id)
            .map(|entry| entry.handle.clone())
    }

    /// Removes the connection from all maps. Idempotent: a second call
    /// for the same id returns None, which keeps the race between the
    /// error and close paths from double-delivering the offline event.
    pub async fn evict(&self, conn_id: ConnId) -> Option<Evicted> {
        let mut inner = self.inner.lock().await;
        let entry = inner.connections.remove(&conn_id)?;
        if let Some(device_id) = entry.device_id.as_deref() {
            // Only release the device claim if this connection still holds it.
            if inner.devices.get(device_id) == Some(&conn_id) {
                inner.devices.remove(device_id);
            }
        }
        Some(Evicted {
            device_id: entry.device_id,
            tenant_id: entry.tenant_id,
            was_admin: entry.is_admin,
        })
    }

    /// Sends to every admin connection in the process, regardless of
    /// tenant. Closed queues are skipped; full queues drop the frame.
    pub async fn send_to_admins(&self, frame: &Value) {
        let text = frame.to_string();
        let inner = self.inner.lock().await;
        for entry in inner.connections.values() {
            if !entry.is_admin {
                continue;
            }
            if entry
                .handle
                .tx
                .try_send(Outbound::Frame(Message::Text(text.clone())))
                .is_err()
            {
                debug!(conn_id = entry.handle.conn_id, "admin fan-out skipped stale queue");
            }
        }
    }

    /// Sends to every registered device connection whose tenant matches
    /// exactly. Connections without a bound tenant never receive these.
    pub async fn send_to_tenant_devices(&self, tenant_id: &str, frame: &Value) {
        let text = frame.to_string();
        let inner = self.inner.lock().await;
        for entry in inner.connections.values() {
            if entry.is_admin || entry.device_id.is_none() {
                continue;
            }
            if entry.tenant_id.as_deref() != Some(tenant_id) {
                continue;
            }
            if entry
                .handle
                .tx
                .try_send(Outbound::Frame(Message::Text(text.clone())))
                .is_err()
            {
                debug!(conn_id = entry.handle.conn_id, "device fan-out skipped stale queue");
            }
        }
    }

    /// Snapshot of every live handle for the liveness sweep.
    pub async fn all_handles(&self) -> Vec<ConnectionHandle> {
        let inner = self.inner.lock().await;
        inner
            .connections
            .values()
            .map(|entry| entry.handle.clone())
            .collect()
    }

    #[cfg(test)]
    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    #[cfg(test)]
    pub async fn device_count(&self) -> usize {
        self.inner.lock().await.devices.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    use super::{ConnectionHandle, ConnectionRegistry, Outbound};

    fn handle(conn_id: u64) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        (ConnectionHandle::new(conn_id, tx), rx)
    }

    fn recv_text(rx: &mut mpsc::Receiver<Outbound>) -> Option<String> {
        match rx.try_recv() {
            Ok(Outbound::Frame(Message::Text(text))) => Some(text),
            _ => None,
        }
    }

    #[tokio::test]
    async fn at_most_one_connection_holds_a_device_id() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle(1);
        let (second, _rx2) = handle(2);
        registry.attach(first).await;
        registry.attach(second).await;

        assert!(registry.register_device(1, "d1", "t1").await.is_none());
        let superseded = registry
            .register_device(2, "d1", "t1")
            .await
            .expect("old handle returned");
        assert_eq!(superseded.conn_id, 1);

        assert_eq!(registry.device_count().await, 1);
        let current = registry.device_handle("d1").await.expect("handle");
        assert_eq!(current.conn_id, 2);
    }

    #[tokio::test]
    async fn evicting_a_superseded_connection_keeps_the_new_claim() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle(1);
        let (second, _rx2) = handle(2);
        registry.attach(first).await;
        registry.attach(second).await;
        registry.register_device(1, "d1", "t1").await;
        registry.register_device(2, "d1", "t1").await;

        let evicted = registry.evict(1).await.expect("evicted");
        assert_eq!(evicted.device_id, None);
        assert!(registry.device_handle("d1").await.is_some());
    }

    #[tokio::test]
    async fn evict_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = handle(7);
        registry.attach(conn).await;
        registry.register_device(7, "d7", "t1").await;

        let first = registry.evict(7).await;
        assert!(first.is_some());
        assert_eq!(first.unwrap().device_id.as_deref(), Some("d7"));
        assert!(registry.evict(7).await.is_none());
        assert_eq!(registry.device_count().await, 0);
    }

    #[tokio::test]
    async fn switching_a_device_connection_to_admin_releases_its_claim() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = handle(1);
        registry.attach(conn).await;
        registry.register_device(1, "d1", "t1").await;
        registry.mark_admin(1, "t1").await;

        // The id must stop resolving, so control relays for d1 report
        // the device as not connected instead of addressing an admin.
        assert!(registry.device_handle("d1").await.is_none());
        assert_eq!(registry.device_count().await, 0);

        // The eviction carries no device identity and leaves no claim.
        let evicted = registry.evict(1).await.expect("evicted");
        assert_eq!(evicted.device_id, None);
        assert!(evicted.was_admin);
        assert_eq!(registry.device_count().await, 0);
    }

    #[tokio::test]
    async fn admin_switch_does_not_release_a_superseded_claim() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle(1);
        let (second, _rx2) = handle(2);
        registry.attach(first).await;
        registry.attach(second).await;
        registry.register_device(1, "d1", "t1").await;
        registry.register_device(2, "d1", "t1").await;

        // Conn 1 lost the claim to conn 2 already; its admin switch
        // must not tear down conn 2's ownership.
        registry.mark_admin(1, "t1").await;
        let current = registry.device_handle("d1").await.expect("handle");
        assert_eq!(current.conn_id, 2);
    }

    #[tokio::test]
    async fn tenant_fanout_never_crosses_tenants() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = handle(1);
        let (b, mut rx_b) = handle(2);
        let (admin, mut rx_admin) = handle(3);
        registry.attach(a).await;
        registry.attach(b).await;
        registry.attach(admin).await;
        registry.register_device(1, "d1", "t1").await;
        registry.register_device(2, "d2", "t2").await;
        registry.mark_admin(3, "t1").await;

        registry
            .send_to_tenant_devices("t1", &json!({"type": "slide_update"}))
            .await;

        assert!(recv_text(&mut rx_a).is_some());
        assert!(recv_text(&mut rx_b).is_none());
        assert!(recv_text(&mut rx_admin).is_none());
    }

    #[tokio::test]
    async fn admin_fanout_reaches_every_admin_and_no_device() {
        let registry = ConnectionRegistry::new();
        let (device, mut rx_device) = handle(1);
        let (admin_t1, mut rx_t1) = handle(2);
        let (admin_t2, mut rx_t2) = handle(3);
        registry.attach(device).await;
        registry.attach(admin_t1).await;
        registry.attach(admin_t2).await;
        registry.register_device(1, "d1", "t1").await;
        registry.mark_admin(2, "t1").await;
        registry.mark_admin(3, "t2").await;

        registry
            .send_to_admins(&json!({"type": "device_connected", "deviceId": "d1"}))
            .await;

        assert!(recv_text(&mut rx_device).is_none());
        assert!(recv_text(&mut rx_t1).is_some());
        assert!(recv_text(&mut rx_t2).is_some());
    }
}
