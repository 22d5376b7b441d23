use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[cfg(feature = "sqlite-store")]
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
#[cfg(feature = "sqlite-store")]
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
#[cfg(feature = "sqlite-store")]
use tokio::sync::Mutex;
use tokio::sync::RwLock;

use crate::protocol::now_ms;

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";
pub const NETWORK_CONNECTED: &str = "connected";

/// Durable per-device record. Identity fields come from the register
/// payload; runtime fields move forward on every status/heartbeat
/// update using wall-clock now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub build_number: Option<String>,
    #[serde(default)]
    pub installation_id: Option<String>,
    pub status: String,
    pub last_seen_ms: u64,
    pub network_status: String,
    /// Opaque display configuration (slide duration, theme, custom
    /// settings). Replaced wholesale, never field-patched here.
    #[serde(default)]
    pub config: Value,
}

/// Identity fields accepted from a `device_register` payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub build_number: Option<String>,
    #[serde(default)]
    pub installation_id: Option<String>,
}

#[derive(Debug)]
pub struct RegisterOutcome {
    pub record: DeviceRecord,
    /// True when the register created the record, false when it updated
    /// an existing one in place.
    pub created: bool,
}

/// Store seam consumed by the message router. The router only needs
/// upsert-by-id, update-by-id, and find-many-by-tenant.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Upsert for `device_register`: create-if-absent, else update the
    /// identity fields in place. Either path forces status online and
    /// advances `last_seen_ms`.
    async fn register(
        &self,
        device_id: &str,
        tenant_id: &str,
        info: DeviceInfo,
    ) -> Result<RegisterOutcome>;

    /// Returns None when the device was never registered.
    async fn update_status(
        &self,
        device_id: &str,
        status: &str,
        network_status: Option<&str>,
    ) -> Result<Option<DeviceRecord>>;

    async fn replace_config(&self, device_id: &str, config: Value)
        -> Result<Option<DeviceRecord>>;

    async fn touch_heartbeat(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    /// Disconnect path; unknown ids are ignored.
    async fn mark_offline(&self, device_id: &str) -> Result<()>;

    async fn list_for_tenant(&self, tenant_id: &str) -> Result<Vec<DeviceRecord>>;
}

pub struct FileDeviceStore {
    backend: StoreBackend,
}

enum StoreBackend {
    Json {
        path: PathBuf,
        devices: RwLock<HashMap<String, DeviceRecord>>,
    },
    #[cfg(feature = "sqlite-store")]
    Sqlite { path: PathBuf, lock: Mutex<()> },
}

impl FileDeviceStore {
    pub async fn open(path: PathBuf) -> Result<Self> {
        if is_sqlite_path(&path) {
            #[cfg(feature = "sqlite-store")]
            {
                init_sqlite(path.clone()).await?;
                return Ok(Self {
                    backend: StoreBackend::Sqlite {
                        path,
                        lock: Mutex::new(()),
                    },
                });
            }

            #[cfg(not(feature = "sqlite-store"))]
            {
                anyhow::bail!(
                    "sqlite device store requested for {} but binary was built without \
                     `sqlite-store` feature",
                    path.display()
                );
            }
        }

        let devices = if path.exists() {
            let text = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            serde_json::from_str::<HashMap<String, DeviceRecord>>(&text).unwrap_or_default()
        } else {
            HashMap::new()
        };

        Ok(Self {
            backend: StoreBackend::Json {
                path,
                devices: RwLock::new(devices),
            },
        })
    }

    async fn mutate_json<F>(&self, device_id: &str, apply: F) -> Result<Option<DeviceRecord>>
    where
        F: FnOnce(&mut DeviceRecord),
    {
        match &self.backend {
            StoreBackend::Json { path, devices } => {
                let updated = {
                    let mut guard = devices.write().await;
                    match guard.get_mut(device_id) {
                        Some(record) => {
                            apply(record);
                            Some(record.clone())
                        }
                        None => None,
                    }
                };
                if updated.is_some() {
                    persist_json(path, devices).await?;
                }
                Ok(updated)
            }
            #[cfg(feature = "sqlite-store")]
            StoreBackend::Sqlite { .. } => unreachable!("json mutation on sqlite backend"),
        }
    }
}

#[async_trait]
impl DeviceStore for FileDeviceStore {
    async fn register(
        &self,
        device_id: &str,
        tenant_id: &str,
        info: DeviceInfo,
    ) -> Result<RegisterOutcome> {
        let now = now_ms();
        match &self.backend {
            StoreBackend::Json { path, devices } => {
                let outcome = {
                    let mut guard = devices.write().await;
                    match guard.get_mut(device_id) {
                        Some(record) => {
                            record.tenant_id = tenant_id.to_owned();
                            apply_info(record, info);
                            record.status = STATUS_ONLINE.to_owned();
                            record.network_status = NETWORK_CONNECTED.to_owned();
                            record.last_seen_ms = now;
                            RegisterOutcome {
                                record: record.clone(),
                                created: false,
                            }
                        }
                        None => {
                            let record = new_record(device_id, tenant_id, info, now);
                            guard.insert(device_id.to_owned(), record.clone());
                            RegisterOutcome {
                                record,
                                created: true,
                            }
                        }
                    }
                };
                persist_json(path, devices).await?;
                Ok(outcome)
            }
            #[cfg(feature = "sqlite-store")]
            StoreBackend::Sqlite { path, lock } => {
                let _guard = lock.lock().await;
                let path = path.clone();
                let device_id = device_id.to_owned();
                let tenant_id = tenant_id.to_owned();
                tokio::task::spawn_blocking(move || -> Result<RegisterOutcome> {
                    let conn = open_sqlite(&path)?;
                    let existing = query_device(&conn, &device_id)?;
                    let created = existing.is_none();
                    let mut record = existing
                        .unwrap_or_else(|| new_record(&device_id, &tenant_id, DeviceInfo::default(), now));
                    record.tenant_id = tenant_id;
                    apply_info(&mut record, info);
                    record.status = STATUS_ONLINE.to_owned();
                    record.network_status = NETWORK_CONNECTED.to_owned();
                    record.last_seen_ms = now;
                    upsert_device(&conn, &record)?;
                    Ok(RegisterOutcome { record, created })
                })
                .await
                .with_context(|| "sqlite register join error")?
            }
        }
    }

    async fn update_status(
        &self,
        device_id: &str,
        status: &str,
        network_status: Option<&str>,
    ) -> Result<Option<DeviceRecord>> {
        let now = now_ms();
        let status = status.to_owned();
        let network_status = network_status.map(ToOwned::to_owned);
        match &self.backend {
            StoreBackend::Json { .. } => {
                self.mutate_json(device_id, |record| {
                    record.status = status;
                    if let Some(network) = network_status {
                        record.network_status = network;
                    }
                    record.last_seen_ms = now;
                })
                .await
            }
            #[cfg(feature = "sqlite-store")]
            StoreBackend::Sqlite { path, lock } => {
                let _guard = lock.lock().await;
                let path = path.clone();
                let device_id = device_id.to_owned();
                tokio::task::spawn_blocking(move || -> Result<Option<DeviceRecord>> {
                    let conn = open_sqlite(&path)?;
                    let Some(mut record) = query_device(&conn, &device_id)? else {
                        return Ok(None);
                    };
                    record.status = status;
                    if let Some(network) = network_status {
                        record.network_status = network;
                    }
                    record.last_seen_ms = now;
                    upsert_device(&conn, &record)?;
                    Ok(Some(record))
                })
                .await
                .with_context(|| "sqlite update_status join error")?
            }
        }
    }

    async fn replace_config(
        &self,
        device_id: &str,
        config: Value,
    ) -> Result<Option<DeviceRecord>> {
        let now = now_ms();
        match &self.backend {
            StoreBackend::Json { .. } => {
                self.mutate_json(device_id, |record| {
                    record.config = config;
                    record.last_seen_ms = now;
                })
                .await
            }
            #[cfg(feature = "sqlite-store")]
            StoreBackend::Sqlite { path, lock } => {
                let _guard = lock.lock().await;
                let path = path.clone();
                let device_id = device_id.to_owned();
                tokio::task::spawn_blocking(move || -> Result<Option<DeviceRecord>> {
                    let conn = open_sqlite(&path)?;
                    let Some(mut record) = query_device(&conn, &device_id)? else {
                        return Ok(None);
                    };
                    record.config = config;
                    record.last_seen_ms = now;
                    upsert_device(&conn, &record)?;
                    Ok(Some(record))
                })
                .await
                .with_context(|| "sqlite replace_config join error")?
            }
        }
    }

    async fn touch_heartbeat(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let now = now_ms();
        match &self.backend {
            StoreBackend::Json { .. } => {
                self.mutate_json(device_id, |record| {
                    record.status = STATUS_ONLINE.to_owned();
                    record.last_seen_ms = now;
                })
                .await
            }
            #[cfg(feature = "sqlite-store")]
            StoreBackend::Sqlite { path, lock } => {
                let _guard = lock.lock().await;
                let path = path.clone();
                let device_id = device_id.to_owned();
                tokio::task::spawn_blocking(move || -> Result<Option<DeviceRecord>> {
                    let conn = open_sqlite(&path)?;
                    let Some(mut record) = query_device(&conn, &device_id)? else {
                        return Ok(None);
                    };
                    record.status = STATUS_ONLINE.to_owned();
                    record.last_seen_ms = now;
                    upsert_device(&conn, &record)?;
                    Ok(Some(record))
                })
                .await
                .with_context(|| "sqlite touch_heartbeat join error")?
            }
        }
    }

    async fn mark_offline(&self, device_id: &str) -> Result<()> {
        let _ = self
            .update_status(device_id, STATUS_OFFLINE, Some("disconnected"))
            .await?;
        Ok(())
    }

    async fn list_for_tenant(&self, tenant_id: &str) -> Result<Vec<DeviceRecord>> {
        match &self.backend {
            StoreBackend::Json { devices, .. } => {
                let guard = devices.read().await;
                let mut records: Vec<DeviceRecord> = guard
                    .values()
                    .filter(|record| record.tenant_id == tenant_id)
                    .cloned()
                    .collect();
                records.sort_by(|a, b| a.id.cmp(&b.id));
                Ok(records)
            }
            #[cfg(feature = "sqlite-store")]
            StoreBackend::Sqlite { path, lock } => {
                let _guard = lock.lock().await;
                let path = path.clone();
                let tenant_id = tenant_id.to_owned();
                tokio::task::spawn_blocking(move || -> Result<Vec<DeviceRecord>> {
                    let conn = open_sqlite(&path)?;
                    let mut stmt = conn
                        .prepare(
                            "SELECT id, tenant_id, name, platform, model, os_version, \
                             app_version, build_number, installation_id, status, \
                             last_seen_ms, network_status, config \
                             FROM devices WHERE tenant_id = ?1 ORDER BY id",
                        )
                        .with_context(|| "prepare tenant listing")?;
                    let rows = stmt
                        .query_map(params![tenant_id], row_to_record)
                        .with_context(|| "query tenant listing")?;
                    let mut records = Vec::new();
                    for row in rows {
                        records.push(row.with_context(|| "read device row")?);
                    }
                    Ok(records)
                })
                .await
                .with_context(|| "sqlite list_for_tenant join error")?
            }
        }
    }
}

fn new_record(device_id: &str, tenant_id: &str, info: DeviceInfo, now: u64) -> DeviceRecord {
    let mut record = DeviceRecord {
        id: device_id.to_owned(),
        tenant_id: tenant_id.to_owned(),
        name: None,
        platform: None,
        model: None,
        os_version: None,
        app_version: None,
        build_number: None,
        installation_id: None,
        status: STATUS_ONLINE.to_owned(),
        last_seen_ms: now,
        network_status: NETWORK_CONNECTED.to_owned(),
        config: Value::Null,
    };
    apply_info(&mut record, info);
    record
}

fn apply_info(record: &mut DeviceRecord, info: DeviceInfo) {
    if info.name.is_some() {
        record.name = info.name;
    }
    if info.platform.is_some() {
        record.platform = info.platform;
    }
    if info.model.is_some() {
        record.model = info.model;
    }
    if info.os_version.is_some() {
        record.os_version = info.os_version;
    }
    if info.app_version.is_some() {
        record.app_version = info.app_version;
    }
    if info.build_number.is_some() {
        record.build_number = info.build_number;
    }
    if info.installation_id.is_some() {
        record.installation_id = info.installation_id;
    }
}

async fn persist_json(
    path: &PathBuf,
    devices: &RwLock<HashMap<String, DeviceRecord>>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let snapshot = {
        let guard = devices.read().await;
        serde_json::to_vec_pretty(&*guard)?
    };
    tokio::fs::write(path, snapshot).await?;
    Ok(())
}

fn is_sqlite_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()).map(|s| s.to_ascii_lowercase()),
        Some(ext) if ext == "db" || ext == "sqlite" || ext == "sqlite3"
    )
}

#[cfg(feature = "sqlite-store")]
const DEVICES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT,
    platform TEXT,
    model TEXT,
    os_version TEXT,
    app_version TEXT,
    build_number TEXT,
    installation_id TEXT,
    status TEXT NOT NULL,
    last_seen_ms INTEGER NOT NULL,
    network_status TEXT NOT NULL,
    config TEXT
);
CREATE INDEX IF NOT EXISTS devices_tenant_idx ON devices(tenant_id);
"#;

#[cfg(feature = "sqlite-store")]
async fn init_sqlite(path: PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::task::spawn_blocking(move || -> Result<()> {
        let _ = open_sqlite(&path)?;
        Ok(())
    })
    .await
    .with_context(|| "sqlite init join error")??;
    Ok(())
}

#[cfg(feature = "sqlite-store")]
fn open_sqlite(path: &Path) -> Result<Connection> {
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite {}", path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .with_context(|| "set WAL mode")?;
    conn.execute_batch(DEVICES_SCHEMA)
        .with_context(|| "ensure devices schema")?;
    Ok(conn)
}

#[cfg(feature = "sqlite-store")]
fn query_device(conn: &Connection, device_id: &str) -> Result<Option<DeviceRecord>> {
    conn.query_row(
        "SELECT id, tenant_id, name, platform, model, os_version, app_version, \
         build_number, installation_id, status, last_seen_ms, network_status, config \
         FROM devices WHERE id = ?1",
        params![device_id],
        row_to_record,
    )
    .optional()
    .with_context(|| "query device row")
}

#[cfg(feature = "sqlite-store")]
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceRecord> {
    let config_text: Option<String> = row.get(12)?;
    Ok(DeviceRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        platform: row.get(3)?,
        model: row.get(4)?,
        os_version: row.get(5)?,
        app_version: row.get(6)?,
        build_number: row.get(7)?,
        installation_id: row.get(8)?,
        status: row.get(9)?,
        last_seen_ms: row.get::<_, i64>(10)? as u64,
        network_status: row.get(11)?,
        config: config_text
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or(Value::Null),
    })
}

#[cfg(feature = "sqlite-store")]
fn upsert_device(conn: &Connection, record: &DeviceRecord) -> Result<()> {
    let config_text = if record.config.is_null() {
        None
    } else {
        Some(record.config.to_string())
    };
    conn.execute(
        "INSERT INTO devices (
            id, tenant_id, name, platform, model, os_version, app_version,
            build_number, installation_id, status, last_seen_ms, network_status, config
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(id) DO UPDATE SET
            tenant_id=excluded.tenant_id,
            name=excluded.name,
            platform=excluded.platform,
            model=excluded.model,
            os_version=excluded.os_version,
            app_version=excluded.app_version,
            build_number=excluded.build_number,
            installation_id=excluded.installation_id,
            status=excluded.status,
            last_seen_ms=excluded.last_seen_ms,
            network_status=excluded.network_status,
            config=excluded.config",
        params![
            record.id,
            record.tenant_id,
            record.name,
            record.platform,
            record.model,
            record.os_version,
            record.app_version,
            record.build_number,
            record.installation_id,
            record.status,
            record.last_seen_ms as i64,
            record.network_status,
            config_text,
        ],
    )
    .with_context(|| "upsert device row")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use serde_json::json;

    use super::{DeviceInfo, DeviceStore, FileDeviceStore, STATUS_OFFLINE, STATUS_ONLINE};

    fn temp_store_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        p.push(format!("mizan-display-devices-{name}-{stamp}.json"));
        p
    }

    #[cfg(feature = "sqlite-store")]
    fn temp_sqlite_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        p.push(format!("mizan-display-devices-{name}-{stamp}.db"));
        p
    }

    fn sample_info(name: &str) -> DeviceInfo {
        DeviceInfo {
            name: Some(name.to_owned()),
            platform: Some("android".to_owned()),
            model: Some("shield-tv".to_owned()),
            os_version: Some("11".to_owned()),
            app_version: Some("2.4.0".to_owned()),
            build_number: Some("240".to_owned()),
            installation_id: Some("inst-1".to_owned()),
        }
    }

    #[tokio::test]
    async fn register_distinguishes_create_from_update() {
        let path = temp_store_path("register");
        let store = FileDeviceStore::open(path.clone()).await.expect("store");

        let first = store
            .register("d1", "t1", sample_info("Lobby TV"))
            .await
            .expect("register");
        assert!(first.created);
        assert_eq!(first.record.status, STATUS_ONLINE);
        assert_eq!(first.record.name.as_deref(), Some("Lobby TV"));

        let second = store
            .register("d1", "t1", sample_info("Lobby TV v2"))
            .await
            .expect("re-register");
        assert!(!second.created);
        assert_eq!(second.record.name.as_deref(), Some("Lobby TV v2"));
        assert!(second.record.last_seen_ms >= first.record.last_seen_ms);

        let _ = tokio::fs::remove_file(path).await;
    }

    #[tokio::test]
    async fn status_and_heartbeat_move_last_seen_forward() {
        let path = temp_store_path("status");
        let store = FileDeviceStore::open(path.clone()).await.expect("store");
        let registered = store
            .register("d1", "t1", sample_info("Hall Display"))
            .await
            .expect("register");

        let updated = store
            .update_status("d1", "restarting", Some("connected"))
            .await
            .expect("update")
            .expect("record");
        assert_eq!(updated.status, "restarting");
        assert!(updated.last_seen_ms >= registered.record.last_seen_ms);

        let touched = store
            .touch_heartbeat("d1")
            .await
            .expect("heartbeat")
            .expect("record");
        assert_eq!(touched.status, STATUS_ONLINE);
        assert!(touched.last_seen_ms >= updated.last_seen_ms);

        let _ = tokio::fs::remove_file(path).await;
    }

    #[tokio::test]
    async fn update_on_unknown_device_returns_none() {
        let path = temp_store_path("unknown");
        let store = FileDeviceStore::open(path.clone()).await.expect("store");
        assert!(store
            .update_status("ghost", "online", None)
            .await
            .expect("update")
            .is_none());
        assert!(store
            .touch_heartbeat("ghost")
            .await
            .expect("heartbeat")
            .is_none());
        let _ = tokio::fs::remove_file(path).await;
    }

    #[tokio::test]
    async fn config_is_replaced_wholesale() {
        let path = temp_store_path("config");
        let store = FileDeviceStore::open(path.clone()).await.expect("store");
        store
            .register("d1", "t1", sample_info("Kiosk"))
            .await
            .expect("register");

        store
            .replace_config("d1", json!({"slideDuration": 15, "theme": "dark"}))
            .await
            .expect("config");
        let replaced = store
            .replace_config("d1", json!({"theme": "light"}))
            .await
            .expect("config")
            .expect("record");
        // The earlier slideDuration key is gone; no field-level merging.
        assert_eq!(replaced.config, json!({"theme": "light"}));

        let _ = tokio::fs::remove_file(path).await;
    }

    #[tokio::test]
    async fn tenant_listing_is_scoped_and_survives_reopen() {
        let path = temp_store_path("listing");
        {
            let store = FileDeviceStore::open(path.clone()).await.expect("store");
            store
                .register("d1", "t1", sample_info("Lobby"))
                .await
                .expect("register d1");
            store
                .register("d2", "t2", sample_info("Annex"))
                .await
                .expect("register d2");
            store.mark_offline("d1").await.expect("offline");
        }

        let reopened = FileDeviceStore::open(path.clone()).await.expect("reopen");
        let t1 = reopened.list_for_tenant("t1").await.expect("list t1");
        assert_eq!(t1.len(), 1);
        assert_eq!(t1[0].id, "d1");
        assert_eq!(t1[0].status, STATUS_OFFLINE);
        let t2 = reopened.list_for_tenant("t2").await.expect("list t2");
        assert_eq!(t2.len(), 1);
        assert_eq!(t2[0].id, "d2");

        let _ = tokio::fs::remove_file(path).await;
    }

    #[cfg(feature = "sqlite-store")]
    #[tokio::test]
    async fn sqlite_backend_round_trips_device_records() {
        let path = temp_sqlite_path("roundtrip");
        {
            let store = FileDeviceStore::open(path.clone()).await.expect("store");
            let outcome = store
                .register("d1", "t1", sample_info("Lobby"))
                .await
                .expect("register");
            assert!(outcome.created);
            store
                .replace_config("d1", json!({"theme": "dark"}))
                .await
                .expect("config");
        }

        let reopened = FileDeviceStore::open(path.clone()).await.expect("reopen");
        let devices = reopened.list_for_tenant("t1").await.expect("list");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].config, json!({"theme": "dark"}));
        assert_eq!(devices[0].model.as_deref(), Some("shield-tv"));

        let _ = tokio::fs::remove_file(&path).await;
        let _ = tokio::fs::remove_file(format!("{}-wal", path.display())).await;
        let _ = tokio::fs::remove_file(format!("{}-shm", path.display())).await;
    }
}
