//! SQLite implementation of the authority stores.
//!
//! Project ids are stored bit-cast to `INTEGER`; timestamps are unix seconds.
//! Usage rows are keyed by minute bucket and merged by addition. Every call
//! runs on tokio's blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::store::{AccessKeyStore, CycleStore, LimitStore, PermissionStore, UsageStore};
use crate::error::{QuotaError, Result};
use crate::model::{AccessKey, Cycle, Limit, Service, ServiceLimit, UsageDelta, UserPermission};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS Projects (
        project_id INTEGER PRIMARY KEY,
        max_keys INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS Limits (
        project_id INTEGER NOT NULL,
        service TEXT NOT NULL,
        rate_limit INTEGER NOT NULL,
        free_warn INTEGER NOT NULL DEFAULT 0,
        free_max INTEGER NOT NULL,
        over_warn INTEGER NOT NULL DEFAULT 0,
        over_max INTEGER NOT NULL,
        PRIMARY KEY (project_id, service)
    );
    CREATE TABLE IF NOT EXISTS AccessKeys (
        access_key TEXT PRIMARY KEY,
        project_id INTEGER NOT NULL,
        display_name TEXT NOT NULL DEFAULT '',
        active INTEGER NOT NULL,
        is_default INTEGER NOT NULL,
        require_origin INTEGER NOT NULL DEFAULT 0,
        allowed_origins TEXT NOT NULL DEFAULT '[]',
        allowed_services TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_access_keys_project ON AccessKeys (project_id);
    CREATE TABLE IF NOT EXISTS Cycles (
        project_id INTEGER PRIMARY KEY,
        start_at INTEGER NOT NULL,
        end_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS Usage (
        project_id INTEGER NOT NULL,
        access_key TEXT NOT NULL,
        service TEXT NOT NULL,
        bucket INTEGER NOT NULL,
        valid_compute INTEGER NOT NULL DEFAULT 0,
        over_compute INTEGER NOT NULL DEFAULT 0,
        limited_compute INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (project_id, access_key, service, bucket)
    );
    CREATE TABLE IF NOT EXISTS Permissions (
        project_id INTEGER NOT NULL,
        user_id TEXT NOT NULL,
        permission INTEGER NOT NULL,
        PRIMARY KEY (project_id, user_id)
    );
"#;

const KEY_COLUMNS: &str = "access_key, project_id, display_name, active, is_default, \
     require_origin, allowed_origins, allowed_services, created_at";

/// All authority stores over one SQLite connection.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("authority db poisoned");
            f(&mut conn)
        })
        .await
        .map_err(|e| QuotaError::Authority(format!("authority db task failed: {e}")))?
    }
}

fn to_db_id(id: u64) -> i64 {
    id as i64
}

fn from_db_id(id: i64) -> u64 {
    id as u64
}

fn from_ts(idx: usize, secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| QuotaError::Authority(e.to_string()))
}

fn decode_json<T: DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn decode_service(idx: usize, text: &str) -> rusqlite::Result<Service> {
    text.parse()
        .map_err(|e: QuotaError| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn access_key_from_row(row: &Row<'_>) -> rusqlite::Result<AccessKey> {
    let origins: String = row.get(6)?;
    let services: String = row.get(7)?;
    Ok(AccessKey {
        access_key: row.get(0)?,
        project_id: from_db_id(row.get(1)?),
        display_name: row.get(2)?,
        active: row.get(3)?,
        is_default: row.get(4)?,
        require_origin: row.get(5)?,
        allowed_origins: decode_json(6, &origins)?,
        allowed_services: decode_json(7, &services)?,
        created_at: Some(from_ts(8, row.get(8)?)?),
    })
}

// ============================================================================
// Access keys
// ============================================================================

fn insert_key(conn: &Connection, key: &AccessKey) -> Result<()> {
    let origins = encode_json(&key.allowed_origins)?;
    let services = encode_json(&key.allowed_services)?;
    let created_at = key.created_at.unwrap_or_else(Utc::now).timestamp();
    conn.execute(
        &format!("INSERT INTO AccessKeys ({KEY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            key.access_key,
            to_db_id(key.project_id),
            key.display_name,
            key.active,
            key.is_default,
            key.require_origin,
            origins,
            services,
            created_at,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl AccessKeyStore for SqliteStore {
    async fn find_access_key(&self, access_key: &str) -> Result<Option<AccessKey>> {
        let access_key = access_key.to_string();
        self.call(move |conn| {
            let key = conn
                .query_row(
                    &format!("SELECT {KEY_COLUMNS} FROM AccessKeys WHERE access_key = ?1"),
                    [access_key],
                    access_key_from_row,
                )
                .optional()?;
            Ok(key)
        })
        .await
    }

    async fn list_access_keys(
        &self,
        project_id: u64,
        active: Option<bool>,
        service: Option<Service>,
    ) -> Result<Vec<AccessKey>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {KEY_COLUMNS} FROM AccessKeys \
                 WHERE project_id = ?1 AND (?2 IS NULL OR active = ?2) \
                 ORDER BY created_at, rowid"
            ))?;
            let rows =
                stmt.query_map(params![to_db_id(project_id), active], access_key_from_row)?;

            let mut keys = Vec::new();
            for key in rows {
                let key = key?;
                if service.is_none_or(|service| key.validate_service(service)) {
                    keys.push(key);
                }
            }
            Ok(keys)
        })
        .await
    }

    async fn insert_access_key(&self, access_key: &AccessKey) -> Result<()> {
        let key = access_key.clone();
        self.call(move |conn| insert_key(conn, &key)).await
    }

    async fn create_access_key(&self, access_key: AccessKey) -> Result<AccessKey> {
        self.call(move |conn| {
            let mut key = access_key;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let max_keys: Option<i64> = tx
                .query_row(
                    "SELECT max_keys FROM Projects WHERE project_id = ?1",
                    [to_db_id(key.project_id)],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(max_keys) = max_keys else {
                return Err(QuotaError::ProjectNotFound);
            };
            let active: i64 = tx.query_row(
                "SELECT COUNT(*) FROM AccessKeys WHERE project_id = ?1 AND active = 1",
                [to_db_id(key.project_id)],
                |row| row.get(0),
            )?;
            if max_keys > 0 && active >= max_keys {
                return Err(QuotaError::MaxAccessKeys);
            }

            key.active = true;
            key.is_default = active == 0;
            insert_key(&tx, &key)?;
            tx.commit()?;
            Ok(key)
        })
        .await
    }

    async fn update_access_keys(&self, access_keys: &[AccessKey]) -> Result<()> {
        let mut encoded = Vec::with_capacity(access_keys.len());
        for key in access_keys {
            encoded.push((
                key.clone(),
                encode_json(&key.allowed_origins)?,
                encode_json(&key.allowed_services)?,
            ));
        }

        self.call(move |conn| {
            let tx = conn.transaction()?;
            for (key, origins, services) in encoded {
                let changed = tx.execute(
                    "UPDATE AccessKeys SET display_name = ?2, active = ?3, is_default = ?4, \
                     require_origin = ?5, allowed_origins = ?6, allowed_services = ?7 \
                     WHERE access_key = ?1",
                    params![
                        key.access_key,
                        key.display_name,
                        key.active,
                        key.is_default,
                        key.require_origin,
                        origins,
                        services,
                    ],
                )?;
                if changed == 0 {
                    return Err(QuotaError::AccessKeyNotFound);
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

// ============================================================================
// Limits
// ============================================================================

#[async_trait]
impl LimitStore for SqliteStore {
    async fn get_access_limit(&self, project_id: u64) -> Result<Limit> {
        self.call(move |conn| {
            let max_keys: Option<i64> = conn
                .query_row(
                    "SELECT max_keys FROM Projects WHERE project_id = ?1",
                    [to_db_id(project_id)],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(max_keys) = max_keys else {
                return Err(QuotaError::ProjectNotFound);
            };

            let mut stmt = conn.prepare(
                "SELECT service, rate_limit, free_warn, free_max, over_warn, over_max \
                 FROM Limits WHERE project_id = ?1",
            )?;
            let rows = stmt.query_map([to_db_id(project_id)], |row| {
                let service: String = row.get(0)?;
                Ok((
                    decode_service(0, &service)?,
                    ServiceLimit {
                        rate_limit: row.get(1)?,
                        free_warn: row.get(2)?,
                        free_max: row.get(3)?,
                        over_warn: row.get(4)?,
                        over_max: row.get(5)?,
                    },
                ))
            })?;

            let mut limit = Limit {
                max_keys,
                ..Limit::default()
            };
            for row in rows {
                let (service, service_limit) = row?;
                limit.services.insert(service, service_limit);
            }
            Ok(limit)
        })
        .await
    }

    async fn set_access_limit(&self, project_id: u64, limit: &Limit) -> Result<()> {
        let limit = limit.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO Projects (project_id, max_keys) VALUES (?1, ?2) \
                 ON CONFLICT(project_id) DO UPDATE SET max_keys = excluded.max_keys",
                params![to_db_id(project_id), limit.max_keys],
            )?;
            tx.execute(
                "DELETE FROM Limits WHERE project_id = ?1",
                [to_db_id(project_id)],
            )?;
            for (service, l) in &limit.services {
                tx.execute(
                    "INSERT INTO Limits (project_id, service, rate_limit, free_warn, free_max, over_warn, over_max) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        to_db_id(project_id),
                        service.as_str(),
                        l.rate_limit,
                        l.free_warn,
                        l.free_max,
                        l.over_warn,
                        l.over_max,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

// ============================================================================
// Usage
// ============================================================================

#[async_trait]
impl UsageStore for SqliteStore {
    async fn insert_usage(
        &self,
        project_id: u64,
        access_key: &str,
        service: Service,
        bucket: DateTime<Utc>,
        delta: UsageDelta,
    ) -> Result<()> {
        let access_key = access_key.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO Usage (project_id, access_key, service, bucket, valid_compute, over_compute, limited_compute) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(project_id, access_key, service, bucket) DO UPDATE SET \
                     valid_compute = valid_compute + excluded.valid_compute, \
                     over_compute = over_compute + excluded.over_compute, \
                     limited_compute = limited_compute + excluded.limited_compute",
                params![
                    to_db_id(project_id),
                    access_key,
                    service.as_str(),
                    bucket.timestamp(),
                    delta.valid_compute,
                    delta.over_compute,
                    delta.limited_compute,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_usage(
        &self,
        project_id: u64,
        access_key: Option<&str>,
        service: Option<Service>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageDelta> {
        let access_key = access_key.map(str::to_string);
        self.call(move |conn| {
            let delta = conn.query_row(
                "SELECT COALESCE(SUM(valid_compute), 0), COALESCE(SUM(over_compute), 0), \
                        COALESCE(SUM(limited_compute), 0) \
                 FROM Usage \
                 WHERE project_id = ?1 AND bucket >= ?2 AND bucket < ?3 \
                   AND (?4 IS NULL OR access_key = ?4) \
                   AND (?5 IS NULL OR service = ?5)",
                params![
                    to_db_id(project_id),
                    from.timestamp(),
                    to.timestamp(),
                    access_key,
                    service.map(|s| s.as_str()),
                ],
                |row| {
                    Ok(UsageDelta {
                        valid_compute: row.get(0)?,
                        over_compute: row.get(1)?,
                        limited_compute: row.get(2)?,
                    })
                },
            )?;
            Ok(delta)
        })
        .await
    }
}

// ============================================================================
// Cycles
// ============================================================================

#[async_trait]
impl CycleStore for SqliteStore {
    async fn get_access_cycle(&self, project_id: u64, now: DateTime<Utc>) -> Result<Cycle> {
        let cycle = self
            .call(move |conn| {
                let cycle = conn
                    .query_row(
                        "SELECT start_at, end_at FROM Cycles WHERE project_id = ?1",
                        [to_db_id(project_id)],
                        |row| {
                            Ok(Cycle {
                                start: from_ts(0, row.get(0)?)?,
                                end: from_ts(1, row.get(1)?)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(cycle)
            })
            .await?;
        Ok(match cycle {
            Some(cycle) => cycle.resolve(now),
            None => Cycle::for_time(now),
        })
    }

    async fn set_access_cycle(&self, project_id: u64, cycle: &Cycle) -> Result<()> {
        let (start, end) = (cycle.start.timestamp(), cycle.end.timestamp());
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO Cycles (project_id, start_at, end_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(project_id) DO UPDATE SET start_at = excluded.start_at, end_at = excluded.end_at",
                params![to_db_id(project_id), start, end],
            )?;
            Ok(())
        })
        .await
    }
}

// ============================================================================
// Permissions
// ============================================================================

#[async_trait]
impl PermissionStore for SqliteStore {
    async fn get_user_permission(
        &self,
        project_id: u64,
        user_id: &str,
    ) -> Result<UserPermission> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let permission: Option<i64> = conn
                .query_row(
                    "SELECT permission FROM Permissions WHERE project_id = ?1 AND user_id = ?2",
                    params![to_db_id(project_id), user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(permission
                .map(UserPermission::from_i64)
                .unwrap_or_default())
        })
        .await
    }

    async fn set_user_permission(
        &self,
        project_id: u64,
        user_id: &str,
        permission: UserPermission,
    ) -> Result<()> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO Permissions (project_id, user_id, permission) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(project_id, user_id) DO UPDATE SET permission = excluded.permission",
                params![to_db_id(project_id), user_id, permission.as_i64()],
            )?;
            Ok(())
        })
        .await
    }
}

// ============================================================================
// Tests
// ============================================================================
