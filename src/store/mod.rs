//! SQLite persistence for push subscriptions
//!
//! One row per (credentials, device client id) pair. The row is seeded as
//! soon as a transport reports an endpoint or device id, then updated when
//! the remote server acknowledges the subscription and again when the
//! verification code round-trips. Three independent flows mutate it
//! (registrar success, inbound verification, endpoint rotation), so every
//! mutation is a single atomic upsert keyed on that pair.

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

use crate::types::error::Result;
use crate::types::CredentialsId;
use crate::webpush::KeyMaterial;

pub mod accounts;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// One persisted push subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSubscriptionRecord {
    pub id: i64,
    pub credentials_id: CredentialsId,
    pub device_client_id: Uuid,
    pub distributor: String,
    /// Assigned by the remote server on a successful create.
    pub remote_subscription_id: Option<String>,
    pub url: Option<String>,
    /// Set once a verification push has round-tripped.
    pub verification_code: Option<String>,
    pub expires: Option<DateTime<Utc>>,
}

pub struct SubscriptionStore {
    pool: DbPool,
}

impl SubscriptionStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder().build(manager)?;
        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    fn connection(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS push_subscription (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                credentials_id INTEGER NOT NULL,
                device_client_id TEXT NOT NULL,
                distributor TEXT NOT NULL,
                remote_subscription_id TEXT,
                url TEXT,
                public_key BLOB,
                private_key BLOB,
                authentication_secret BLOB,
                verification_code TEXT,
                expires TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(credentials_id, device_client_id)
            );

            CREATE INDEX IF NOT EXISTS idx_push_subscription_device
                ON push_subscription(device_client_id);
        "#,
        )?;
        Ok(())
    }

    /// Seed (or reset) the row for a registration attempt that produced an
    /// endpoint or device id. Remote-assigned fields start over; the old
    /// remote subscription id has already been collected for the destroy
    /// list by the registrar.
    pub fn insert_registration(
        &self,
        credentials_id: CredentialsId,
        device_client_id: Uuid,
        distributor: &str,
    ) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO push_subscription (credentials_id, device_client_id, distributor)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(credentials_id, device_client_id) DO UPDATE SET
                distributor = excluded.distributor,
                updated_at = datetime('now')",
            params![
                credentials_id.0,
                device_client_id.to_string(),
                distributor
            ],
        )?;
        Ok(())
    }

    /// Record a server-acknowledged subscription in one atomic upsert.
    #[allow(clippy::too_many_arguments)]
    pub fn store_remote_subscription(
        &self,
        credentials_id: CredentialsId,
        device_client_id: Uuid,
        distributor: &str,
        remote_subscription_id: &str,
        url: &str,
        key_material: &KeyMaterial,
        expires: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO push_subscription (credentials_id, device_client_id, distributor,
                remote_subscription_id, url, public_key, private_key, authentication_secret,
                expires)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(credentials_id, device_client_id) DO UPDATE SET
                distributor = excluded.distributor,
                remote_subscription_id = excluded.remote_subscription_id,
                url = excluded.url,
                public_key = excluded.public_key,
                private_key = excluded.private_key,
                authentication_secret = excluded.authentication_secret,
                expires = excluded.expires,
                updated_at = datetime('now')",
            params![
                credentials_id.0,
                device_client_id.to_string(),
                distributor,
                remote_subscription_id,
                url,
                key_material.public_key,
                key_material.private_key,
                key_material.authentication_secret,
                expires.map(|dt| dt.to_rfc3339()),
            ],
        )?;
        debug!(
            "Stored remote subscription {remote_subscription_id} for credentials {credentials_id}"
        );
        Ok(())
    }

    /// Persist a round-tripped verification code.
    pub fn set_verification_code(
        &self,
        credentials_id: CredentialsId,
        remote_subscription_id: &str,
        verification_code: &str,
    ) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE push_subscription SET verification_code = ?3, updated_at = datetime('now')
             WHERE credentials_id = ?1 AND remote_subscription_id = ?2",
            params![credentials_id.0, remote_subscription_id, verification_code],
        )?;
        Ok(())
    }

    /// Remote subscription ids known for this credential set; passed as
    /// the destroy list on the next create call.
    pub fn existing_subscription_ids(&self, credentials_id: CredentialsId) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT remote_subscription_id FROM push_subscription
             WHERE credentials_id = ?1 AND remote_subscription_id IS NOT NULL",
        )?;
        let ids = stmt
            .query_map(params![credentials_id.0], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Subscription routing an inbound callback. A `None` distributor
    /// matches any; inbound mechanisms do not always authenticate the
    /// sending provider.
    pub fn subscription(
        &self,
        device_client_id: Uuid,
        distributor: Option<&str>,
    ) -> Result<Option<PushSubscriptionRecord>> {
        let conn = self.connection()?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(PushSubscriptionRecord {
                id: row.get(0)?,
                credentials_id: CredentialsId(row.get(1)?),
                device_client_id: row
                    .get::<_, String>(2)?
                    .parse()
                    .unwrap_or_else(|_| Uuid::nil()),
                distributor: row.get(3)?,
                remote_subscription_id: row.get(4)?,
                url: row.get(5)?,
                verification_code: row.get(6)?,
                expires: row
                    .get::<_, Option<String>>(7)?
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
            })
        };
        const COLUMNS: &str = "id, credentials_id, device_client_id, distributor, \
                               remote_subscription_id, url, verification_code, expires";
        let record = match distributor {
            Some(distributor) => conn
                .query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM push_subscription
                         WHERE device_client_id = ?1 AND distributor = ?2"
                    ),
                    params![device_client_id.to_string(), distributor],
                    map_row,
                )
                .optional()?,
            None => conn
                .query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM push_subscription WHERE device_client_id = ?1"
                    ),
                    params![device_client_id.to_string()],
                    map_row,
                )
                .optional()?,
        };
        Ok(record)
    }

    /// Key material for a subscription row. Partial material is invalid
    /// and reported as absent, so the message is treated as plaintext.
    pub fn key_material(&self, subscription_id: i64) -> Result<Option<KeyMaterial>> {
        let conn = self.connection()?;
        let material = conn
            .query_row(
                "SELECT public_key, private_key, authentication_secret
                 FROM push_subscription WHERE id = ?1",
                params![subscription_id],
                |row| {
                    Ok(KeyMaterial {
                        public_key: row.get::<_, Option<Vec<u8>>>(0)?.unwrap_or_default(),
                        private_key: row.get::<_, Option<Vec<u8>>>(1)?.unwrap_or_default(),
                        authentication_secret: row
                            .get::<_, Option<Vec<u8>>>(2)?
                            .unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(material.filter(KeyMaterial::is_complete))
    }

    /// Drop every subscription of a removed credential set.
    pub fn delete_by_credentials(&self, credentials_id: CredentialsId) -> Result<usize> {
        let conn = self.connection()?;
        let deleted = conn.execute(
            "DELETE FROM push_subscription WHERE credentials_id = ?1",
            params![credentials_id.0],
        )?;
        Ok(deleted)
    }
}
