//! Persistent store for user records, the blacklist and the download log
//!
//! The store is the only state shared between broker processes, so every
//! counter update is delegated to it instead of being cached locally.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database driver error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Configuration error (missing connection string, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
}

/// One completed delivery, as written to the download log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRecord {
    /// Participant who requested the artifact
    pub user_id: i64,
    /// Catalog identifier of the application
    pub app_id: String,
    /// Human-readable application title
    pub app_name: String,
    /// Artifact kind derived from the filename extension (`apk`, `xapk`, ...)
    pub file_type: String,
    /// Artifact size in bytes
    pub file_size: u64,
}

/// Interface for persistent stores
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Whether the identity is on the blacklist
    async fn is_blacklisted(&self, user_id: i64) -> Result<bool, StoreError>;
    /// Put the identity on the blacklist (no-op if already present)
    async fn add_to_blacklist(&self, user_id: i64, reason: String) -> Result<(), StoreError>;
    /// Upsert the user record and refresh its activity timestamp.
    ///
    /// Returns `true` when the record did not exist before.
    async fn touch_user(&self, user_id: i64, name: String) -> Result<bool, StoreError>;
    /// Atomically increment and return the spam score
    async fn increment_spam_score(&self, user_id: i64) -> Result<u32, StoreError>;
    /// Remember why an identity was blocked
    async fn record_block_reason(&self, user_id: i64, reason: String) -> Result<(), StoreError>;
    /// Append to the download log and bump the user's download counter
    async fn log_download(&self, record: DownloadRecord) -> Result<(), StoreError>;
    /// Check connection to the store
    async fn check_connection(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
struct UserRecord {
    name: String,
    last_activity: Option<DateTime<Utc>>,
    spam_score: u32,
    total_downloads: u64,
    block_reason: Option<String>,
}

/// Process-local store used when no database is configured and in tests
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<i64, UserRecord>>,
    blacklist: RwLock<HashMap<i64, String>>,
    downloads: RwLock<Vec<DownloadRecord>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the download log
    pub async fn downloads(&self) -> Vec<DownloadRecord> {
        self.downloads.read().await.clone()
    }

    /// Recorded block reason for an identity
    pub async fn block_reason(&self, user_id: i64) -> Option<String> {
        self.users
            .read()
            .await
            .get(&user_id)
            .and_then(|u| u.block_reason.clone())
    }

    /// Number of completed downloads recorded for an identity
    pub async fn total_downloads(&self, user_id: i64) -> u64 {
        self.users
            .read()
            .await
            .get(&user_id)
            .map_or(0, |u| u.total_downloads)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn is_blacklisted(&self, user_id: i64) -> Result<bool, StoreError> {
        Ok(self.blacklist.read().await.contains_key(&user_id))
    }

    async fn add_to_blacklist(&self, user_id: i64, reason: String) -> Result<(), StoreError> {
        self.blacklist.write().await.entry(user_id).or_insert(reason);
        Ok(())
    }

    async fn touch_user(&self, user_id: i64, name: String) -> Result<bool, StoreError> {
        let mut users = self.users.write().await;
        let created = !users.contains_key(&user_id);
        let record = users.entry(user_id).or_default();
        record.name = name;
        record.last_activity = Some(Utc::now());
        Ok(created)
    }

    async fn increment_spam_score(&self, user_id: i64) -> Result<u32, StoreError> {
        let mut users = self.users.write().await;
        let record = users.entry(user_id).or_default();
        record.spam_score += 1;
        Ok(record.spam_score)
    }

    async fn record_block_reason(&self, user_id: i64, reason: String) -> Result<(), StoreError> {
        self.users
            .write()
            .await
            .entry(user_id)
            .or_default()
            .block_reason = Some(reason);
        Ok(())
    }

    async fn log_download(&self, record: DownloadRecord) -> Result<(), StoreError> {
        self.users
            .write()
            .await
            .entry(record.user_id)
            .or_default()
            .total_downloads += 1;
        self.downloads.write().await.push(record);
        Ok(())
    }

    async fn check_connection(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        phone_number BIGINT PRIMARY KEY,
        username TEXT NOT NULL DEFAULT '',
        first_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_activity TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        spam_score INTEGER NOT NULL DEFAULT 0,
        total_downloads BIGINT NOT NULL DEFAULT 0,
        block_reason TEXT
    )",
    "CREATE TABLE IF NOT EXISTS blacklist (
        phone_number BIGINT PRIMARY KEY,
        reason TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS downloads (
        id BIGSERIAL PRIMARY KEY,
        user_phone BIGINT NOT NULL,
        app_id TEXT NOT NULL,
        app_name TEXT NOT NULL,
        file_type TEXT NOT NULL,
        file_size BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
];

/// Postgres-backed store
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and make sure the tables exist
    ///
    /// # Errors
    ///
    /// Returns an error if the connection string is empty, the connection
    /// fails or the schema cannot be created.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        if database_url.trim().is_empty() {
            return Err(StoreError::Config("DATABASE_URL is empty".into()));
        }

        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!("Postgres store initialized.");
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn is_blacklisted(&self, user_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM blacklist WHERE phone_number = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn add_to_blacklist(&self, user_id: i64, reason: String) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO blacklist (phone_number, reason) VALUES ($1, $2)
             ON CONFLICT (phone_number) DO NOTHING",
        )
        .bind(user_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_user(&self, user_id: i64, name: String) -> Result<bool, StoreError> {
        // xmax = 0 only for freshly inserted rows
        let row = sqlx::query(
            "INSERT INTO users (phone_number, username) VALUES ($1, $2)
             ON CONFLICT (phone_number) DO UPDATE SET last_activity = NOW(), username = $2
             RETURNING (xmax = 0) AS inserted",
        )
        .bind(user_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<bool, _>("inserted")?)
    }

    async fn increment_spam_score(&self, user_id: i64) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "INSERT INTO users (phone_number, spam_score) VALUES ($1, 1)
             ON CONFLICT (phone_number) DO UPDATE SET spam_score = users.spam_score + 1
             RETURNING spam_score",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        let score: i32 = row.try_get("spam_score")?;
        Ok(u32::try_from(score).unwrap_or_default())
    }

    async fn record_block_reason(&self, user_id: i64, reason: String) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (phone_number, block_reason) VALUES ($1, $2)
             ON CONFLICT (phone_number) DO UPDATE SET block_reason = $2",
        )
        .bind(user_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_download(&self, record: DownloadRecord) -> Result<(), StoreError> {
        let size = i64::try_from(record.file_size).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO downloads (user_phone, app_id, app_name, file_type, file_size)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.user_id)
        .bind(&record.app_id)
        .bind(&record.app_name)
        .bind(&record.file_type)
        .bind(size)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE users SET total_downloads = total_downloads + 1 WHERE phone_number = $1",
        )
        .bind(record.user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn check_connection(&self) -> Result<(), StoreError> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => {
                info!("Successfully connected to Postgres.");
                Ok(())
            }
            Err(e) => {
                error!("Postgres connection check failed: {e}");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_touch_user_reports_first_contact_once() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        assert!(store.touch_user(42, "Omar".to_string()).await?);
        assert!(!store.touch_user(42, "Omar".to_string()).await?);
        assert!(store.touch_user(43, "Sara".to_string()).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_spam_score_increments() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        assert_eq!(store.increment_spam_score(7).await?, 1);
        assert_eq!(store.increment_spam_score(7).await?, 2);
        assert_eq!(store.increment_spam_score(8).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_blacklist_keeps_first_reason() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        assert!(!store.is_blacklisted(9).await?);
        store.add_to_blacklist(9, "spam".to_string()).await?;
        store.add_to_blacklist(9, "again".to_string()).await?;
        assert!(store.is_blacklisted(9).await?);
        assert_eq!(store.blacklist.read().await.get(&9).cloned(), Some("spam".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_log_download_counts() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let record = DownloadRecord {
            user_id: 1,
            app_id: "com.whatsapp".to_string(),
            app_name: "WhatsApp".to_string(),
            file_type: "apk".to_string(),
            file_size: 1024,
        };
        store.log_download(record.clone()).await?;
        store.log_download(record.clone()).await?;

        assert_eq!(store.total_downloads(1).await, 2);
        assert_eq!(store.downloads().await, vec![record.clone(), record]);
        Ok(())
    }

    #[tokio::test]
    async fn test_pg_store_rejects_empty_url() {
        assert!(matches!(
            PgStore::connect("  ").await,
            Err(StoreError::Config(_))
        ));
    }
}
