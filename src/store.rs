use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("email already registered")]
    DuplicateEmail,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupted row {id}: {reason}")]
    Corrupted { id: i64, reason: String },
}

fn storage(e: sqlx::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub hashed_password: String,
    pub name: String,
    pub phone_number: String,
    pub phone_verified: bool,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub hashed_password: String,
    pub name: String,
    pub phone_number: String,
    /// Normalized form of `phone_number`, used to match verifications.
    pub phone_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatHistoryEntry {
    pub id: i64,
    pub fat_rate: String,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, user: &NewUser) -> Result<User, StoreError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    /// Returns false when no such user exists.
    async fn update_password(&self, email: &str, hashed_password: &str) -> Result<bool, StoreError>;
    /// Removes the user and their history. Returns false when no such user exists.
    async fn delete_user(&self, email: &str) -> Result<bool, StoreError>;
    /// Marks every account registered with `phone_key` verified; returns how many.
    async fn mark_phone_verified(&self, phone_key: &str) -> Result<u64, StoreError>;
    async fn record_prediction(
        &self,
        user_id: i64,
        fat_rate: &str,
        confidence: f32,
        at: DateTime<Utc>,
    ) -> Result<FatHistoryEntry, StoreError>;
    /// Newest first.
    async fn history(&self, user_id: i64, limit: u32) -> Result<Vec<FatHistoryEntry>, StoreError>;
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL UNIQUE,
        hashed_password TEXT NOT NULL,
        name TEXT NOT NULL,
        phone_number TEXT NOT NULL,
        phone_key TEXT NOT NULL,
        phone_verified INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_users_phone_key ON users(phone_key)",
    r#"
    CREATE TABLE IF NOT EXISTS fat_histories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        fat_rate TEXT NOT NULL,
        confidence REAL NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_fat_histories_user ON fat_histories(user_id, created_at DESC)",
];

type UserRow = (i64, String, String, String, String, bool);
type HistoryRow = (i64, String, f64, i64);

const USER_COLUMNS: &str = "id, email, hashed_password, name, phone_number, phone_verified";

fn user_from_row(
    (id, email, hashed_password, name, phone_number, phone_verified): UserRow,
) -> User {
    User {
        id,
        email,
        hashed_password,
        name,
        phone_number,
        phone_verified,
    }
}

fn history_from_row(
    (id, fat_rate, confidence, created_at): HistoryRow,
) -> Result<FatHistoryEntry, StoreError> {
    let created_at =
        DateTime::from_timestamp_millis(created_at).ok_or_else(|| StoreError::Corrupted {
            id,
            reason: format!("timestamp {created_at} out of range"),
        })?;
    Ok(FatHistoryEntry {
        id,
        fat_rate,
        confidence: confidence as f32,
        created_at,
    })
}

/// SQLite-backed account store; the schema is created on connect.
pub struct SqliteUserStore {
    pool: SqlitePool,
}

impl SqliteUserStore {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(storage)?;
        Self::with_pool(pool).await
    }

    /// Single long-lived connection; each new connection would see a fresh database.
    pub async fn new_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage)?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await.map_err(storage)?;
        }
        info!("user store ready");
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl UserStore for SqliteUserStore {
    async fn create_user(&self, user: &NewUser) -> Result<User, StoreError> {
        let result = sqlx::query(
            "INSERT INTO users (email, hashed_password, name, phone_number, phone_key) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&user.email)
        .bind(&user.hashed_password)
        .bind(&user.name)
        .bind(&user.phone_number)
        .bind(&user.phone_key)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::DuplicateEmail,
            other => storage(other),
        })?;

        Ok(User {
            id: result.last_insert_rowid(),
            email: user.email.clone(),
            hashed_password: user.hashed_password.clone(),
            name: user.name.clone(),
            phone_number: user.phone_number.clone(),
            phone_verified: false,
        })
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?"))
                .bind(email)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        Ok(row.map(user_from_row))
    }

    async fn update_password(
        &self,
        email: &str,
        hashed_password: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE users SET hashed_password = ? WHERE email = ?")
            .bind(hashed_password)
            .bind(email)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_user(&self, email: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        sqlx::query(
            "DELETE FROM fat_histories WHERE user_id IN (SELECT id FROM users WHERE email = ?)",
        )
        .bind(email)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        let result = sqlx::query("DELETE FROM users WHERE email = ?")
            .bind(email)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_phone_verified(&self, phone_key: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE users SET phone_verified = 1 WHERE phone_key = ?")
            .bind(phone_key)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected())
    }

    async fn record_prediction(
        &self,
        user_id: i64,
        fat_rate: &str,
        confidence: f32,
        at: DateTime<Utc>,
    ) -> Result<FatHistoryEntry, StoreError> {
        let result = sqlx::query(
            "INSERT INTO fat_histories (user_id, fat_rate, confidence, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(fat_rate)
        .bind(f64::from(confidence))
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        history_from_row((
            result.last_insert_rowid(),
            fat_rate.to_string(),
            f64::from(confidence),
            at.timestamp_millis(),
        ))
    }

    async fn history(
        &self,
        user_id: i64,
        limit: u32,
    ) -> Result<Vec<FatHistoryEntry>, StoreError> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT id, fat_rate, confidence, created_at FROM fat_histories \
             WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter().map(history_from_row).collect()
    }
}
