//! Postgres-backed checkpoint store.
//!
//! Records live in a single table keyed by the checkpoint key:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS eva_checkpoints (
//!     key        TEXT PRIMARY KEY,
//!     kind       TEXT NOT NULL,
//!     body       BYTEA NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```
//!
//! The scheduler loops run on plain OS threads, so every call bridges into
//! the tokio runtime captured at construction with `Handle::block_on`. Do not
//! call these methods from inside an async task; use `spawn_blocking`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | CheckpointError |
//! |------------|-----------------|
//! | Io / PoolTimedOut / PoolClosed | `Unavailable` (retried by the engine) |
//! | Database / other | `Storage` |

use std::sync::Arc;

use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use super::r#trait::{CheckpointError, CheckpointKey, CheckpointKind, CheckpointStore};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS eva_checkpoints (
        key        TEXT PRIMARY KEY,
        kind       TEXT NOT NULL,
        body       BYTEA NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Create the checkpoint table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), CheckpointError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self, value), fields(key = %key, bytes = value.len()), err)]
    fn put(&self, key: &CheckpointKey, value: &[u8]) -> Result<(), CheckpointError> {
        let pool = self.pool.clone();
        self.runtime.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO eva_checkpoints (key, kind, body)
                VALUES ($1, $2, $3)
                ON CONFLICT (key)
                DO UPDATE SET
                    body = EXCLUDED.body,
                    updated_at = NOW()
                "#,
            )
            .bind(key.as_str())
            .bind(key.kind().as_str())
            .bind(value)
            .execute(&*pool)
            .await
            .map_err(|e| map_sqlx_error("put", e))?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(key = %key), err)]
    fn get(&self, key: &CheckpointKey) -> Result<Option<Vec<u8>>, CheckpointError> {
        let pool = self.pool.clone();
        self.runtime.block_on(async {
            let row = sqlx::query("SELECT body FROM eva_checkpoints WHERE key = $1")
                .bind(key.as_str())
                .fetch_optional(&*pool)
                .await
                .map_err(|e| map_sqlx_error("get", e))?;
            row.map(|r| r.try_get::<Vec<u8>, _>("body"))
                .transpose()
                .map_err(|e| map_sqlx_error("get", e))
        })
    }

    #[instrument(skip(self), fields(key = %key), err)]
    fn delete(&self, key: &CheckpointKey) -> Result<(), CheckpointError> {
        let pool = self.pool.clone();
        self.runtime.block_on(async {
            sqlx::query("DELETE FROM eva_checkpoints WHERE key = $1")
                .bind(key.as_str())
                .execute(&*pool)
                .await
                .map_err(|e| map_sqlx_error("delete", e))?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(kind = kind.as_str()), err)]
    fn list_by_prefix(&self, kind: CheckpointKind) -> Result<Vec<(CheckpointKey, Vec<u8>)>, CheckpointError> {
        let pool = self.pool.clone();
        self.runtime.block_on(async {
            let rows = sqlx::query("SELECT key, body FROM eva_checkpoints WHERE kind = $1 ORDER BY key")
                .bind(kind.as_str())
                .fetch_all(&*pool)
                .await
                .map_err(|e| map_sqlx_error("list_by_prefix", e))?;

            rows.into_iter()
                .map(|row| {
                    let key: String = row.try_get("key").map_err(|e| map_sqlx_error("list_by_prefix", e))?;
                    let body: Vec<u8> = row.try_get("body").map_err(|e| map_sqlx_error("list_by_prefix", e))?;
                    Ok((CheckpointKey::parse(&key)?, body))
                })
                .collect()
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CheckpointError {
    match err {
        sqlx::Error::Io(e) => CheckpointError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => CheckpointError::Unavailable(format!("pool timed out in {operation}")),
        sqlx::Error::PoolClosed => CheckpointError::Unavailable(format!("connection pool closed in {operation}")),
        sqlx::Error::Database(db_err) => {
            CheckpointError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        other => CheckpointError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
