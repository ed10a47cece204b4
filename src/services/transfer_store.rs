//! Durable transfer records.
//!
//! The engine and its workers only talk to [`TransferRepository`]; the SQLite
//! implementation serializes writers behind one lock and lets reads hit the
//! pool directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    errors::{TransferError, TransferResult},
    models::transfer::{NewTransfer, PartLayout, PartStatus, Transfer, TransferPart, TransferStatus},
    services::database,
};

const TRANSFER_COLUMNS: &str = "id, direction, object_key, local_path, total_bytes, transferred, \
     status, session_id, error_message, retry_count, created_at, updated_at";

#[async_trait]
pub trait TransferRepository: Send + Sync {
    async fn create(&self, new: &NewTransfer) -> TransferResult<Transfer>;

    async fn get(&self, id: i64) -> TransferResult<Transfer>;

    /// Transfers in any of `statuses`, oldest first.
    async fn list_by_status(&self, statuses: &[TransferStatus]) -> TransferResult<Vec<Transfer>>;

    async fn list_all(&self) -> TransferResult<Vec<Transfer>>;

    /// Set the status; `error` replaces the stored detail (None clears it).
    async fn update_status(
        &self,
        id: i64,
        status: TransferStatus,
        error: Option<&str>,
    ) -> TransferResult<()>;

    async fn set_total(&self, id: i64, total_bytes: i64) -> TransferResult<()>;

    async fn set_transferred(&self, id: i64, transferred: i64) -> TransferResult<()>;

    async fn set_session(&self, id: i64, session_id: Option<&str>) -> TransferResult<()>;

    /// Bump the retry counter, returning the new value.
    async fn increment_retry(&self, id: i64) -> TransferResult<i64>;

    async fn reset_retry(&self, id: i64) -> TransferResult<()>;

    /// Insert part rows that do not exist yet; existing rows are untouched.
    async fn insert_parts(&self, id: i64, parts: &[PartLayout]) -> TransferResult<()>;

    async fn list_parts(&self, id: i64) -> TransferResult<Vec<TransferPart>>;

    async fn complete_part(&self, id: i64, part_number: i64, etag: &str) -> TransferResult<()>;

    async fn reset_part(&self, id: i64, part_number: i64) -> TransferResult<()>;

    async fn delete_parts(&self, id: i64) -> TransferResult<()>;

    /// Multipart session ids referenced by any record.
    async fn known_session_ids(&self) -> TransferResult<Vec<String>>;

    /// Delete completed and cancelled records last touched before `cutoff`.
    async fn prune_finished(&self, cutoff: DateTime<Utc>) -> TransferResult<u64>;
}

#[derive(Clone)]
pub struct SqliteTransferStore {
    db: Arc<SqlitePool>,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteTransferStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Connect to `url` and make sure the schema exists.
    pub async fn open(url: &str) -> TransferResult<Self> {
        let pool = database::connect(url).await?;
        database::run_migrations(&pool, database::TRANSFER_SCHEMA).await?;
        Ok(Self::new(Arc::new(pool)))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    async fn touch(&self, sql: &str, id: i64) -> TransferResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(sql)
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TransferRepository for SqliteTransferStore {
    async fn create(&self, new: &NewTransfer) -> TransferResult<Transfer> {
        let now = Utc::now();
        let id = {
            let _guard = self.write_lock.lock().await;
            sqlx::query(
                "INSERT INTO transfers (direction, object_key, local_path, status, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(new.direction)
            .bind(&new.object_key)
            .bind(new.local_path.to_string_lossy().into_owned())
            .bind(TransferStatus::Queued)
            .bind(now)
            .bind(now)
            .execute(&*self.db)
            .await?
            .last_insert_rowid()
        };
        debug!(transfer_id = id, key = %new.object_key, "created transfer record");
        self.get(id).await
    }

    async fn get(&self, id: i64) -> TransferResult<Transfer> {
        sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(TransferError::TransferNotFound(id))
    }

    async fn list_by_status(&self, statuses: &[TransferStatus]) -> TransferResult<Vec<Transfer>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE status IN ("
        ));
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(*status);
        }
        separated.push_unseparated(") ORDER BY created_at ASC, id ASC");

        Ok(builder.build_query_as().fetch_all(&*self.db).await?)
    }

    async fn list_all(&self) -> TransferResult<Vec<Transfer>> {
        Ok(sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&*self.db)
        .await?)
    }

    async fn update_status(
        &self,
        id: i64,
        status: TransferStatus,
        error: Option<&str>,
    ) -> TransferResult<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE transfers SET status = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TransferError::TransferNotFound(id));
        }
        Ok(())
    }

    async fn set_total(&self, id: i64, total_bytes: i64) -> TransferResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE transfers SET total_bytes = ?, updated_at = ? WHERE id = ?")
            .bind(total_bytes)
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn set_transferred(&self, id: i64, transferred: i64) -> TransferResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE transfers SET transferred = ?, updated_at = ? WHERE id = ?")
            .bind(transferred)
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn set_session(&self, id: i64, session_id: Option<&str>) -> TransferResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE transfers SET session_id = ?, updated_at = ? WHERE id = ?")
            .bind(session_id)
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn increment_retry(&self, id: i64) -> TransferResult<i64> {
        let _guard = self.write_lock.lock().await;
        let count: i64 = sqlx::query_scalar(
            "UPDATE transfers SET retry_count = retry_count + 1, updated_at = ?
             WHERE id = ? RETURNING retry_count",
        )
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(TransferError::TransferNotFound(id))?;
        Ok(count)
    }

    async fn reset_retry(&self, id: i64) -> TransferResult<()> {
        self.touch(
            "UPDATE transfers SET retry_count = 0, updated_at = ? WHERE id = ?",
            id,
        )
        .await
    }

    async fn insert_parts(&self, id: i64, parts: &[PartLayout]) -> TransferResult<()> {
        if parts.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut tx = self.db.begin().await?;
        for part in parts {
            sqlx::query(
                "INSERT OR IGNORE INTO transfer_parts (transfer_id, part_number, byte_offset, size, status)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(part.part_number)
            .bind(part.byte_offset)
            .bind(part.size)
            .bind(PartStatus::Pending)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_parts(&self, id: i64) -> TransferResult<Vec<TransferPart>> {
        Ok(sqlx::query_as::<_, TransferPart>(
            "SELECT transfer_id, part_number, byte_offset, size, status, etag
             FROM transfer_parts WHERE transfer_id = ? ORDER BY part_number ASC",
        )
        .bind(id)
        .fetch_all(&*self.db)
        .await?)
    }

    async fn complete_part(&self, id: i64, part_number: i64, etag: &str) -> TransferResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "UPDATE transfer_parts SET status = ?, etag = ? WHERE transfer_id = ? AND part_number = ?",
        )
        .bind(PartStatus::Completed)
        .bind(etag)
        .bind(id)
        .bind(part_number)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn reset_part(&self, id: i64, part_number: i64) -> TransferResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "UPDATE transfer_parts SET status = ?, etag = NULL WHERE transfer_id = ? AND part_number = ?",
        )
        .bind(PartStatus::Pending)
        .bind(id)
        .bind(part_number)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn delete_parts(&self, id: i64) -> TransferResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM transfer_parts WHERE transfer_id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn known_session_ids(&self) -> TransferResult<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT session_id FROM transfers WHERE session_id IS NOT NULL",
        )
        .fetch_all(&*self.db)
        .await?)
    }

    async fn prune_finished(&self, cutoff: DateTime<Utc>) -> TransferResult<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "DELETE FROM transfers WHERE status IN (?, ?) AND updated_at < ?",
        )
        .bind(TransferStatus::Completed)
        .bind(TransferStatus::Cancelled)
        .bind(cutoff)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }
}
