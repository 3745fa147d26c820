//! Batch store backed by PostgreSQL.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use batchflow_core::{
    defaults, BatchItem, BatchRecord, BatchRecordUpdate, BatchStore, Error, ErrorKind,
    ItemStatus, ItemStatusCounts, ItemTransition, ListBatchesRequest, Result,
};

const RECORD_COLUMNS: &str = "id, name, description, batch_type, status, priority, total_items, \
     processed_items, parameters, error_message, created_at, updated_at, completed_at";

const ITEM_COLUMNS: &str = "id, batch_id, source_id, label, processing_order, status, stage, \
     error_message, error_kind, attempts, processing_time_ms, size_bytes, metadata, result, \
     created_at, started_at, completed_at";

/// PostgreSQL implementation of [`BatchStore`].
///
/// Status rules are enforced by applying each change to the row read under
/// `SELECT ... FOR UPDATE`, so concurrent writers to the same row serialize.
#[derive(Clone)]
pub struct PgBatchStore {
    pool: Pool<Postgres>,
}

impl PgBatchStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_record_row(row: &PgRow) -> Result<BatchRecord> {
        let status: String = row.try_get("status").map_err(Error::Database)?;
        Ok(BatchRecord {
            id: row.try_get("id").map_err(Error::Database)?,
            name: row.try_get("name").map_err(Error::Database)?,
            description: row.try_get("description").map_err(Error::Database)?,
            batch_type: row.try_get("batch_type").map_err(Error::Database)?,
            status: status.parse()?,
            priority: row.try_get("priority").map_err(Error::Database)?,
            total_items: row.try_get("total_items").map_err(Error::Database)?,
            processed_items: row.try_get("processed_items").map_err(Error::Database)?,
            parameters: row.try_get("parameters").map_err(Error::Database)?,
            error_message: row.try_get("error_message").map_err(Error::Database)?,
            created_at: row.try_get("created_at").map_err(Error::Database)?,
            updated_at: row.try_get("updated_at").map_err(Error::Database)?,
            completed_at: row.try_get("completed_at").map_err(Error::Database)?,
        })
    }

    fn parse_item_row(row: &PgRow) -> Result<BatchItem> {
        let status: String = row.try_get("status").map_err(Error::Database)?;
        let error_kind: Option<String> = row.try_get("error_kind").map_err(Error::Database)?;
        Ok(BatchItem {
            id: row.try_get("id").map_err(Error::Database)?,
            batch_id: row.try_get("batch_id").map_err(Error::Database)?,
            source_id: row.try_get("source_id").map_err(Error::Database)?,
            label: row.try_get("label").map_err(Error::Database)?,
            processing_order: row.try_get("processing_order").map_err(Error::Database)?,
            status: status.parse()?,
            stage: row.try_get("stage").map_err(Error::Database)?,
            error_message: row.try_get("error_message").map_err(Error::Database)?,
            error_kind: error_kind
                .as_deref()
                .map(str::parse::<ErrorKind>)
                .transpose()?,
            attempts: row.try_get("attempts").map_err(Error::Database)?,
            processing_time_ms: row.try_get("processing_time_ms").map_err(Error::Database)?,
            size_bytes: row.try_get("size_bytes").map_err(Error::Database)?,
            metadata: row.try_get("metadata").map_err(Error::Database)?,
            result: row.try_get("result").map_err(Error::Database)?,
            created_at: row.try_get("created_at").map_err(Error::Database)?,
            started_at: row.try_get("started_at").map_err(Error::Database)?,
            completed_at: row.try_get("completed_at").map_err(Error::Database)?,
        })
    }
}

#[async_trait]
impl BatchStore for PgBatchStore {
    async fn save_batch_record(&self, record: &BatchRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO processing_batches (id, name, description, batch_type, status, priority,
                 total_items, processed_items, parameters, error_message, created_at, updated_at,
                 completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(&record.batch_type)
        .bind(record.status.as_str())
        .bind(record.priority)
        .bind(record.total_items)
        .bind(record.processed_items)
        .bind(&record.parameters)
        .bind(&record.error_message)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn update_batch_record(
        &self,
        batch_id: Uuid,
        update: BatchRecordUpdate,
    ) -> Result<BatchRecord> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM processing_batches WHERE id = $1 FOR UPDATE"
        ))
        .bind(batch_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::BatchNotFound(batch_id))?;

        let mut record = Self::parse_record_row(&row)?;
        record.apply(&update, Utc::now())?;

        sqlx::query(
            "UPDATE processing_batches
             SET status = $1, processed_items = $2, error_message = $3, updated_at = $4,
                 completed_at = $5
             WHERE id = $6",
        )
        .bind(record.status.as_str())
        .bind(record.processed_items)
        .bind(&record.error_message)
        .bind(record.updated_at)
        .bind(record.completed_at)
        .bind(batch_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(record)
    }

    async fn get_batch_record(&self, batch_id: Uuid) -> Result<Option<BatchRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM processing_batches WHERE id = $1"
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_record_row).transpose()
    }

    async fn list_batch_records(&self, req: ListBatchesRequest) -> Result<Vec<BatchRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM processing_batches
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR batch_type = $2)
             ORDER BY created_at DESC, id DESC
             LIMIT $3 OFFSET $4"
        ))
        .bind(req.status.map(|s| s.as_str()))
        .bind(&req.batch_type)
        .bind(req.limit.unwrap_or(defaults::PAGE_LIMIT))
        .bind(req.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_record_row).collect()
    }

    async fn save_batch_items(&self, items: &[BatchItem]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        for item in items {
            sqlx::query(
                "INSERT INTO batch_processing_status (id, batch_id, source_id, label,
                     processing_order, status, stage, error_message, error_kind, attempts,
                     processing_time_ms, size_bytes, metadata, result, created_at, started_at,
                     completed_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
            )
            .bind(item.id)
            .bind(item.batch_id)
            .bind(&item.source_id)
            .bind(&item.label)
            .bind(item.processing_order)
            .bind(item.status.as_str())
            .bind(&item.stage)
            .bind(&item.error_message)
            .bind(item.error_kind.map(|k| k.as_str()))
            .bind(item.attempts)
            .bind(item.processing_time_ms)
            .bind(item.size_bytes)
            .bind(&item.metadata)
            .bind(&item.result)
            .bind(item.created_at)
            .bind(item.started_at)
            .bind(item.completed_at)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        debug!(
            subsystem = "database",
            component = "batch_store",
            op = "save_items",
            count = items.len(),
            "Saved batch items"
        );
        Ok(())
    }

    async fn update_batch_item_status(
        &self,
        item_id: Uuid,
        transition: ItemTransition,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM batch_processing_status WHERE id = $1 FOR UPDATE"
        ))
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::ItemNotFound(item_id))?;

        let mut item = Self::parse_item_row(&row)?;
        item.apply(&transition, Utc::now())?;

        sqlx::query(
            "UPDATE batch_processing_status
             SET status = $1, stage = $2, error_message = $3, error_kind = $4, attempts = $5,
                 processing_time_ms = $6, result = $7, started_at = $8, completed_at = $9
             WHERE id = $10",
        )
        .bind(item.status.as_str())
        .bind(&item.stage)
        .bind(&item.error_message)
        .bind(item.error_kind.map(|k| k.as_str()))
        .bind(item.attempts)
        .bind(item.processing_time_ms)
        .bind(&item.result)
        .bind(item.started_at)
        .bind(item.completed_at)
        .bind(item_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn update_batch_item_stage(&self, item_id: Uuid, stage: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE batch_processing_status SET stage = $1
             WHERE id = $2 AND status NOT IN ('completed', 'failed', 'skipped')",
        )
        .bind(stage)
        .bind(item_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM batch_processing_status WHERE id = $1)",
            )
            .bind(item_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
            if !exists {
                return Err(Error::ItemNotFound(item_id));
            }
        }
        Ok(())
    }

    async fn get_batch_items(&self, batch_id: Uuid) -> Result<Vec<BatchItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM batch_processing_status
             WHERE batch_id = $1
             ORDER BY processing_order ASC"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_item_row).collect()
    }

    async fn reset_failed_items(&self, batch_id: Uuid) -> Result<Vec<BatchItem>> {
        let rows = sqlx::query(&format!(
            "UPDATE batch_processing_status
             SET status = 'queued', stage = 'queued', error_message = NULL, error_kind = NULL,
                 attempts = 0, processing_time_ms = NULL, started_at = NULL, completed_at = NULL
             WHERE batch_id = $1 AND status = 'failed'
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut items = rows
            .iter()
            .map(Self::parse_item_row)
            .collect::<Result<Vec<_>>>()?;
        items.sort_by_key(|item| item.processing_order);
        Ok(items)
    }

    async fn query_item_status_counts(&self, batch_id: Uuid) -> Result<ItemStatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM batch_processing_status
             WHERE batch_id = $1
             GROUP BY status",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut counts = ItemStatusCounts::default();
        for (status, n) in rows {
            counts.add(status.parse::<ItemStatus>()?, n);
        }
        Ok(counts)
    }
}
