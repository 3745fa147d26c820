//! In-memory implementation of [`BatchStore`].
//!
//! Backs unit and integration tests, and callers that do not need durable
//! progress. All data is lost when the store is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use batchflow_core::{
    defaults, BatchItem, BatchRecord, BatchRecordUpdate, BatchStore, Error, ItemStatus,
    ItemStatusCounts, ItemTransition, ListBatchesRequest, Result,
};

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<Uuid, BatchRecord>,
    items: HashMap<Uuid, BatchItem>,
    /// Item ids per batch, in `processing_order`.
    batch_items: HashMap<Uuid, Vec<Uuid>>,
}

/// HashMap-backed batch store behind a single `RwLock`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBatchStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored batch records.
    pub async fn batch_count(&self) -> usize {
        self.tables.read().await.records.len()
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn save_batch_record(&self, record: &BatchRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.records.contains_key(&record.id) {
            return Err(Error::InvalidInput(format!(
                "batch {} already exists",
                record.id
            )));
        }
        tables.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_batch_record(
        &self,
        batch_id: Uuid,
        update: BatchRecordUpdate,
    ) -> Result<BatchRecord> {
        let mut tables = self.tables.write().await;
        let record = tables
            .records
            .get_mut(&batch_id)
            .ok_or(Error::BatchNotFound(batch_id))?;
        // apply on a copy so a rejected update leaves the stored row untouched
        let mut updated = record.clone();
        updated.apply(&update, Utc::now())?;
        *record = updated.clone();
        Ok(updated)
    }

    async fn get_batch_record(&self, batch_id: Uuid) -> Result<Option<BatchRecord>> {
        Ok(self.tables.read().await.records.get(&batch_id).cloned())
    }

    async fn list_batch_records(&self, req: ListBatchesRequest) -> Result<Vec<BatchRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<BatchRecord> = tables
            .records
            .values()
            .filter(|r| req.status.map_or(true, |s| r.status == s))
            .filter(|r| {
                req.batch_type
                    .as_deref()
                    .map_or(true, |t| r.batch_type == t)
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let offset = req.offset.unwrap_or(0).max(0) as usize;
        let limit = req.limit.unwrap_or(defaults::PAGE_LIMIT).max(0) as usize;
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn save_batch_items(&self, items: &[BatchItem]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for item in items {
            if !tables.records.contains_key(&item.batch_id) {
                return Err(Error::BatchNotFound(item.batch_id));
            }
            if tables.items.contains_key(&item.id) {
                return Err(Error::InvalidInput(format!("item {} already exists", item.id)));
            }
        }
        for item in items {
            tables.items.insert(item.id, item.clone());
            tables.batch_items.entry(item.batch_id).or_default().push(item.id);
        }

        let Tables {
            items: stored,
            batch_items,
            ..
        } = &mut *tables;
        for ids in batch_items.values_mut() {
            ids.sort_by_key(|id| stored.get(id).map(|it| it.processing_order));
        }
        Ok(())
    }

    async fn update_batch_item_status(
        &self,
        item_id: Uuid,
        transition: ItemTransition,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let item = tables
            .items
            .get_mut(&item_id)
            .ok_or(Error::ItemNotFound(item_id))?;
        let mut updated = item.clone();
        updated.apply(&transition, Utc::now())?;
        *item = updated;
        Ok(())
    }

    async fn update_batch_item_stage(&self, item_id: Uuid, stage: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let item = tables
            .items
            .get_mut(&item_id)
            .ok_or(Error::ItemNotFound(item_id))?;
        if !item.status.is_terminal() {
            item.stage = Some(stage.to_string());
        }
        Ok(())
    }

    async fn get_batch_items(&self, batch_id: Uuid) -> Result<Vec<BatchItem>> {
        let tables = self.tables.read().await;
        Ok(tables
            .batch_items
            .get(&batch_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.items.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn reset_failed_items(&self, batch_id: Uuid) -> Result<Vec<BatchItem>> {
        let mut tables = self.tables.write().await;
        let ids = tables.batch_items.get(&batch_id).cloned().unwrap_or_default();

        let mut reset = Vec::new();
        for id in ids {
            if let Some(item) = tables.items.get_mut(&id) {
                if item.status == ItemStatus::Failed {
                    item.reset_for_retry();
                    reset.push(item.clone());
                }
            }
        }
        Ok(reset)
    }

    async fn query_item_status_counts(&self, batch_id: Uuid) -> Result<ItemStatusCounts> {
        let tables = self.tables.read().await;
        let statuses = tables
            .batch_items
            .get(&batch_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.items.get(id).map(|it| it.status));
        Ok(ItemStatusCounts::from_statuses(statuses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_core::{
        new_v7, BatchStatus, CreateBatchRequest, ErrorKind, ItemError, NewBatchItem,
    };

    async fn seeded(n: usize) -> (InMemoryBatchStore, BatchRecord, Vec<BatchItem>) {
        let store = InMemoryBatchStore::new();
        let now = Utc::now();
        let record =
            BatchRecord::from_request(new_v7(), CreateBatchRequest::new("test", n as i32), now);
        store.save_batch_record(&record).await.unwrap();

        let items: Vec<BatchItem> = (0..n)
            .map(|i| {
                BatchItem::from_new(
                    new_v7(),
                    record.id,
                    i as i32,
                    NewBatchItem::new(format!("src-{i}")),
                    now,
                )
            })
            .collect();
        store.save_batch_items(&items).await.unwrap();
        (store, record, items)
    }

    #[tokio::test]
    async fn test_items_returned_in_processing_order() {
        let (store, record, items) = seeded(5).await;
        let fetched = store.get_batch_items(record.id).await.unwrap();
        let expected: Vec<Uuid> = items.iter().map(|i| i.id).collect();
        let got: Vec<Uuid> = fetched.iter().map(|i| i.id).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_items_for_unknown_batch_rejected() {
        let store = InMemoryBatchStore::new();
        let item = BatchItem::from_new(new_v7(), new_v7(), 0, "x".into(), Utc::now());
        let err = store.save_batch_items(&[item]).await.unwrap_err();
        assert!(matches!(err, Error::BatchNotFound(_)));
    }

    #[tokio::test]
    async fn test_terminal_item_rejects_transition() {
        let (store, _, items) = seeded(1).await;
        let id = items[0].id;
        store
            .update_batch_item_status(id, ItemTransition::processing())
            .await
            .unwrap();
        store
            .update_batch_item_status(id, ItemTransition::completed(1, 10, None))
            .await
            .unwrap();

        let err = store
            .update_batch_item_status(
                id,
                ItemTransition::failed(ItemError::network("late"), 2, 1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_stage_ignored_on_terminal_item() {
        let (store, record, items) = seeded(1).await;
        let id = items[0].id;
        store
            .update_batch_item_status(id, ItemTransition::processing())
            .await
            .unwrap();
        store.update_batch_item_stage(id, "downloading").await.unwrap();
        assert_eq!(
            store.get_batch_items(record.id).await.unwrap()[0]
                .stage
                .as_deref(),
            Some("downloading")
        );

        store
            .update_batch_item_status(id, ItemTransition::completed(1, 10, None))
            .await
            .unwrap();
        store.update_batch_item_stage(id, "saving").await.unwrap();
        assert_eq!(
            store.get_batch_items(record.id).await.unwrap()[0]
                .stage
                .as_deref(),
            Some("completed")
        );
    }

    #[tokio::test]
    async fn test_stage_on_missing_item_is_not_found() {
        let store = InMemoryBatchStore::new();
        let err = store
            .update_batch_item_stage(new_v7(), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ItemNotFound(_)));
    }

    #[tokio::test]
    async fn test_counts_and_reset() {
        let (store, record, items) = seeded(3).await;
        for item in &items {
            store
                .update_batch_item_status(item.id, ItemTransition::processing())
                .await
                .unwrap();
        }
        store
            .update_batch_item_status(items[0].id, ItemTransition::completed(1, 1, None))
            .await
            .unwrap();
        store
            .update_batch_item_status(
                items[1].id,
                ItemTransition::failed(ItemError::timeout("slow"), 4, 1),
            )
            .await
            .unwrap();
        store
            .update_batch_item_status(
                items[2].id,
                ItemTransition::failed(ItemError::new(ErrorKind::TooLarge, "big"), 1, 1),
            )
            .await
            .unwrap();

        let counts = store.query_item_status_counts(record.id).await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.processed(), 3);

        let reset = store.reset_failed_items(record.id).await.unwrap();
        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].id, items[1].id);

        let counts = store.query_item_status_counts(record.id).await.unwrap();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.processed(), 2);
    }

    #[tokio::test]
    async fn test_rejected_record_update_leaves_row_untouched() {
        let (store, record, _) = seeded(2).await;
        store
            .update_batch_record(
                record.id,
                BatchRecordUpdate::finish(BatchStatus::Completed, 2, None),
            )
            .await
            .unwrap();

        let err = store
            .update_batch_record(
                record.id,
                BatchRecordUpdate::finish(BatchStatus::Failed, 2, Some("x".into())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));

        let stored = store.get_batch_record(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates() {
        let store = InMemoryBatchStore::new();
        let now = Utc::now();
        for i in 0..4 {
            let batch_type = if i % 2 == 0 { "audio_extraction" } else { "transcription" };
            let record = BatchRecord::from_request(
                new_v7(),
                CreateBatchRequest::new(batch_type, 1),
                now + chrono::Duration::seconds(i),
            );
            store.save_batch_record(&record).await.unwrap();
        }

        let audio = store
            .list_batch_records(ListBatchesRequest {
                batch_type: Some("audio_extraction".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(audio.len(), 2);
        assert!(audio[0].created_at > audio[1].created_at);

        let page = store
            .list_batch_records(ListBatchesRequest {
                limit: Some(1),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(store.batch_count().await, 4);
    }
}
