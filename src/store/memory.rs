use super::{StoredEntity, VectorStore};
use crate::error::Result;
use crate::index::EntityKind;
use async_trait::async_trait;
use dashmap::DashMap;

type RowKey = (EntityKind, String, String);

/// Process-local `VectorStore`
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: DashMap<RowKey, StoredEntity>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Overwrite the hash of a stored row, simulating a row written by an older DDL
    #[cfg(test)]
    pub(crate) fn corrupt_hash(&self, kind: EntityKind, database: &str, id: &str) {
        if let Some(mut row) = self
            .rows
            .get_mut(&(kind, database.to_string(), id.to_string()))
        {
            row.content_hash = "outdated".to_string();
        }
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, entities: &[StoredEntity]) -> Result<()> {
        for entity in entities {
            self.rows.insert(
                (entity.kind, entity.database_name.clone(), entity.id.clone()),
                entity.clone(),
            );
        }
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, database: &str, id: &str) -> Result<bool> {
        Ok(self
            .rows
            .remove(&(kind, database.to_string(), id.to_string()))
            .is_some())
    }

    async fn load(&self, kind: EntityKind, database: Option<&str>) -> Result<Vec<StoredEntity>> {
        let mut rows: Vec<StoredEntity> = self
            .rows
            .iter()
            .filter(|row| row.key().0 == kind)
            .filter(|row| database.map_or(true, |db| row.database_name == db))
            .map(|row| row.value().clone())
            .collect();
        rows.sort_by(|a, b| {
            a.database_name
                .cmp(&b.database_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(rows)
    }
}
