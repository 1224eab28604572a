//! In-memory nearest-neighbour index
//!
//! One partition per `(database, kind)`. Partitions are held behind `Arc` and
//! copied on write, so a query keeps scoring against the snapshot it started
//! with while writers and rebuilds install new versions.

use crate::embed::normalize_embedding;
use crate::error::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Table,
    Example,
    /// Database-level description, one per database
    Database,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Table => write!(f, "table"),
            EntityKind::Example => write!(f, "example"),
            EntityKind::Database => write!(f, "database"),
        }
    }
}

/// Fully qualified identity of an indexed entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityId {
    pub database: String,
    pub kind: EntityKind,
    /// Lowercased table name, example id, or the database name itself
    pub key: String,
}

impl EntityId {
    pub fn table(database: &str, name: &str) -> Self {
        Self {
            database: database.to_string(),
            kind: EntityKind::Table,
            key: name.to_lowercase(),
        }
    }

    pub fn example(database: &str, id: &str) -> Self {
        Self {
            database: database.to_string(),
            kind: EntityKind::Example,
            key: id.to_string(),
        }
    }

    pub fn database(database: &str) -> Self {
        Self {
            database: database.to_string(),
            kind: EntityKind::Database,
            key: database.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub key: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Default)]
struct Partition {
    dimension: Option<usize>,
    vectors: HashMap<String, Vec<f32>>,
}

impl Partition {
    fn insert(&mut self, key: String, vector: &[f32]) -> Result<()> {
        let expected = self.dimension.filter(|_| !self.vectors.is_empty());
        match expected {
            Some(dim) if dim != vector.len() => {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    actual: vector.len(),
                })
            }
            None if vector.is_empty() => {
                return Err(Error::DimensionMismatch {
                    expected: self.dimension.unwrap_or(1),
                    actual: 0,
                })
            }
            _ => {}
        }
        self.dimension = Some(vector.len());
        self.vectors.insert(key, normalize_embedding(vector));
        Ok(())
    }
}

type PartitionKey = (String, EntityKind);

#[derive(Debug, Default)]
pub struct VectorIndex {
    partitions: DashMap<PartitionKey, Arc<Partition>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self, database: &str, kind: EntityKind) -> Option<Arc<Partition>> {
        self.partitions
            .get(&(database.to_string(), kind))
            .map(|p| Arc::clone(p.value()))
    }

    /// Insert or replace a vector
    pub fn upsert(&self, id: &EntityId, vector: &[f32]) -> Result<()> {
        let mut slot = self
            .partitions
            .entry((id.database.clone(), id.kind))
            .or_default();
        Arc::make_mut(slot.value_mut()).insert(id.key.clone(), vector)?;
        debug!("Indexed {} {} in {}", id.kind, id.key, id.database);
        Ok(())
    }

    /// Returns `true` if the entity was present
    pub fn remove(&self, id: &EntityId) -> bool {
        let Some(mut slot) = self.partitions.get_mut(&(id.database.clone(), id.kind)) else {
            return false;
        };
        if !slot.vectors.contains_key(&id.key) {
            return false;
        }
        Arc::make_mut(slot.value_mut()).vectors.remove(&id.key);
        true
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.snapshot(&id.database, id.kind)
            .is_some_and(|p| p.vectors.contains_key(&id.key))
    }

    /// The `k` entries most cosine-similar to `vector`, best first
    pub fn query(
        &self,
        database: &str,
        kind: EntityKind,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<Neighbor>> {
        let partition = self
            .snapshot(database, kind)
            .filter(|p| !p.vectors.is_empty())
            .ok_or_else(|| Error::EmptyIndex(format!("{}/{}", database, kind)))?;

        if let Some(dim) = partition.dimension {
            if dim != vector.len() {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    actual: vector.len(),
                });
            }
        }

        let query = normalize_embedding(vector);
        let mut neighbors: Vec<Neighbor> = partition
            .vectors
            .iter()
            .map(|(key, v)| Neighbor {
                key: key.clone(),
                similarity: v.iter().zip(query.iter()).map(|(a, b)| a * b).sum(),
            })
            .collect();

        neighbors.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        neighbors.truncate(k);
        Ok(neighbors)
    }

    pub fn len(&self, database: &str, kind: EntityKind) -> usize {
        self.snapshot(database, kind)
            .map(|p| p.vectors.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, database: &str, kind: EntityKind) -> bool {
        self.len(database, kind) == 0
    }

    /// Stored (normalised) vectors of a partition, sorted by key
    pub fn entries(&self, database: &str, kind: EntityKind) -> Vec<(String, Vec<f32>)> {
        let mut entries: Vec<(String, Vec<f32>)> = self
            .snapshot(database, kind)
            .map(|p| {
                p.vectors
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Replace a partition with one built from `entries`
    ///
    /// The new partition is assembled off to the side and swapped in with a
    /// single map insert; concurrent queries see either the old or the new one.
    pub fn rebuild(
        &self,
        database: &str,
        kind: EntityKind,
        entries: Vec<(String, Vec<f32>)>,
    ) -> Result<usize> {
        let mut shadow = Partition::default();
        for (key, vector) in entries {
            shadow.insert(key, &vector)?;
        }
        let count = shadow.vectors.len();
        self.partitions
            .insert((database.to_string(), kind), Arc::new(shadow));
        info!("Rebuilt {} index for {} ({} entries)", kind, database, count);
        Ok(count)
    }

    pub fn drop_database(&self, database: &str) {
        self.partitions.retain(|(db, _), _| db != database);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_orders_by_similarity() {
        let index = VectorIndex::new();
        index.upsert(&EntityId::table("db", "Assets"), &[1.0, 0.0]).unwrap();
        index.upsert(&EntityId::table("db", "Fault_Log"), &[0.8, 0.6]).unwrap();
        index.upsert(&EntityId::table("db", "Staff"), &[0.0, 1.0]).unwrap();

        let hits = index.query("db", EntityKind::Table, &[2.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].key, "assets");
        assert_eq!(hits[1].key, "fault_log");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert!((hits[1].similarity - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_upsert_replaces() {
        let index = VectorIndex::new();
        let id = EntityId::table("db", "Assets");
        index.upsert(&id, &[1.0, 0.0]).unwrap();
        index.upsert(&id, &[0.0, 1.0]).unwrap();
        assert_eq!(index.len("db", EntityKind::Table), 1);
        let hits = index.query("db", EntityKind::Table, &[0.0, 1.0], 5).unwrap();
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_and_missing_partitions() {
        let index = VectorIndex::new();
        let err = index.query("db", EntityKind::Example, &[1.0], 3).unwrap_err();
        assert!(matches!(err, Error::EmptyIndex(_)));

        let id = EntityId::example("db", "e1");
        index.upsert(&id, &[1.0]).unwrap();
        assert!(index.remove(&id));
        assert!(!index.remove(&id));
        assert!(index.query("db", EntityKind::Example, &[1.0], 3).unwrap_err().is_no_results());
    }

    #[test]
    fn test_dimension_mismatch() {
        let index = VectorIndex::new();
        index.upsert(&EntityId::table("db", "a"), &[1.0, 0.0]).unwrap();
        let err = index
            .upsert(&EntityId::table("db", "b"), &[1.0, 0.0, 0.0])
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 2, actual: 3 }));

        let err = index.query("db", EntityKind::Table, &[1.0], 1).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));

        // other partitions are unaffected
        index.upsert(&EntityId::table("other", "b"), &[1.0, 0.0, 0.0]).unwrap();
    }

    #[test]
    fn test_snapshot_survives_writes() {
        let index = VectorIndex::new();
        index.upsert(&EntityId::table("db", "a"), &[1.0, 0.0]).unwrap();
        let before = index.snapshot("db", EntityKind::Table).unwrap();

        index.upsert(&EntityId::table("db", "b"), &[0.0, 1.0]).unwrap();
        index.remove(&EntityId::table("db", "a"));

        assert_eq!(before.vectors.len(), 1);
        assert!(before.vectors.contains_key("a"));
        assert_eq!(index.len("db", EntityKind::Table), 1);
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let index = VectorIndex::new();
        index.upsert(&EntityId::table("db", "stale"), &[1.0, 1.0]).unwrap();

        let entries = vec![
            ("assets".to_string(), vec![3.0, 4.0]),
            ("fault_log".to_string(), vec![0.0, 2.0]),
        ];
        assert_eq!(index.rebuild("db", EntityKind::Table, entries.clone()).unwrap(), 2);
        let first = index.entries("db", EntityKind::Table);
        index.rebuild("db", EntityKind::Table, entries).unwrap();
        assert_eq!(first, index.entries("db", EntityKind::Table));
        assert!(!index.contains(&EntityId::table("db", "stale")));
    }

    #[test]
    fn test_drop_database() {
        let index = VectorIndex::new();
        index.upsert(&EntityId::table("a", "t"), &[1.0]).unwrap();
        index.upsert(&EntityId::example("a", "e"), &[1.0]).unwrap();
        index.upsert(&EntityId::database("a"), &[1.0]).unwrap();
        index.upsert(&EntityId::table("b", "t"), &[1.0]).unwrap();
        index.drop_database("a");
        assert!(index.is_empty("a", EntityKind::Table));
        assert!(index.is_empty("a", EntityKind::Example));
        assert!(index.is_empty("a", EntityKind::Database));
        assert_eq!(index.len("b", EntityKind::Table), 1);
    }
}
