//! Persistent storage of embedded tables, examples and database descriptions
//!
//! This module provides:
//! - The `VectorStore` trait the engine persists through
//! - A pgvector implementation over `sqlx` (feature `pgvector`)
//! - An in-memory implementation for tests and embedded use
//! - pgvector text literal encoding

mod memory;
#[cfg(feature = "pgvector")]
mod pgvector;
mod schema;

pub use memory::MemoryStore;
#[cfg(feature = "pgvector")]
pub use pgvector::PgVectorStore;
pub use schema::*;

use crate::error::{Error, Result};
use crate::index::EntityKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One persisted row: an entity, its vector and the hash the vector was computed from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub kind: EntityKind,
    /// Lowercased table name, example id or database name
    pub id: String,
    pub database_name: String,
    pub embedding: Vec<f32>,
    pub content_hash: String,
    /// Serialized `TableRecord`, `ExampleRecord` or `DatabaseInfo`
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

/// Storage backend for embedded entities
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create relations and indexes if missing
    async fn init(&self) -> Result<()>;

    /// Insert or replace rows keyed by `(kind, database_name, id)`
    async fn upsert(&self, entities: &[StoredEntity]) -> Result<()>;

    /// Returns `true` if a row was deleted
    async fn delete(&self, kind: EntityKind, database: &str, id: &str) -> Result<bool>;

    /// Rows of one kind, optionally limited to one database, ordered by database and id
    async fn load(&self, kind: EntityKind, database: Option<&str>) -> Result<Vec<StoredEntity>>;
}

/// Encode a vector as a pgvector text literal, e.g. `[0.1,0.2]`
pub fn format_vector(vector: &[f32]) -> String {
    let body: Vec<String> = vector.iter().map(|v| v.to_string()).collect();
    format!("[{}]", body.join(","))
}

/// Decode a pgvector text literal
pub fn parse_vector(literal: &str) -> Result<Vec<f32>> {
    let inner = literal
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| Error::Config(format!("Malformed vector literal: {}", literal)))?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|e| Error::Config(format!("Malformed vector component '{}': {}", part, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_literal() {
        let literal = format_vector(&[0.5, -1.0, 0.25]);
        assert_eq!(literal, "[0.5,-1,0.25]");
        assert_eq!(parse_vector(&literal).unwrap(), vec![0.5, -1.0, 0.25]);
        assert_eq!(parse_vector(" [1, 2e-3] ").unwrap(), vec![1.0, 0.002]);
        assert!(parse_vector("[]").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_vector_literal() {
        assert!(parse_vector("1,2").is_err());
        assert!(parse_vector("[1,x]").is_err());
    }
}
