//! Example store: historical (question, SQL) exemplars per database

use crate::catalog::content_hash;
use crate::error::{Error, Result};
use crate::sql;
use crate::text;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

/// Stable example id: the same query in the same database always maps to the same id
pub fn example_id(database: &str, query: &str) -> String {
    let name = format!("{}\u{0}{}", database, query.trim());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Hash over everything that goes into an example's embedding text
fn example_hash(query: &str, description: &str, keywords: &[String]) -> String {
    content_hash(&format!(
        "{}\u{0}{}\u{0}{}",
        query.trim(),
        description,
        keywords.join(",")
    ))
}

/// Caller-supplied example
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExampleInput {
    pub query: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl ExampleInput {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExampleRecord {
    pub id: String,
    pub database_name: String,
    pub query: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub referenced_tables: Vec<String>,
    pub content_hash: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip)]
    pub embedded_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExampleRecord {
    pub fn is_stale(&self) -> bool {
        self.embedding.is_none()
            || self.embedded_hash.as_deref() != Some(self.content_hash.as_str())
    }

    /// Size charged against a retrieval budget
    pub fn size(&self) -> usize {
        self.query.chars().count()
    }

    pub fn embedding_text(&self) -> String {
        format!(
            "Database name: {}\nDescription: {}\nKeywords: {}\nQuery: {}",
            self.database_name,
            self.description,
            self.keywords.join(", "),
            self.query
        )
    }

    pub fn match_terms(&self) -> HashSet<String> {
        text::term_set(self.keywords.iter().map(String::as_str))
    }
}

/// An example waiting for an embedding
#[derive(Debug, Clone, PartialEq)]
pub struct PendingExample {
    pub database: String,
    pub id: String,
    pub content_hash: String,
    pub text: String,
}

#[derive(Debug, Default)]
struct DatabaseExamples {
    /// Insertion order
    items: Vec<ExampleRecord>,
    pending: BTreeSet<String>,
}

impl DatabaseExamples {
    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|e| e.id == id)
    }
}

#[derive(Debug, Default)]
pub struct ExampleStore {
    databases: DashMap<String, DatabaseExamples>,
}

impl ExampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store an example, returning its record
    ///
    /// Re-adding the same query replaces description and keywords in place.
    /// The embedding text covers those fields, so any change re-queues the example.
    pub fn add_example(&self, database: &str, input: ExampleInput) -> Result<ExampleRecord> {
        let query = input.query.trim().to_string();
        let shape = sql::validate_query(&query)?;
        let id = example_id(database, &query);
        let hash = example_hash(&query, &input.description, &input.keywords);

        let mut examples = self.databases.entry(database.to_string()).or_default();
        let record = match examples.position(&id) {
            Some(pos) if examples.items[pos].content_hash == hash => {
                debug!("Example {} unchanged", id);
                return Ok(examples.items[pos].clone());
            }
            Some(pos) => {
                let existing = &mut examples.items[pos];
                existing.description = input.description;
                existing.keywords = input.keywords;
                existing.content_hash = hash;
                existing.embedding = None;
                existing.embedded_hash = None;
                existing.clone()
            }
            None => {
                let record = ExampleRecord {
                    id: id.clone(),
                    database_name: database.to_string(),
                    query,
                    description: input.description,
                    keywords: input.keywords,
                    referenced_tables: shape.referenced_tables,
                    content_hash: hash,
                    embedding: None,
                    embedded_hash: None,
                    created_at: Utc::now(),
                };
                examples.items.push(record.clone());
                record
            }
        };
        examples.pending.insert(id.clone());
        info!("Example {} stored in {}, queued for embedding", id, database);
        Ok(record)
    }

    pub fn get_example(&self, database: &str, id: &str) -> Result<ExampleRecord> {
        self.databases
            .get(database)
            .and_then(|examples| examples.items.iter().find(|e| e.id == id).cloned())
            .ok_or_else(|| Error::NotFound(format!("example {} in {}", id, database)))
    }

    /// All examples of a database in insertion order
    pub fn list_examples(&self, database: &str) -> Vec<ExampleRecord> {
        self.databases
            .get(database)
            .map(|examples| examples.items.clone())
            .unwrap_or_default()
    }

    /// Examples of a database that reference `table`, matched case-insensitively
    pub fn list_examples_for_table(&self, database: &str, table: &str) -> Vec<ExampleRecord> {
        let table = table.to_lowercase();
        self.databases
            .get(database)
            .map(|examples| {
                examples
                    .items
                    .iter()
                    .filter(|e| e.referenced_tables.iter().any(|t| t.to_lowercase() == table))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .databases
            .iter()
            .filter(|entry| !entry.items.is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn remove_example(&self, database: &str, id: &str) -> Result<ExampleRecord> {
        let not_found = || Error::NotFound(format!("example {} in {}", id, database));
        let mut examples = self.databases.get_mut(database).ok_or_else(not_found)?;
        let pos = examples.position(id).ok_or_else(not_found)?;
        examples.pending.remove(id);
        Ok(examples.items.remove(pos))
    }

    pub fn drain_pending(&self) -> Vec<PendingExample> {
        let databases: Vec<String> = self.databases.iter().map(|e| e.key().clone()).collect();
        databases
            .iter()
            .flat_map(|db| self.drain_pending_for(db))
            .collect()
    }

    pub fn drain_pending_for(&self, database: &str) -> Vec<PendingExample> {
        let Some(mut examples) = self.databases.get_mut(database) else {
            return Vec::new();
        };
        let pending = std::mem::take(&mut examples.pending);
        pending
            .into_iter()
            .filter_map(|id| examples.items.iter().find(|e| e.id == id))
            .map(|record| PendingExample {
                database: database.to_string(),
                id: record.id.clone(),
                content_hash: record.content_hash.clone(),
                text: record.embedding_text(),
            })
            .collect()
    }

    pub fn mark_pending(&self, database: &str, id: &str) {
        if let Some(mut examples) = self.databases.get_mut(database) {
            if examples.position(id).is_some() {
                examples.pending.insert(id.to_string());
            }
        }
    }

    pub fn pending_count(&self, database: &str) -> usize {
        self.databases
            .get(database)
            .map(|examples| examples.pending.len())
            .unwrap_or(0)
    }

    /// Store `vector` if the example content still hashes to `hash`
    pub fn attach_embedding(&self, database: &str, id: &str, hash: &str, vector: Vec<f32>) -> bool {
        let Some(mut examples) = self.databases.get_mut(database) else {
            return false;
        };
        match examples.items.iter_mut().find(|e| e.id == id) {
            Some(record) if record.content_hash == hash => {
                record.embedding = Some(vector);
                record.embedded_hash = Some(hash.to_string());
                true
            }
            _ => false,
        }
    }

    /// Load a persisted example, keeping its embedding only if still valid
    pub fn restore_example(
        &self,
        mut record: ExampleRecord,
        embedding: Option<Vec<f32>>,
        stored_hash: &str,
        dimension: usize,
    ) -> Result<bool> {
        record.query = record.query.trim().to_string();
        let shape = sql::validate_query(&record.query)?;
        record.referenced_tables = shape.referenced_tables;
        record.id = example_id(&record.database_name, &record.query);
        record.content_hash = example_hash(&record.query, &record.description, &record.keywords);

        let fresh = record.content_hash == stored_hash
            && embedding.as_ref().is_some_and(|v| v.len() == dimension);
        if fresh {
            record.embedding = embedding;
            record.embedded_hash = Some(stored_hash.to_string());
        } else {
            record.embedding = None;
            record.embedded_hash = None;
        }

        let mut examples = self
            .databases
            .entry(record.database_name.clone())
            .or_default();
        if !fresh {
            examples.pending.insert(record.id.clone());
        }
        match examples.position(&record.id) {
            Some(pos) => examples.items[pos] = record,
            None => examples.items.push(record),
        }
        Ok(fresh)
    }

    /// `(id, vector)` of every example with a valid embedding
    pub fn embedded_examples(&self, database: &str) -> Vec<(String, Vec<f32>)> {
        let Some(examples) = self.databases.get(database) else {
            return Vec::new();
        };
        examples
            .items
            .iter()
            .filter(|e| !e.is_stale())
            .filter_map(|e| Some((e.id.clone(), e.embedding.clone()?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECENT_FAULTS: &str = "SELECT a.asset_id, f.fault_description \
        FROM Assets a JOIN Fault_Log f ON a.asset_id = f.asset_id \
        WHERE f.fault_log_entry_datetime >= date('now', '-1 month')";

    fn recent_faults() -> ExampleInput {
        ExampleInput::new(RECENT_FAULTS)
            .with_description("Recent fault analysis for assets")
            .with_keywords(text::split_list("faults,assets,recent,maintenance"))
    }

    #[test]
    fn test_add_example_extracts_tables() {
        let store = ExampleStore::new();
        let record = store.add_example("assets_maintenance", recent_faults()).unwrap();
        assert_eq!(record.referenced_tables, vec!["Assets", "Fault_Log"]);
        assert_eq!(record.id, example_id("assets_maintenance", RECENT_FAULTS));
        assert_eq!(store.pending_count("assets_maintenance"), 1);
    }

    #[test]
    fn test_invalid_query_rejected() {
        let store = ExampleStore::new();
        let err = store
            .add_example("db", ExampleInput::new("SELEC * FROM t"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
        assert!(store.list_examples("db").is_empty());
    }

    #[test]
    fn test_readding_is_idempotent() {
        let store = ExampleStore::new();
        let db = "assets_maintenance";
        let first = store.add_example(db, recent_faults()).unwrap();
        let pending = store.drain_pending_for(db);
        assert!(store.attach_embedding(db, &first.id, &pending[0].content_hash, vec![1.0]));

        store.add_example(db, recent_faults()).unwrap();
        assert_eq!(store.list_examples(db).len(), 1);
        assert_eq!(store.pending_count(db), 0);
        assert!(!store.get_example(db, &first.id).unwrap().is_stale());

        store
            .add_example(db, recent_faults().with_description("Faults logged in the last 30 days"))
            .unwrap();
        assert_eq!(store.pending_count(db), 1);
        assert!(store.get_example(db, &first.id).unwrap().is_stale());
    }

    #[test]
    fn test_insertion_order() {
        let store = ExampleStore::new();
        for table in ["Staff", "Assets", "Engineer_Visits"] {
            store
                .add_example("db", ExampleInput::new(format!("SELECT * FROM {}", table)))
                .unwrap();
        }
        let tables: Vec<String> = store
            .list_examples("db")
            .into_iter()
            .map(|e| e.referenced_tables[0].clone())
            .collect();
        assert_eq!(tables, vec!["Staff", "Assets", "Engineer_Visits"]);
    }

    #[test]
    fn test_remove_and_pending() {
        let store = ExampleStore::new();
        let record = store.add_example("db", recent_faults()).unwrap();
        store.remove_example("db", &record.id).unwrap();
        assert_eq!(store.pending_count("db"), 0);
        assert!(matches!(
            store.get_example("db", &record.id),
            Err(Error::NotFound(_))
        ));

        store.mark_pending("db", &record.id);
        assert_eq!(store.pending_count("db"), 0);
    }

    #[test]
    fn test_surrounding_whitespace_is_not_a_change() {
        let store = ExampleStore::new();
        let db = "assets_maintenance";
        let first = store.add_example(db, ExampleInput::new("SELECT * FROM Staff")).unwrap();
        let pending = store.drain_pending_for(db);
        assert!(store.attach_embedding(db, &first.id, &pending[0].content_hash, vec![1.0]));

        let again = store
            .add_example(db, ExampleInput::new("  SELECT * FROM Staff \n"))
            .unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.content_hash, first.content_hash);
        assert_eq!(again.query, "SELECT * FROM Staff");
        assert_eq!(store.pending_count(db), 0);
        assert!(!store.get_example(db, &first.id).unwrap().is_stale());
    }

    #[test]
    fn test_list_examples_for_table() {
        let store = ExampleStore::new();
        let db = "assets_maintenance";
        store.add_example(db, recent_faults()).unwrap();
        store.add_example(db, ExampleInput::new("SELECT * FROM Staff")).unwrap();

        let faults = store.list_examples_for_table(db, "fault_log");
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].query, RECENT_FAULTS);
        assert_eq!(store.list_examples_for_table(db, "ASSETS").len(), 1);
        assert_eq!(store.list_examples_for_table(db, "Staff").len(), 1);
        assert!(store.list_examples_for_table(db, "Parts").is_empty());
        assert!(store.list_examples_for_table("other", "Staff").is_empty());
    }

    #[test]
    fn test_same_query_different_databases() {
        assert_ne!(example_id("a", RECENT_FAULTS), example_id("b", RECENT_FAULTS));
        assert_eq!(example_id("a", RECENT_FAULTS), example_id("a", &format!(" {} ", RECENT_FAULTS)));
    }
}
