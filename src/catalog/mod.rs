//! Schema catalog
//!
//! Canonical store of table definitions per logical database. Each table
//! carries a blake3 hash of its DDL; the cached embedding is only trusted
//! while `embedded_hash == ddl_hash`. Tables whose embedding is missing or
//! stale sit in a per-database dirty set until the consistency guard picks
//! them up.
//!
//! Alongside tables the catalog keeps an optional description per database
//! and per-column details, see [`details`].

mod details;

pub use details::{ColumnDetail, ColumnDetailInput, DatabaseInfo, DatabaseInfoInput, StaleDatabase};

use crate::error::{Error, Result};
use crate::sql::{self, Column, ForeignKey};
use crate::text;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

/// Hash used for staleness detection of DDL and query text
pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Caller-supplied table definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableInput {
    pub ddl: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl TableInput {
    pub fn new(ddl: impl Into<String>) -> Self {
        Self {
            ddl: ddl.into(),
            ..Self::default()
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
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

/// A table as held by the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRecord {
    pub database_name: String,
    pub name: String,
    pub ddl: String,
    pub aliases: Vec<String>,
    pub description: String,
    pub keywords: Vec<String>,
    pub columns: Vec<Column>,
    pub foreign_keys: Vec<ForeignKey>,
    /// Descriptions of individual columns, in column order
    #[serde(default)]
    pub details: Vec<ColumnDetail>,
    pub ddl_hash: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip)]
    pub embedded_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TableRecord {
    /// Case-folded name used as the catalog and index key
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }

    /// True when there is no embedding for the current DDL
    pub fn is_stale(&self) -> bool {
        self.embedding.is_none() || self.embedded_hash.as_deref() != Some(self.ddl_hash.as_str())
    }

    /// Size charged against a retrieval budget
    pub fn size(&self) -> usize {
        self.ddl.chars().count()
    }

    /// Text sent to the embedding provider
    pub fn embedding_text(&self) -> String {
        let mut text = format!(
            "Database name: {}\nTable: {}\nAliases: {}\nDescription: {}\nKeywords: {}\nDDL: {}",
            self.database_name,
            self.name,
            self.aliases.join(", "),
            self.description,
            self.keywords.join(", "),
            self.ddl
        );
        if !self.details.is_empty() {
            let columns: Vec<String> = self.details.iter().map(ColumnDetail::summary).collect();
            text.push_str(&format!("\nColumns: {}", columns.join("; ")));
        }
        text
    }

    /// Stemmed terms of keywords, aliases, the table name and column details
    pub fn match_terms(&self) -> HashSet<String> {
        let column_terms = self
            .details
            .iter()
            .flat_map(|d| d.keywords.iter().chain(d.aliases.iter()));
        text::term_set(
            self.keywords
                .iter()
                .chain(self.aliases.iter())
                .chain(column_terms)
                .map(String::as_str)
                .chain(std::iter::once(self.name.as_str())),
        )
    }

    fn apply_metadata(&mut self, input: &TableInput) -> bool {
        let changed = self.aliases != input.aliases
            || self.description != input.description
            || self.keywords != input.keywords;
        if changed {
            self.aliases = input.aliases.clone();
            self.description = input.description.clone();
            self.keywords = input.keywords.clone();
        }
        changed
    }
}

/// Result of [`SchemaCatalog::upsert_table`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    /// DDL changed; the table needs a new embedding
    Changed,
    /// DDL unchanged; metadata may have been updated in place
    Unchanged,
}

/// A table waiting for an embedding
#[derive(Debug, Clone, PartialEq)]
pub struct StaleTable {
    pub database: String,
    pub name: String,
    pub ddl_hash: String,
    pub text: String,
}

/// Directed foreign-key relation between two tables of one database
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ForeignKeyEdge {
    pub database: String,
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: Option<String>,
}

#[derive(Debug, Default)]
struct DatabaseSchema {
    tables: HashMap<String, TableRecord>,
    dirty: BTreeSet<String>,
    info: Option<DatabaseInfo>,
    info_dirty: bool,
}

/// Tables of all logical databases
#[derive(Debug, Default)]
pub struct SchemaCatalog {
    databases: DashMap<String, DatabaseSchema>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a table from its DDL
    ///
    /// A new table or a changed DDL hash drops the cached embedding and marks
    /// the table dirty. Alias, description and keyword edits take effect
    /// immediately and leave the embedding alone.
    pub fn upsert_table(&self, database: &str, input: TableInput) -> Result<UpsertOutcome> {
        let def = sql::parse_create_table(&input.ddl)?;
        let hash = content_hash(&input.ddl);
        let key = def.name.to_lowercase();

        let mut schema = self.databases.entry(database.to_string()).or_default();

        let outcome = match schema.tables.get_mut(&key) {
            Some(existing) if existing.ddl_hash == hash => {
                if existing.apply_metadata(&input) {
                    existing.updated_at = Utc::now();
                    debug!("Updated metadata of {}.{}", database, existing.name);
                }
                UpsertOutcome::Unchanged
            }
            Some(existing) => {
                existing.apply_metadata(&input);
                existing.details.retain(|d| {
                    def.columns
                        .iter()
                        .any(|c| c.name.eq_ignore_ascii_case(&d.field_name))
                });
                existing.name = def.name;
                existing.ddl = input.ddl;
                existing.columns = def.columns;
                existing.foreign_keys = def.foreign_keys;
                existing.ddl_hash = hash;
                existing.embedding = None;
                existing.embedded_hash = None;
                existing.updated_at = Utc::now();
                UpsertOutcome::Changed
            }
            None => {
                let record = TableRecord {
                    database_name: database.to_string(),
                    name: def.name,
                    ddl: input.ddl,
                    aliases: input.aliases,
                    description: input.description,
                    keywords: input.keywords,
                    columns: def.columns,
                    foreign_keys: def.foreign_keys,
                    details: Vec::new(),
                    ddl_hash: hash,
                    embedding: None,
                    embedded_hash: None,
                    updated_at: Utc::now(),
                };
                schema.tables.insert(key.clone(), record);
                UpsertOutcome::Created
            }
        };

        if outcome != UpsertOutcome::Unchanged {
            schema.dirty.insert(key.clone());
            info!("Table {}.{} {:?}, queued for embedding", database, key, outcome);
        }
        Ok(outcome)
    }

    /// Look up a table by case-insensitive name
    pub fn get_table(&self, database: &str, name: &str) -> Result<TableRecord> {
        self.databases
            .get(database)
            .and_then(|schema| schema.tables.get(&name.to_lowercase()).cloned())
            .ok_or_else(|| Error::NotFound(format!("table {}.{}", database, name)))
    }

    pub fn contains_table(&self, database: &str, name: &str) -> bool {
        self.databases
            .get(database)
            .is_some_and(|schema| schema.tables.contains_key(&name.to_lowercase()))
    }

    /// All tables of a database, sorted by name
    pub fn list_tables(&self, database: &str) -> Vec<TableRecord> {
        let mut tables: Vec<TableRecord> = self
            .databases
            .get(database)
            .map(|schema| schema.tables.values().cloned().collect())
            .unwrap_or_default();
        tables.sort_by_key(|t| t.key());
        tables
    }

    pub fn list_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .databases
            .iter()
            .filter(|entry| !entry.tables.is_empty() || entry.info.is_some())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn remove_table(&self, database: &str, name: &str) -> Result<TableRecord> {
        let key = name.to_lowercase();
        let mut schema = self
            .databases
            .get_mut(database)
            .ok_or_else(|| Error::NotFound(format!("table {}.{}", database, name)))?;
        schema.dirty.remove(&key);
        let removed = schema
            .tables
            .remove(&key)
            .ok_or_else(|| Error::NotFound(format!("table {}.{}", database, name)))?;
        info!("Removed table {}.{}", database, removed.name);
        Ok(removed)
    }

    /// Take every dirty table across all databases
    pub fn drain_dirty(&self) -> Vec<StaleTable> {
        let databases: Vec<String> = self.databases.iter().map(|e| e.key().clone()).collect();
        databases
            .iter()
            .flat_map(|db| self.drain_dirty_for(db))
            .collect()
    }

    /// Take the dirty tables of one database
    pub fn drain_dirty_for(&self, database: &str) -> Vec<StaleTable> {
        let Some(mut schema) = self.databases.get_mut(database) else {
            return Vec::new();
        };
        let dirty = std::mem::take(&mut schema.dirty);
        dirty
            .into_iter()
            .filter_map(|key| schema.tables.get(&key))
            .map(|record| StaleTable {
                database: database.to_string(),
                name: record.key(),
                ddl_hash: record.ddl_hash.clone(),
                text: record.embedding_text(),
            })
            .collect()
    }

    /// Re-queue a table, typically after a failed embedding call
    pub fn mark_dirty(&self, database: &str, name: &str) {
        let key = name.to_lowercase();
        if let Some(mut schema) = self.databases.get_mut(database) {
            if schema.tables.contains_key(&key) {
                schema.dirty.insert(key);
            }
        }
    }

    pub fn dirty_count(&self, database: &str) -> usize {
        self.databases
            .get(database)
            .map(|schema| schema.dirty.len())
            .unwrap_or(0)
    }

    /// Store `vector` if the table's DDL still hashes to `hash`
    ///
    /// Returns `false` when the table is gone or its DDL moved on.
    pub fn attach_embedding(&self, database: &str, name: &str, hash: &str, vector: Vec<f32>) -> bool {
        let Some(mut schema) = self.databases.get_mut(database) else {
            return false;
        };
        match schema.tables.get_mut(&name.to_lowercase()) {
            Some(record) if record.ddl_hash == hash => {
                record.embedding = Some(vector);
                record.embedded_hash = Some(hash.to_string());
                true
            }
            _ => false,
        }
    }

    /// Load a persisted record; its embedding is kept only if `stored_hash`
    /// matches the DDL and the vector has the expected dimension
    pub fn restore_table(
        &self,
        mut record: TableRecord,
        embedding: Option<Vec<f32>>,
        stored_hash: &str,
        dimension: usize,
    ) -> Result<bool> {
        let def = sql::parse_create_table(&record.ddl)?;
        record.name = def.name;
        record.details.retain(|d| {
            def.columns
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&d.field_name))
        });
        record.columns = def.columns;
        record.foreign_keys = def.foreign_keys;
        record.ddl_hash = content_hash(&record.ddl);

        let fresh = record.ddl_hash == stored_hash
            && embedding.as_ref().is_some_and(|v| v.len() == dimension);
        if fresh {
            record.embedding = embedding;
            record.embedded_hash = Some(stored_hash.to_string());
        } else {
            record.embedding = None;
            record.embedded_hash = None;
        }

        let key = record.key();
        let mut schema = self
            .databases
            .entry(record.database_name.clone())
            .or_default();
        if !fresh {
            schema.dirty.insert(key.clone());
        }
        schema.tables.insert(key, record);
        Ok(fresh)
    }

    /// Insert or replace column details of a table
    ///
    /// Every field must name a column of the table's DDL, otherwise nothing
    /// is applied. Details feed the table's embedding text, so a change
    /// re-queues the table. Returns whether anything changed.
    pub fn update_table_details(
        &self,
        database: &str,
        table: &str,
        inputs: Vec<ColumnDetailInput>,
    ) -> Result<bool> {
        let not_found = || Error::NotFound(format!("table {}.{}", database, table));
        let key = table.to_lowercase();
        let mut guard = self.databases.get_mut(database).ok_or_else(not_found)?;
        let schema = &mut *guard;
        let record = schema.tables.get_mut(&key).ok_or_else(not_found)?;

        let mut incoming = Vec::with_capacity(inputs.len());
        for input in inputs {
            let column = record
                .columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(&input.field_name))
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "column {}.{}.{}",
                        database, record.name, input.field_name
                    ))
                })?;
            incoming.push(ColumnDetail {
                field_name: column.name.clone(),
                data_type: input
                    .data_type
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| column.data_type.clone()),
                aliases: input.aliases,
                description: input.description,
                keywords: input.keywords,
            });
        }

        let mut changed = false;
        for detail in incoming {
            match record
                .details
                .iter_mut()
                .find(|d| d.field_name.eq_ignore_ascii_case(&detail.field_name))
            {
                Some(existing) if *existing == detail => {}
                Some(existing) => {
                    *existing = detail;
                    changed = true;
                }
                None => {
                    record.details.push(detail);
                    changed = true;
                }
            }
        }

        if changed {
            let columns = &record.columns;
            record.details.sort_by_key(|d| {
                columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(&d.field_name))
            });
            record.updated_at = Utc::now();
            schema.dirty.insert(key);
            info!(
                "Updated column details of {}.{}, queued for embedding",
                database, record.name
            );
        }
        Ok(changed)
    }

    /// Column details of a table in column order
    pub fn get_table_details(&self, database: &str, table: &str) -> Result<Vec<ColumnDetail>> {
        self.get_table(database, table).map(|record| record.details)
    }

    /// Set the description of a database
    ///
    /// Unlike table metadata, every field of a database description is part
    /// of its embedding, so any change re-queues it.
    pub fn set_database_info(&self, database: &str, input: DatabaseInfoInput) -> UpsertOutcome {
        let info = DatabaseInfo::new(database, input);
        let mut schema = self.databases.entry(database.to_string()).or_default();
        let outcome = match &schema.info {
            Some(existing) if existing.content_hash == info.content_hash => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Changed,
            None => UpsertOutcome::Created,
        };
        if outcome != UpsertOutcome::Unchanged {
            schema.info = Some(info);
            schema.info_dirty = true;
            info!("Database info of {} {:?}, queued for embedding", database, outcome);
        }
        outcome
    }

    pub fn get_database_info(&self, database: &str) -> Result<DatabaseInfo> {
        self.databases
            .get(database)
            .and_then(|schema| schema.info.clone())
            .ok_or_else(|| Error::NotFound(format!("database info for {}", database)))
    }

    pub fn remove_database_info(&self, database: &str) -> Result<DatabaseInfo> {
        let not_found = || Error::NotFound(format!("database info for {}", database));
        let mut schema = self.databases.get_mut(database).ok_or_else(not_found)?;
        schema.info_dirty = false;
        let removed = schema.info.take().ok_or_else(not_found)?;
        info!("Removed database info of {}", database);
        Ok(removed)
    }

    /// Databases that carry a description, sorted
    pub fn described_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .databases
            .iter()
            .filter(|entry| entry.info.is_some())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Take every database description waiting for an embedding
    pub fn drain_dirty_databases(&self) -> Vec<StaleDatabase> {
        let databases: Vec<String> = self.databases.iter().map(|e| e.key().clone()).collect();
        databases
            .iter()
            .filter_map(|db| self.drain_dirty_database(db))
            .collect()
    }

    pub fn drain_dirty_database(&self, database: &str) -> Option<StaleDatabase> {
        let mut schema = self.databases.get_mut(database)?;
        if !std::mem::take(&mut schema.info_dirty) {
            return None;
        }
        schema.info.as_ref().map(|info| StaleDatabase {
            database: database.to_string(),
            content_hash: info.content_hash.clone(),
            text: info.embedding_text(),
        })
    }

    pub fn mark_database_dirty(&self, database: &str) {
        if let Some(mut schema) = self.databases.get_mut(database) {
            if schema.info.is_some() {
                schema.info_dirty = true;
            }
        }
    }

    pub fn is_database_dirty(&self, database: &str) -> bool {
        self.databases
            .get(database)
            .is_some_and(|schema| schema.info_dirty)
    }

    /// Store `vector` if the database description still hashes to `hash`
    pub fn attach_database_embedding(&self, database: &str, hash: &str, vector: Vec<f32>) -> bool {
        let Some(mut schema) = self.databases.get_mut(database) else {
            return false;
        };
        match schema.info.as_mut() {
            Some(info) if info.content_hash == hash => {
                info.embedding = Some(vector);
                info.embedded_hash = Some(hash.to_string());
                true
            }
            _ => false,
        }
    }

    /// Load a persisted database description; same rules as [`Self::restore_table`]
    pub fn restore_database_info(
        &self,
        info: DatabaseInfo,
        embedding: Option<Vec<f32>>,
        stored_hash: &str,
        dimension: usize,
    ) -> bool {
        let mut info = DatabaseInfo {
            updated_at: info.updated_at,
            ..DatabaseInfo::new(
                &info.database_name,
                DatabaseInfoInput {
                    aliases: info.aliases,
                    description: info.description,
                    keywords: info.keywords,
                },
            )
        };
        let fresh = info.content_hash == stored_hash
            && embedding.as_ref().is_some_and(|v| v.len() == dimension);
        if fresh {
            info.embedding = embedding;
            info.embedded_hash = Some(stored_hash.to_string());
        }

        let mut schema = self
            .databases
            .entry(info.database_name.clone())
            .or_default();
        schema.info = Some(info);
        schema.info_dirty = !fresh;
        fresh
    }

    /// `(database, vector)` if the database description has a valid embedding
    pub fn embedded_database(&self, database: &str) -> Vec<(String, Vec<f32>)> {
        self.databases
            .get(database)
            .and_then(|schema| {
                let info = schema.info.as_ref().filter(|info| !info.is_stale())?;
                Some((database.to_string(), info.embedding.clone()?))
            })
            .into_iter()
            .collect()
    }

    /// Foreign keys whose target table exists in the same database
    pub fn foreign_key_edges(&self, database: &str) -> Vec<ForeignKeyEdge> {
        let Some(schema) = self.databases.get(database) else {
            return Vec::new();
        };
        let tables = &schema.tables;
        let mut edges: Vec<ForeignKeyEdge> = tables
            .values()
            .flat_map(|table| {
                table.foreign_keys.iter().filter_map(move |fk| {
                    let target = tables.get(&fk.target.table.to_lowercase())?;
                    Some(ForeignKeyEdge {
                        database: database.to_string(),
                        source_table: table.name.clone(),
                        source_column: fk.column.clone(),
                        target_table: target.name.clone(),
                        target_column: fk.target.column.clone(),
                    })
                })
            })
            .collect();
        edges.sort();
        edges
    }

    /// Undirected adjacency over table keys, self-references excluded
    pub fn neighbours(&self, database: &str) -> HashMap<String, HashSet<String>> {
        let mut adjacency: HashMap<String, HashSet<String>> = HashMap::new();
        for edge in self.foreign_key_edges(database) {
            let source = edge.source_table.to_lowercase();
            let target = edge.target_table.to_lowercase();
            if source == target {
                continue;
            }
            adjacency.entry(source.clone()).or_default().insert(target.clone());
            adjacency.entry(target).or_default().insert(source);
        }
        adjacency
    }

    /// `(key, vector)` of every table with a valid embedding
    pub fn embedded_tables(&self, database: &str) -> Vec<(String, Vec<f32>)> {
        let Some(schema) = self.databases.get(database) else {
            return Vec::new();
        };
        schema
            .tables
            .iter()
            .filter(|(_, record)| !record.is_stale())
            .filter_map(|(key, record)| Some((key.clone(), record.embedding.clone()?)))
            .collect()
    }
}
