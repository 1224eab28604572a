//! The engine: one owner for catalog, examples, index, guard and retriever
//!
//! Writes to a database serialise on that database's lock; reads never take
//! it. In `sync` mode every write is followed by a reconcile of the written
//! database, in `deferred` mode the caller runs [`Engine::reconcile`].

use crate::catalog::{
    ColumnDetail, ColumnDetailInput, DatabaseInfo, DatabaseInfoInput, ForeignKeyEdge,
    SchemaCatalog, TableInput, TableRecord, UpsertOutcome,
};
use crate::config::{Config, ReconcileMode};
use crate::embed::{create_embedder, Embedder};
use crate::error::{Error, Result};
use crate::exemplars::{ExampleInput, ExampleRecord, ExampleStore};
use crate::guard::{ConsistencyGuard, DatabaseLocks, ReconcileStats};
use crate::index::{EntityId, EntityKind, VectorIndex};
use crate::retrieve::{ContextBundle, DatabaseMatch, RetrievalParams, Retriever};
use crate::sql;
use crate::store::{StoredEntity, VectorStore};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of [`Engine::restore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreStats {
    pub tables: usize,
    pub examples: usize,
    /// Database descriptions
    pub databases: usize,
    /// Rows whose stored hash or dimension no longer matched; queued for re-embedding
    pub stale: usize,
    /// Rows whose payload could not be read back
    pub skipped: usize,
}

pub struct Engine {
    config: Config,
    catalog: Arc<SchemaCatalog>,
    examples: Arc<ExampleStore>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    store: Option<Arc<dyn VectorStore>>,
    locks: Arc<DatabaseLocks>,
    guard: ConsistencyGuard,
    retriever: Retriever,
    params: RetrievalParams,
}

impl Engine {
    /// Build an engine around an embedder, without persistence
    pub fn new(config: Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        config.validate()?;
        let catalog = Arc::new(SchemaCatalog::new());
        let examples = Arc::new(ExampleStore::new());
        let index = Arc::new(VectorIndex::new());
        let locks = Arc::new(DatabaseLocks::new());
        let params = RetrievalParams::from_config(&config.retrieval, &config.embedding);

        let guard = Self::build_guard(
            &config,
            &catalog,
            &examples,
            &index,
            &embedder,
            None,
            &locks,
        );
        let retriever = Retriever::new(
            Arc::clone(&catalog),
            Arc::clone(&examples),
            Arc::clone(&index),
            Arc::clone(&embedder),
        );

        info!(
            "Engine ready (model {}, {} mode)",
            embedder.model_name(),
            config.consistency.mode
        );
        Ok(Self {
            config,
            catalog,
            examples,
            index,
            embedder,
            store: None,
            locks,
            guard,
            retriever,
            params,
        })
    }

    /// Build an engine with the embedder named in `[embedding]`
    pub fn from_config(config: Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        Self::new(config, embedder)
    }

    /// Connect to Postgres per `[store]`, create relations and reload saved state
    #[cfg(feature = "pgvector")]
    pub async fn connect(config: Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let store =
            crate::store::PgVectorStore::connect(&config.store, embedder.dimension()).await?;
        let engine = Self::new(config, embedder)?.with_store(Arc::new(store));
        engine.init_store().await?;
        engine.restore().await?;
        Ok(engine)
    }

    /// Attach a persistent store; reconciled entities are written through to it
    pub fn with_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.guard = Self::build_guard(
            &self.config,
            &self.catalog,
            &self.examples,
            &self.index,
            &self.embedder,
            Some(Arc::clone(&store)),
            &self.locks,
        );
        self.store = Some(store);
        self
    }

    fn build_guard(
        config: &Config,
        catalog: &Arc<SchemaCatalog>,
        examples: &Arc<ExampleStore>,
        index: &Arc<VectorIndex>,
        embedder: &Arc<dyn Embedder>,
        store: Option<Arc<dyn VectorStore>>,
        locks: &Arc<DatabaseLocks>,
    ) -> ConsistencyGuard {
        ConsistencyGuard::new(
            Arc::clone(catalog),
            Arc::clone(examples),
            Arc::clone(index),
            Arc::clone(embedder),
            store,
            Arc::clone(locks),
            config.embedding.batch_size,
            config.embedding.timeout(),
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mode(&self) -> ReconcileMode {
        self.config.consistency.mode
    }

    fn require_store(&self) -> Result<&Arc<dyn VectorStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| Error::Config("No vector store attached".to_string()))
    }

    pub async fn init_store(&self) -> Result<()> {
        self.require_store()?.init().await
    }

    async fn after_write(&self, database: &str) -> Result<()> {
        if self.mode() == ReconcileMode::Sync {
            self.guard.reconcile_database(database).await?;
        }
        Ok(())
    }

    // ===== Tables =====

    /// Insert or update a table
    ///
    /// In `sync` mode the table is embedded before this returns. If that
    /// embedding fails the error is returned, but the table stays in the
    /// catalog and is picked up by the next reconcile.
    pub async fn upsert_table(&self, database: &str, input: TableInput) -> Result<UpsertOutcome> {
        let name = sql::parse_create_table(&input.ddl)?.name;
        let outcome = {
            let lock = self.locks.lock_for(database);
            let _guard = lock.lock().await;
            let outcome = self.catalog.upsert_table(database, input)?;
            if outcome == UpsertOutcome::Unchanged {
                let record = self.catalog.get_table(database, &name)?;
                self.persist_metadata(&record).await?;
            }
            outcome
        };

        if outcome != UpsertOutcome::Unchanged {
            self.after_write(database).await?;
        }
        Ok(outcome)
    }

    /// Metadata edits do not re-embed, so an embedded record is written through as is
    async fn persist_metadata(&self, record: &TableRecord) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(embedding) = record.embedding.as_ref().filter(|_| !record.is_stale()) else {
            return Ok(());
        };
        let row = StoredEntity {
            kind: EntityKind::Table,
            id: record.key(),
            database_name: record.database_name.clone(),
            embedding: embedding.clone(),
            content_hash: record.ddl_hash.clone(),
            payload: serde_json::to_value(record)?,
            updated_at: Utc::now(),
        };
        store.upsert(std::slice::from_ref(&row)).await
    }

    pub fn get_table(&self, database: &str, name: &str) -> Result<TableRecord> {
        self.catalog.get_table(database, name)
    }

    pub fn list_tables(&self, database: &str) -> Vec<TableRecord> {
        self.catalog.list_tables(database)
    }

    /// Databases that hold at least one table, example or description
    pub fn list_databases(&self) -> Vec<String> {
        let names: BTreeSet<String> = self
            .catalog
            .list_databases()
            .into_iter()
            .chain(self.examples.list_databases())
            .collect();
        names.into_iter().collect()
    }

    pub fn foreign_key_edges(&self, database: &str) -> Vec<ForeignKeyEdge> {
        self.catalog.foreign_key_edges(database)
    }

    pub async fn remove_table(&self, database: &str, name: &str) -> Result<TableRecord> {
        let lock = self.locks.lock_for(database);
        let _guard = lock.lock().await;
        let removed = self.catalog.remove_table(database, name)?;
        self.index.remove(&EntityId::table(database, name));
        if let Some(store) = &self.store {
            store
                .delete(EntityKind::Table, database, &removed.key())
                .await?;
        }
        Ok(removed)
    }

    /// Describe columns of a table, returning all of its column details
    ///
    /// Details are part of the table's embedding text; a change re-embeds the
    /// table (immediately in `sync` mode).
    pub async fn update_table_details(
        &self,
        database: &str,
        table: &str,
        details: Vec<ColumnDetailInput>,
    ) -> Result<Vec<ColumnDetail>> {
        let changed = {
            let lock = self.locks.lock_for(database);
            let _guard = lock.lock().await;
            self.catalog.update_table_details(database, table, details)?
        };
        if changed {
            self.after_write(database).await?;
        }
        self.catalog.get_table_details(database, table)
    }

    pub fn get_table_details(&self, database: &str, table: &str) -> Result<Vec<ColumnDetail>> {
        self.catalog.get_table_details(database, table)
    }

    // ===== Databases =====

    /// Describe a database; the description is embedded on its own and used
    /// by [`Engine::rank_databases`]
    pub async fn set_database_info(
        &self,
        database: &str,
        input: DatabaseInfoInput,
    ) -> Result<UpsertOutcome> {
        let outcome = {
            let lock = self.locks.lock_for(database);
            let _guard = lock.lock().await;
            self.catalog.set_database_info(database, input)
        };
        if outcome != UpsertOutcome::Unchanged {
            self.after_write(database).await?;
        }
        Ok(outcome)
    }

    pub fn get_database_info(&self, database: &str) -> Result<DatabaseInfo> {
        self.catalog.get_database_info(database)
    }

    pub async fn remove_database_info(&self, database: &str) -> Result<DatabaseInfo> {
        let lock = self.locks.lock_for(database);
        let _guard = lock.lock().await;
        let removed = self.catalog.remove_database_info(database)?;
        self.index.remove(&EntityId::database(database));
        if let Some(store) = &self.store {
            store.delete(EntityKind::Database, database, database).await?;
        }
        Ok(removed)
    }

    /// Described databases ordered by how well they match `question`
    pub async fn rank_databases(&self, question: &str) -> Result<Vec<DatabaseMatch>> {
        self.retriever.rank_databases(question, &self.params).await
    }

    // ===== Examples =====

    /// Store an example; tables it mentions that the catalog lacks are logged, not rejected
    pub async fn add_example(&self, database: &str, input: ExampleInput) -> Result<ExampleRecord> {
        let record = {
            let lock = self.locks.lock_for(database);
            let _guard = lock.lock().await;
            self.examples.add_example(database, input)?
        };

        for table in &record.referenced_tables {
            if !self.catalog.contains_table(database, table) {
                warn!(
                    "Example {} references unknown table {}.{}",
                    record.id, database, table
                );
            }
        }

        if record.is_stale() {
            self.after_write(database).await?;
        }
        Ok(record)
    }

    pub fn get_example(&self, database: &str, id: &str) -> Result<ExampleRecord> {
        self.examples.get_example(database, id)
    }

    pub fn list_examples(&self, database: &str) -> Vec<ExampleRecord> {
        self.examples.list_examples(database)
    }

    /// Examples whose query reads or writes `table`
    pub fn list_examples_for_table(&self, database: &str, table: &str) -> Vec<ExampleRecord> {
        self.examples.list_examples_for_table(database, table)
    }

    pub async fn remove_example(&self, database: &str, id: &str) -> Result<ExampleRecord> {
        let lock = self.locks.lock_for(database);
        let _guard = lock.lock().await;
        let removed = self.examples.remove_example(database, id)?;
        self.index.remove(&EntityId::example(database, id));
        if let Some(store) = &self.store {
            store.delete(EntityKind::Example, database, id).await?;
        }
        Ok(removed)
    }

    // ===== Consistency =====

    /// Embed every dirty table, pending example and changed database description
    pub async fn reconcile(&self) -> Result<ReconcileStats> {
        self.guard.reconcile().await
    }

    /// Rebuild index partitions from the canonical stores
    ///
    /// Each partition is built off to the side and swapped in whole. Returns
    /// the number of indexed entities.
    pub async fn rebuild_index(&self, database: Option<&str>) -> Result<usize> {
        let databases = match database {
            Some(db) => vec![db.to_string()],
            None => self.list_databases(),
        };

        let mut total = 0;
        for db in databases {
            let lock = self.locks.lock_for(&db);
            let _guard = lock.lock().await;
            total += self
                .index
                .rebuild(&db, EntityKind::Table, self.catalog.embedded_tables(&db))?;
            total += self.index.rebuild(
                &db,
                EntityKind::Example,
                self.examples.embedded_examples(&db),
            )?;
            total += self.index.rebuild(
                &db,
                EntityKind::Database,
                self.catalog.embedded_database(&db),
            )?;
        }
        Ok(total)
    }

    /// Reload tables, examples and database descriptions from the attached
    /// store and rebuild the index
    ///
    /// Rows whose stored hash no longer matches their content, or whose vector
    /// has the wrong dimension, come back without an embedding and are queued
    /// for the next reconcile (run immediately in `sync` mode).
    pub async fn restore(&self) -> Result<RestoreStats> {
        let store = Arc::clone(self.require_store()?);
        let dimension = self.embedder.dimension();
        let mut stats = RestoreStats::default();

        for row in store.load(EntityKind::Table, None).await? {
            let StoredEntity {
                database_name,
                embedding,
                content_hash,
                payload,
                id,
                ..
            } = row;
            let mut record: TableRecord = match serde_json::from_value(payload) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping stored table {}.{}: {}", database_name, id, e);
                    stats.skipped += 1;
                    continue;
                }
            };
            record.database_name = database_name;
            match self
                .catalog
                .restore_table(record, Some(embedding), &content_hash, dimension)
            {
                Ok(true) => stats.tables += 1,
                Ok(false) => {
                    stats.tables += 1;
                    stats.stale += 1;
                }
                Err(e) => {
                    warn!("Skipping stored table {}: {}", id, e);
                    stats.skipped += 1;
                }
            }
        }

        for row in store.load(EntityKind::Example, None).await? {
            let StoredEntity {
                database_name,
                embedding,
                content_hash,
                payload,
                id,
                ..
            } = row;
            let mut record: ExampleRecord = match serde_json::from_value(payload) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping stored example {} in {}: {}", id, database_name, e);
                    stats.skipped += 1;
                    continue;
                }
            };
            record.database_name = database_name;
            match self
                .examples
                .restore_example(record, Some(embedding), &content_hash, dimension)
            {
                Ok(true) => stats.examples += 1,
                Ok(false) => {
                    stats.examples += 1;
                    stats.stale += 1;
                }
                Err(e) => {
                    warn!("Skipping stored example {}: {}", id, e);
                    stats.skipped += 1;
                }
            }
        }

        for row in store.load(EntityKind::Database, None).await? {
            let StoredEntity {
                database_name,
                embedding,
                content_hash,
                payload,
                ..
            } = row;
            let mut info: DatabaseInfo = match serde_json::from_value(payload) {
                Ok(info) => info,
                Err(e) => {
                    warn!("Skipping stored info of {}: {}", database_name, e);
                    stats.skipped += 1;
                    continue;
                }
            };
            info.database_name = database_name;
            stats.databases += 1;
            if !self
                .catalog
                .restore_database_info(info, Some(embedding), &content_hash, dimension)
            {
                stats.stale += 1;
            }
        }

        let indexed = self.rebuild_index(None).await?;
        info!(
            "Restored {} tables, {} examples, {} databases ({} stale, {} indexed)",
            stats.tables, stats.examples, stats.databases, stats.stale, indexed
        );

        if stats.stale > 0 && self.mode() == ReconcileMode::Sync {
            self.guard.reconcile().await?;
        }
        Ok(stats)
    }

    // ===== Retrieval =====

    /// Retrieve context for `question` with the configured budget
    ///
    /// Reads are not serialised against writes. While a deferred-mode
    /// reconcile is running, a retrieval may still rank with the vectors that
    /// were indexed before it; the next retrieval after it completes sees the
    /// new ones.
    pub async fn retrieve(&self, database: &str, question: &str) -> Result<ContextBundle> {
        self.retriever
            .retrieve(database, question, &self.params)
            .await
    }

    /// Retrieve with an explicit size budget in characters
    pub async fn retrieve_with_budget(
        &self,
        database: &str,
        question: &str,
        budget: usize,
    ) -> Result<ContextBundle> {
        let params = self.params.clone().with_budget(budget);
        debug!("Retrieving for {} with budget {}", database, budget);
        self.retriever.retrieve(database, question, &params).await
    }

    /// Retrieve with fully custom parameters
    pub async fn retrieve_with(
        &self,
        database: &str,
        question: &str,
        params: &RetrievalParams,
    ) -> Result<ContextBundle> {
        self.retriever.retrieve(database, question, params).await
    }
}
