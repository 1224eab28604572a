//! Consistency guard
//!
//! Moves tables, examples and database descriptions from "dirty" to
//! "embedded": drains the dirty sets, embeds the drained items in batches,
//! then attaches each vector under the database's write lock if the item's
//! hash has not moved on in the meantime, and pushes it to the index and the
//! persistent store.

use crate::catalog::{SchemaCatalog, StaleDatabase, StaleTable};
use crate::embed::{embed_in_batches, Embedder};
use crate::error::{Error, Result};
use crate::exemplars::{ExampleStore, PendingExample};
use crate::index::{EntityId, EntityKind, VectorIndex};
use crate::store::{StoredEntity, VectorStore};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One async mutex per database; writes to a database serialise on it
#[derive(Debug, Default)]
pub struct DatabaseLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DatabaseLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, database: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(database.to_string()).or_default().value())
    }
}

/// Counters from one reconcile pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub tables_embedded: usize,
    pub examples_embedded: usize,
    pub databases_embedded: usize,
    /// Items whose content changed or vanished while they were being embedded
    pub superseded: usize,
    pub persisted: usize,
}

impl ReconcileStats {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Everything drained from the canonical stores in one pass
#[derive(Debug, Default)]
struct Drained {
    tables: Vec<StaleTable>,
    examples: Vec<PendingExample>,
    databases: Vec<StaleDatabase>,
}

impl Drained {
    fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.examples.is_empty() && self.databases.is_empty()
    }
}

#[derive(Default)]
struct DatabaseBatch {
    tables: Vec<(StaleTable, Vec<f32>)>,
    examples: Vec<(PendingExample, Vec<f32>)>,
    info: Option<(StaleDatabase, Vec<f32>)>,
}

pub struct ConsistencyGuard {
    catalog: Arc<SchemaCatalog>,
    examples: Arc<ExampleStore>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    store: Option<Arc<dyn VectorStore>>,
    locks: Arc<DatabaseLocks>,
    batch_size: usize,
    timeout: Duration,
}

impl ConsistencyGuard {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        examples: Arc<ExampleStore>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        store: Option<Arc<dyn VectorStore>>,
        locks: Arc<DatabaseLocks>,
        batch_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            examples,
            index,
            embedder,
            store,
            locks,
            batch_size,
            timeout,
        }
    }

    /// Embed everything dirty across all databases
    pub async fn reconcile(&self) -> Result<ReconcileStats> {
        let drained = Drained {
            tables: self.catalog.drain_dirty(),
            examples: self.examples.drain_pending(),
            databases: self.catalog.drain_dirty_databases(),
        };
        self.process(drained).await
    }

    /// Embed everything dirty in one database
    pub async fn reconcile_database(&self, database: &str) -> Result<ReconcileStats> {
        let drained = Drained {
            tables: self.catalog.drain_dirty_for(database),
            examples: self.examples.drain_pending_for(database),
            databases: self.catalog.drain_dirty_database(database).into_iter().collect(),
        };
        self.process(drained).await
    }

    fn requeue(
        &self,
        tables: &[StaleTable],
        examples: &[PendingExample],
        databases: &[StaleDatabase],
    ) {
        for table in tables {
            self.catalog.mark_dirty(&table.database, &table.name);
        }
        for example in examples {
            self.examples.mark_pending(&example.database, &example.id);
        }
        for info in databases {
            self.catalog.mark_database_dirty(&info.database);
        }
    }

    async fn process(&self, drained: Drained) -> Result<ReconcileStats> {
        if drained.is_empty() {
            return Ok(ReconcileStats::default());
        }
        let Drained {
            tables,
            examples,
            databases,
        } = drained;
        debug!(
            "Reconciling {} tables, {} examples and {} database descriptions",
            tables.len(),
            examples.len(),
            databases.len()
        );

        let texts: Vec<String> = tables
            .iter()
            .map(|t| t.text.clone())
            .chain(examples.iter().map(|e| e.text.clone()))
            .chain(databases.iter().map(|d| d.text.clone()))
            .collect();

        let mut vectors = match embed_in_batches(
            self.embedder.as_ref(),
            texts,
            self.batch_size,
            self.timeout,
        )
        .await
        {
            Ok(vectors) => vectors,
            Err(e) => {
                warn!(
                    "Embedding failed, re-queued {} tables, {} examples, {} databases: {}",
                    tables.len(),
                    examples.len(),
                    databases.len(),
                    e
                );
                self.requeue(&tables, &examples, &databases);
                return Err(match e {
                    Error::EmbeddingUnavailable(_) => e,
                    other => Error::EmbeddingUnavailable(other.to_string()),
                });
            }
        };

        let mut example_vectors = vectors.split_off(tables.len());
        let database_vectors = example_vectors.split_off(examples.len());
        let mut batches: BTreeMap<String, DatabaseBatch> = BTreeMap::new();
        for (table, vector) in tables.into_iter().zip(vectors) {
            batches
                .entry(table.database.clone())
                .or_default()
                .tables
                .push((table, vector));
        }
        for (example, vector) in examples.into_iter().zip(example_vectors) {
            batches
                .entry(example.database.clone())
                .or_default()
                .examples
                .push((example, vector));
        }
        for (info, vector) in databases.into_iter().zip(database_vectors) {
            let key = info.database.clone();
            batches.entry(key).or_default().info = Some((info, vector));
        }

        let mut stats = ReconcileStats::default();
        for (database, batch) in batches {
            self.apply(&database, batch, &mut stats).await?;
        }

        info!(
            "Reconciled {} tables, {} examples, {} databases ({} superseded)",
            stats.tables_embedded,
            stats.examples_embedded,
            stats.databases_embedded,
            stats.superseded
        );
        Ok(stats)
    }

    async fn apply(
        &self,
        database: &str,
        batch: DatabaseBatch,
        stats: &mut ReconcileStats,
    ) -> Result<()> {
        let lock = self.locks.lock_for(database);
        let _guard = lock.lock().await;

        let mut rows = Vec::new();
        let mut attached_tables = Vec::new();
        let mut attached_examples = Vec::new();

        for (table, vector) in batch.tables {
            if !self
                .catalog
                .attach_embedding(database, &table.name, &table.ddl_hash, vector.clone())
            {
                debug!("Table {}.{} superseded", database, table.name);
                stats.superseded += 1;
                continue;
            }
            self.index
                .upsert(&EntityId::table(database, &table.name), &vector)?;
            stats.tables_embedded += 1;
            if self.store.is_some() {
                let record = self.catalog.get_table(database, &table.name)?;
                rows.push(StoredEntity {
                    kind: EntityKind::Table,
                    id: record.key(),
                    database_name: database.to_string(),
                    embedding: vector,
                    content_hash: table.ddl_hash.clone(),
                    payload: serde_json::to_value(&record)?,
                    updated_at: Utc::now(),
                });
            }
            attached_tables.push(table);
        }

        for (example, vector) in batch.examples {
            if !self.examples.attach_embedding(
                database,
                &example.id,
                &example.content_hash,
                vector.clone(),
            ) {
                debug!("Example {} in {} superseded", example.id, database);
                stats.superseded += 1;
                continue;
            }
            self.index
                .upsert(&EntityId::example(database, &example.id), &vector)?;
            stats.examples_embedded += 1;
            if self.store.is_some() {
                let record = self.examples.get_example(database, &example.id)?;
                rows.push(StoredEntity {
                    kind: EntityKind::Example,
                    id: record.id.clone(),
                    database_name: database.to_string(),
                    embedding: vector,
                    content_hash: example.content_hash.clone(),
                    payload: serde_json::to_value(&record)?,
                    updated_at: Utc::now(),
                });
            }
            attached_examples.push(example);
        }

        let mut attached_databases = Vec::new();
        if let Some((info, vector)) = batch.info {
            if self
                .catalog
                .attach_database_embedding(database, &info.content_hash, vector.clone())
            {
                self.index.upsert(&EntityId::database(database), &vector)?;
                stats.databases_embedded += 1;
                if self.store.is_some() {
                    let record = self.catalog.get_database_info(database)?;
                    rows.push(StoredEntity {
                        kind: EntityKind::Database,
                        id: database.to_string(),
                        database_name: database.to_string(),
                        embedding: vector,
                        content_hash: info.content_hash.clone(),
                        payload: serde_json::to_value(&record)?,
                        updated_at: Utc::now(),
                    });
                }
                attached_databases.push(info);
            } else {
                debug!("Database info of {} superseded", database);
                stats.superseded += 1;
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.upsert(&rows).await {
                warn!("Persisting {} rows for {} failed: {}", rows.len(), database, e);
                self.requeue(&attached_tables, &attached_examples, &attached_databases);
                return Err(e);
            }
            stats.persisted += rows.len();
        }
        Ok(())
    }
}
