//! Hybrid retrieval of schema and example context
//!
//! Candidates come from the vector index; each is scored as
//! `w_v * cosine + w_k * keyword_overlap + w_g * graph_boost` and picked
//! greedily until the size budget is spent. The graph term rewards tables
//! joined by a foreign key to a table already in the bundle, so it is
//! recomputed after every pick.
//!
//! Database descriptions are ranked separately, without a budget, to route a
//! question to the database it most likely targets.

use crate::catalog::{ColumnDetail, DatabaseInfo, SchemaCatalog, TableRecord};
use crate::config::{EmbeddingConfig, RetrievalConfig};
use crate::embed::{embed_query, Embedder};
use crate::error::{Error, Result};
use crate::exemplars::{ExampleRecord, ExampleStore};
use crate::index::{EntityId, EntityKind, Neighbor, VectorIndex};
use crate::text;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub vector: f32,
    pub keyword: f32,
    pub graph: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        let config = RetrievalConfig::default();
        Self {
            vector: config.vector_weight,
            keyword: config.keyword_weight,
            graph: config.graph_weight,
        }
    }
}

/// Knobs for one retrieval
#[derive(Debug, Clone)]
pub struct RetrievalParams {
    pub table_k: usize,
    pub example_k: usize,
    pub weights: ScoreWeights,
    pub graph_increment: f32,
    /// Maximum bundle size in characters
    pub budget: usize,
    pub embed_timeout: Duration,
}

impl RetrievalParams {
    pub fn from_config(retrieval: &RetrievalConfig, embedding: &EmbeddingConfig) -> Self {
        Self {
            table_k: retrieval.table_k,
            example_k: retrieval.example_k,
            weights: ScoreWeights {
                vector: retrieval.vector_weight,
                keyword: retrieval.keyword_weight,
                graph: retrieval.graph_weight,
            },
            graph_increment: retrieval.graph_increment,
            budget: retrieval.budget,
            embed_timeout: embedding.timeout(),
        }
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default(), &EmbeddingConfig::default())
    }
}

/// Content handed to the SQL generator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContextItem {
    Table {
        name: String,
        ddl: String,
        description: String,
        aliases: Vec<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        columns: Vec<ColumnDetail>,
    },
    Example {
        id: String,
        query: String,
        description: String,
        referenced_tables: Vec<String>,
    },
}

impl ContextItem {
    fn from_table(record: TableRecord) -> Self {
        ContextItem::Table {
            name: record.name,
            ddl: record.ddl,
            description: record.description,
            aliases: record.aliases,
            columns: record.details,
        }
    }

    fn from_example(record: ExampleRecord) -> Self {
        ContextItem::Example {
            id: record.id,
            query: record.query,
            description: record.description,
            referenced_tables: record.referenced_tables,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            ContextItem::Table { .. } => EntityKind::Table,
            ContextItem::Example { .. } => EntityKind::Example,
        }
    }

    /// Table name or example id
    pub fn name(&self) -> &str {
        match self {
            ContextItem::Table { name, .. } => name,
            ContextItem::Example { id, .. } => id,
        }
    }

    /// DDL or query length in characters
    pub fn size(&self) -> usize {
        match self {
            ContextItem::Table { ddl, .. } => ddl.chars().count(),
            ContextItem::Example { query, .. } => query.chars().count(),
        }
    }
}

/// Per-signal contributions before weighting
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub vector: f32,
    pub keyword: f32,
    pub graph: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleEntry {
    pub item: ContextItem,
    pub score: f32,
    pub components: ScoreBreakdown,
    pub size: usize,
    pub cumulative_size: usize,
}

/// Description of the database a bundle was built for; not charged against the budget
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseContext {
    pub aliases: Vec<String>,
    pub description: String,
    pub keywords: Vec<String>,
}

impl From<DatabaseInfo> for DatabaseContext {
    fn from(info: DatabaseInfo) -> Self {
        Self {
            aliases: info.aliases,
            description: info.description,
            keywords: info.keywords,
        }
    }
}

/// Ordered, budgeted retrieval result. Built per query and read-only afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    database: String,
    question: String,
    budget: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    database_info: Option<DatabaseContext>,
    entries: Vec<BundleEntry>,
}

impl ContextBundle {
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn database_info(&self) -> Option<&DatabaseContext> {
        self.database_info.as_ref()
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn entries(&self) -> &[BundleEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.entries.last().map(|e| e.cumulative_size).unwrap_or(0)
    }

    /// Selected table names in bundle order
    pub fn table_names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.item.kind() == EntityKind::Table)
            .map(|e| e.item.name())
            .collect()
    }

    /// Selected example ids in bundle order
    pub fn example_ids(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.item.kind() == EntityKind::Example)
            .map(|e| e.item.name())
            .collect()
    }

    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.item.name().eq_ignore_ascii_case(name))
    }
}

/// A database ranked against a question by its description
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseMatch {
    pub database: String,
    pub description: String,
    pub score: f32,
    /// Graph is always zero for databases
    pub components: ScoreBreakdown,
}

/// A scored-but-not-yet-selected item
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub id: EntityId,
    pub item: ContextItem,
    pub similarity: f32,
    pub keyword: f32,
}

impl Candidate {
    fn graph_boost(
        &self,
        neighbours: &HashMap<String, HashSet<String>>,
        selected: &HashSet<String>,
        increment: f32,
    ) -> f32 {
        if self.id.kind != EntityKind::Table {
            return 0.0;
        }
        let connected = neighbours
            .get(&self.id.key)
            .map(|adjacent| adjacent.intersection(selected).count())
            .unwrap_or(0);
        connected as f32 * increment
    }
}

/// Higher score first, then higher similarity, tables before examples, then name
fn rank(a: (&Candidate, f32), b: (&Candidate, f32)) -> Ordering {
    b.1.partial_cmp(&a.1)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.0.similarity
                .partial_cmp(&a.0.similarity)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.0.id.kind.cmp(&b.0.id.kind))
        .then_with(|| a.0.item.name().cmp(b.0.item.name()))
}

/// Greedy budgeted selection with the graph term refreshed after every pick
pub(crate) fn select(
    mut remaining: Vec<Candidate>,
    neighbours: &HashMap<String, HashSet<String>>,
    params: &RetrievalParams,
) -> Vec<BundleEntry> {
    let weights = params.weights;
    let mut selected_tables: HashSet<String> = HashSet::new();
    let mut seen: HashSet<EntityId> = HashSet::new();
    let mut entries = Vec::new();
    let mut used = 0usize;

    while !remaining.is_empty() {
        let best = remaining
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let graph = c.graph_boost(neighbours, &selected_tables, params.graph_increment);
                let score = weights.vector * c.similarity
                    + weights.keyword * c.keyword
                    + weights.graph * graph;
                (i, score, graph)
            })
            .min_by(|a, b| rank((&remaining[a.0], a.1), (&remaining[b.0], b.1)));
        let Some((pos, score, graph)) = best else {
            break;
        };
        let candidate = remaining.swap_remove(pos);

        if !seen.insert(candidate.id.clone()) {
            continue;
        }
        let size = candidate.item.size();
        if used + size > params.budget {
            debug!(
                "Skipping {} {} ({} chars, {} left)",
                candidate.id.kind,
                candidate.item.name(),
                size,
                params.budget - used
            );
            continue;
        }

        used += size;
        if candidate.id.kind == EntityKind::Table {
            selected_tables.insert(candidate.id.key.clone());
        }
        entries.push(BundleEntry {
            item: candidate.item,
            score,
            components: ScoreBreakdown {
                vector: candidate.similarity,
                keyword: candidate.keyword,
                graph,
            },
            size,
            cumulative_size: used,
        });
    }

    entries
}

/// Treat an empty partition as "no candidates" on that side
fn hits_or_none(result: Result<Vec<Neighbor>>) -> Result<Vec<Neighbor>> {
    match result {
        Err(Error::EmptyIndex(_)) => Ok(Vec::new()),
        other => other,
    }
}

/// Read-side view over the catalog, example store and index
pub struct Retriever {
    catalog: Arc<SchemaCatalog>,
    examples: Arc<ExampleStore>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        examples: Arc<ExampleStore>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            catalog,
            examples,
            index,
            embedder,
        }
    }

    /// Build a context bundle for `question` against one database
    pub async fn retrieve(
        &self,
        database: &str,
        question: &str,
        params: &RetrievalParams,
    ) -> Result<ContextBundle> {
        if self.index.is_empty(database, EntityKind::Table)
            && self.index.is_empty(database, EntityKind::Example)
        {
            return Err(Error::NoSchemaIndexed(database.to_string()));
        }

        let vector = embed_query(self.embedder.as_ref(), question, params.embed_timeout).await?;

        let table_hits = hits_or_none(self.index.query(
            database,
            EntityKind::Table,
            &vector,
            params.table_k,
        ))?;
        let example_hits = hits_or_none(self.index.query(
            database,
            EntityKind::Example,
            &vector,
            params.example_k,
        ))?;

        let question_terms = text::terms(question);
        let mut candidates = Vec::with_capacity(table_hits.len() + example_hits.len());

        for hit in table_hits {
            let Ok(record) = self.catalog.get_table(database, &hit.key) else {
                continue;
            };
            candidates.push(Candidate {
                id: EntityId::table(database, &hit.key),
                keyword: text::overlap_ratio(&question_terms, &record.match_terms()),
                similarity: hit.similarity,
                item: ContextItem::from_table(record),
            });
        }
        for hit in example_hits {
            let Ok(record) = self.examples.get_example(database, &hit.key) else {
                continue;
            };
            candidates.push(Candidate {
                id: EntityId::example(database, &hit.key),
                keyword: text::overlap_ratio(&question_terms, &record.match_terms()),
                similarity: hit.similarity,
                item: ContextItem::from_example(record),
            });
        }

        let candidate_count = candidates.len();
        let neighbours = self.catalog.neighbours(database);
        let entries = select(candidates, &neighbours, params);
        debug!(
            "Selected {} of {} candidates for {} (budget {})",
            entries.len(),
            candidate_count,
            database,
            params.budget
        );

        Ok(ContextBundle {
            database: database.to_string(),
            question: question.to_string(),
            budget: params.budget,
            database_info: self
                .catalog
                .get_database_info(database)
                .ok()
                .map(DatabaseContext::from),
            entries,
        })
    }

    /// Rank described databases by `w_v * cosine + w_k * keyword_overlap`
    ///
    /// Databases without an embedded description are left out; an empty
    /// result means nothing is described yet.
    pub async fn rank_databases(
        &self,
        question: &str,
        params: &RetrievalParams,
    ) -> Result<Vec<DatabaseMatch>> {
        let described: Vec<String> = self
            .catalog
            .described_databases()
            .into_iter()
            .filter(|db| !self.index.is_empty(db, EntityKind::Database))
            .collect();
        if described.is_empty() {
            return Ok(Vec::new());
        }

        let vector = embed_query(self.embedder.as_ref(), question, params.embed_timeout).await?;
        let question_terms = text::terms(question);
        let weights = params.weights;

        let mut matches = Vec::with_capacity(described.len());
        for database in described {
            let hits = hits_or_none(self.index.query(
                &database,
                EntityKind::Database,
                &vector,
                1,
            ))?;
            let Some(hit) = hits.into_iter().next() else {
                continue;
            };
            let Ok(info) = self.catalog.get_database_info(&database) else {
                continue;
            };
            let keyword = text::overlap_ratio(&question_terms, &info.match_terms());
            matches.push(DatabaseMatch {
                database,
                description: info.description,
                score: weights.vector * hit.similarity + weights.keyword * keyword,
                components: ScoreBreakdown {
                    vector: hit.similarity,
                    keyword,
                    graph: 0.0,
                },
            });
        }

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.database.cmp(&b.database))
        });
        debug!("Ranked {} databases", matches.len());
        Ok(matches)
    }
}
