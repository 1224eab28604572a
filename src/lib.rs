//! groundsql - schema and example retrieval for NL2SQL grounding
//!
//! This crate provides:
//! - A schema catalog fed by `CREATE TABLE` DDL, with aliases, keywords, foreign keys,
//!   column details and per-database descriptions
//! - A store of historical query examples
//! - Per-database vector partitions and a consistency guard that keeps them fresh
//! - Hybrid retrieval (vector similarity, keyword overlap, foreign-key connectivity)
//!   into a size-budgeted context bundle
//! - Optional persistence in Postgres with pgvector

pub mod catalog;
pub mod config;
pub mod embed;
pub mod engine;
pub mod error;
pub mod exemplars;
pub mod guard;
pub mod index;
pub mod logging;
pub mod retrieve;
pub mod sql;
pub mod store;
pub mod text;

pub use catalog::{
    ColumnDetail, ColumnDetailInput, DatabaseInfo, DatabaseInfoInput, TableInput, TableRecord,
    UpsertOutcome,
};
pub use config::{Config, ReconcileMode};
pub use engine::{Engine, RestoreStats};
pub use error::{Error, Result};
pub use exemplars::{ExampleInput, ExampleRecord};
pub use guard::ReconcileStats;
pub use retrieve::{
    BundleEntry, ContextBundle, ContextItem, DatabaseContext, DatabaseMatch, RetrievalParams,
    ScoreWeights,
};
