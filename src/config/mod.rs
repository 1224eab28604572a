//! Configuration management for groundsql
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Candidate counts, score weights and budget
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// When stale embeddings are refreshed
    #[serde(default)]
    pub consistency: ConsistencyConfig,

    /// Persistent vector store
    #[serde(default)]
    pub store: StoreConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Backend kind: "http" or "hash"
    #[serde(default = "default_embedding_backend")]
    pub backend: String,

    /// Base URL of the HTTP embedding service
    #[serde(default = "default_embedding_url")]
    pub url: String,

    /// Model name/identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension (must match model)
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Batch size for embedding
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    /// Per-call timeout in seconds
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Table candidates pulled from the index (N_t)
    #[serde(default = "default_table_k")]
    pub table_k: usize,

    /// Example candidates pulled from the index (N_e)
    #[serde(default = "default_example_k")]
    pub example_k: usize,

    /// Weight of cosine similarity (w_v)
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,

    /// Weight of keyword overlap (w_k)
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,

    /// Weight of foreign-key connectivity (w_g)
    #[serde(default = "default_graph_weight")]
    pub graph_weight: f32,

    /// Boost per already-selected table connected by a foreign key
    #[serde(default = "default_graph_increment")]
    pub graph_increment: f32,

    /// Maximum bundle size in characters
    #[serde(default = "default_budget")]
    pub budget: usize,
}

/// When the consistency guard runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileMode {
    /// Reconcile right after every write
    #[default]
    Sync,
    /// Leave stale entries until `Engine::reconcile` is called
    Deferred,
}

impl std::fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileMode::Sync => write!(f, "sync"),
            ReconcileMode::Deferred => write!(f, "deferred"),
        }
    }
}

/// Consistency configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    #[serde(default)]
    pub mode: ReconcileMode,
}

/// Persistent store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Postgres connection URL (pgvector extension required)
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Relation holding table rows
    #[serde(default = "default_table_relation")]
    pub table_relation: String,

    /// Relation holding example rows
    #[serde(default = "default_example_relation")]
    pub example_relation: String,

    /// Relation holding database description rows
    #[serde(default = "default_database_relation")]
    pub database_relation: String,

    /// Connection pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for groundsql data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_embedding_backend(),
            url: default_embedding_url(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            table_k: default_table_k(),
            example_k: default_example_k(),
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
            graph_weight: default_graph_weight(),
            graph_increment: default_graph_increment(),
            budget: default_budget(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            table_relation: default_table_relation(),
            example_relation: default_example_relation(),
            database_relation: default_database_relation(),
            max_connections: default_max_connections(),
        }
    }
}

/// True if `name` can be spliced into SQL as an unquoted identifier
pub fn is_plain_identifier(name: &str) -> bool {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("static regex"))
        .is_match(name)
}

impl Config {
    /// Get the default base directory for groundsql (~/.groundsql)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".groundsql")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            base_dir: base,
        };
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig {
            config_file: config_path.to_path_buf(),
            base_dir: base,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::default_config_path())
    }

    /// Load configuration from a base directory, falling back to defaults
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            return Err(Error::Config(
                "embedding.dimension must be positive".to_string(),
            ));
        }

        if self.embedding.batch_size == 0 {
            return Err(Error::Config(
                "embedding.batch_size must be positive".to_string(),
            ));
        }

        if self.embedding.timeout_secs == 0 {
            return Err(Error::Config(
                "embedding.timeout_secs must be positive".to_string(),
            ));
        }

        let r = &self.retrieval;
        if r.table_k == 0 && r.example_k == 0 {
            return Err(Error::Config(
                "retrieval.table_k and retrieval.example_k cannot both be zero".to_string(),
            ));
        }

        for (name, weight) in [
            ("retrieval.vector_weight", r.vector_weight),
            ("retrieval.keyword_weight", r.keyword_weight),
            ("retrieval.graph_weight", r.graph_weight),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(Error::Config(format!(
                    "{} must be between 0.0 and 1.0",
                    name
                )));
            }
        }

        if r.graph_increment < 0.0 {
            return Err(Error::Config(
                "retrieval.graph_increment must not be negative".to_string(),
            ));
        }

        if r.budget == 0 {
            return Err(Error::Config("retrieval.budget must be positive".to_string()));
        }

        let relations = [
            &self.store.table_relation,
            &self.store.example_relation,
            &self.store.database_relation,
        ];
        for relation in relations {
            if !is_plain_identifier(relation) {
                return Err(Error::Config(format!(
                    "store relation '{}' is not a plain SQL identifier",
                    relation
                )));
            }
        }

        let distinct: HashSet<&String> = relations.into_iter().collect();
        if distinct.len() != relations.len() {
            return Err(Error::Config(
                "store.table_relation, store.example_relation and store.database_relation must differ"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.retrieval.table_k, 8);
        assert_eq!(config.retrieval.example_k, 5);
        assert_eq!(config.retrieval.vector_weight, 0.6);
        assert_eq!(config.retrieval.keyword_weight, 0.25);
        assert_eq!(config.retrieval.graph_weight, 0.15);
        assert_eq!(config.consistency.mode, ReconcileMode::Sync);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.retrieval.budget = 1234;
        config.consistency.mode = ReconcileMode::Deferred;

        config.save().unwrap();
        assert!(config.paths.config_file.exists());

        let loaded = Config::load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(loaded.retrieval.budget, 1234);
        assert_eq!(loaded.consistency.mode, ReconcileMode::Deferred);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[retrieval]\nkeyword_weight = 0.5\n\n[consistency]\nmode = \"deferred\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.retrieval.keyword_weight, 0.5);
        assert_eq!(config.retrieval.table_k, 8);
        assert_eq!(config.consistency.mode, ReconcileMode::Deferred);
        assert_eq!(config.paths.base_dir, tmp.path());
    }

    #[test]
    fn test_load_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = Config::load(&tmp.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.retrieval.vector_weight = 1.5;
        assert!(config.validate().is_err());
        config.retrieval.vector_weight = 0.6;

        config.retrieval.budget = 0;
        assert!(config.validate().is_err());
        config.retrieval.budget = 100;

        config.store.table_relation = "tables; DROP TABLE x".to_string();
        assert!(config.validate().is_err());
        config.store.table_relation = "table_embeddings".to_string();

        config.store.example_relation = "table_embeddings".to_string();
        assert!(config.validate().is_err());
        config.store.example_relation = "example_embeddings".to_string();

        config.store.database_relation = "example_embeddings".to_string();
        assert!(config.validate().is_err());
        config.store.database_relation = "database_embeddings".to_string();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_plain_identifier() {
        assert!(is_plain_identifier("table_embeddings"));
        assert!(is_plain_identifier("_t1"));
        assert!(!is_plain_identifier("1table"));
        assert!(!is_plain_identifier("a-b"));
        assert!(!is_plain_identifier(""));
    }
}
