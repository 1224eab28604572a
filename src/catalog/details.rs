//! Descriptive metadata layered over parsed DDL
//!
//! A database may carry one description of its own (aliases, description,
//! keywords), embedded separately so questions can be routed to the right
//! database. Columns may carry aliases and descriptions that feed the owning
//! table's match terms and embedding text.

use super::content_hash;
use crate::text;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Caller-supplied description of a logical database
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseInfoInput {
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl DatabaseInfoInput {
    pub fn new() -> Self {
        Self::default()
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

/// Description of a logical database as held by the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub database_name: String,
    pub aliases: Vec<String>,
    pub description: String,
    pub keywords: Vec<String>,
    /// Hash of [`DatabaseInfo::embedding_text`]
    pub content_hash: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip)]
    pub embedded_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DatabaseInfo {
    pub(crate) fn new(database: &str, input: DatabaseInfoInput) -> Self {
        let mut info = Self {
            database_name: database.to_string(),
            aliases: input.aliases,
            description: input.description,
            keywords: input.keywords,
            content_hash: String::new(),
            embedding: None,
            embedded_hash: None,
            updated_at: Utc::now(),
        };
        info.content_hash = content_hash(&info.embedding_text());
        info
    }

    pub fn is_stale(&self) -> bool {
        self.embedding.is_none()
            || self.embedded_hash.as_deref() != Some(self.content_hash.as_str())
    }

    /// Text sent to the embedding provider; empty fields are left out
    pub fn embedding_text(&self) -> String {
        let mut lines = vec![format!("Database name: {}", self.database_name)];
        if !self.aliases.is_empty() {
            lines.push(format!("Aliases: {}", self.aliases.join(", ")));
        }
        if !self.description.is_empty() {
            lines.push(format!("Description: {}", self.description));
        }
        if !self.keywords.is_empty() {
            lines.push(format!("Keywords: {}", self.keywords.join(", ")));
        }
        lines.join("\n")
    }

    pub fn match_terms(&self) -> HashSet<String> {
        text::term_set(
            self.keywords
                .iter()
                .chain(self.aliases.iter())
                .map(String::as_str)
                .chain(std::iter::once(self.database_name.as_str())),
        )
    }
}

/// A database description waiting for an embedding
#[derive(Debug, Clone, PartialEq)]
pub struct StaleDatabase {
    pub database: String,
    pub content_hash: String,
    pub text: String,
}

/// Caller-supplied description of one column
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnDetailInput {
    pub field_name: String,
    /// Defaults to the type declared in the DDL
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl ColumnDetailInput {
    pub fn new(field_name: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            ..Self::default()
        }
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
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

/// Stored description of one column of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDetail {
    /// Column name as spelled in the DDL
    pub field_name: String,
    pub data_type: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl ColumnDetail {
    /// One-line rendering used in the table's embedding text
    pub fn summary(&self) -> String {
        let mut line = format!("{} {}", self.field_name, self.data_type);
        if !self.aliases.is_empty() {
            line.push_str(&format!(" (aliases: {})", self.aliases.join(", ")));
        }
        if !self.description.is_empty() {
            line.push_str(&format!(": {}", self.description));
        }
        if !self.keywords.is_empty() {
            line.push_str(&format!(" [{}]", self.keywords.join(", ")));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_text_skips_empty_fields() {
        let info = DatabaseInfo::new(
            "assets_maintenance",
            DatabaseInfoInput::new().with_description("Asset upkeep and fault tracking"),
        );
        assert_eq!(
            info.embedding_text(),
            "Database name: assets_maintenance\nDescription: Asset upkeep and fault tracking"
        );
        assert!(info.is_stale());

        let tagged = DatabaseInfo::new(
            "assets_maintenance",
            DatabaseInfoInput::new()
                .with_description("Asset upkeep and fault tracking")
                .with_keywords(["repairs"]),
        );
        assert_ne!(info.content_hash, tagged.content_hash);
        assert!(tagged.match_terms().contains("repair"));
        assert!(tagged.match_terms().contains("maintenance"));
    }

    #[test]
    fn test_column_summary() {
        let detail = ColumnDetail {
            field_name: "fault_description".to_string(),
            data_type: "VARCHAR(255)".to_string(),
            aliases: vec!["problem".to_string()],
            description: "What went wrong".to_string(),
            keywords: vec!["defect".to_string(), "issue".to_string()],
        };
        assert_eq!(
            detail.summary(),
            "fault_description VARCHAR(255) (aliases: problem): What went wrong [defect, issue]"
        );
    }
}
