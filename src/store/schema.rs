//! Postgres/pgvector schema and statements
//!
//! Relation names come from configuration and are spliced into SQL, so they
//! must pass `is_plain_identifier` before any of these builders are used.

use crate::config::is_plain_identifier;
use crate::error::{Error, Result};

/// Ensure `relation` can be spliced into SQL unquoted
pub fn check_relation(relation: &str) -> Result<()> {
    if is_plain_identifier(relation) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Relation name '{}' is not a plain SQL identifier",
            relation
        )))
    }
}

/// DDL for one entity relation, one statement per element
pub fn schema_statements(relation: &str, dimension: usize) -> Vec<String> {
    vec![
        "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {relation} (
    id TEXT NOT NULL,
    database_name TEXT NOT NULL,
    embedding vector({dimension}) NOT NULL,
    content_hash TEXT NOT NULL,
    payload JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (database_name, id)
)"#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {relation}_embedding_idx ON {relation} \
             USING hnsw (embedding vector_cosine_ops)"
        ),
        format!("CREATE INDEX IF NOT EXISTS {relation}_database_idx ON {relation} (database_name)"),
    ]
}

pub fn upsert_sql(relation: &str) -> String {
    format!(
        r#"
        INSERT INTO {relation} (id, database_name, embedding, content_hash, payload, updated_at)
        VALUES ($1, $2, $3::vector, $4, $5, $6)
        ON CONFLICT (database_name, id) DO UPDATE SET
            embedding = excluded.embedding,
            content_hash = excluded.content_hash,
            payload = excluded.payload,
            updated_at = excluded.updated_at
        "#
    )
}

pub fn delete_sql(relation: &str) -> String {
    format!("DELETE FROM {relation} WHERE database_name = $1 AND id = $2")
}

pub fn load_sql(relation: &str) -> String {
    format!(
        "SELECT id, database_name, embedding::text AS embedding, content_hash, payload, updated_at \
         FROM {relation} WHERE ($1::text IS NULL OR database_name = $1) \
         ORDER BY database_name, id"
    )
}

/// Nearest rows by cosine distance; similarity is `1 - distance`
pub fn nearest_sql(relation: &str) -> String {
    format!(
        "SELECT id, 1 - (embedding <=> $2::vector) AS similarity \
         FROM {relation} WHERE database_name = $1 \
         ORDER BY embedding <=> $2::vector LIMIT $3"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_relation() {
        assert!(check_relation("table_embeddings").is_ok());
        assert!(check_relation("embeddings; DROP TABLE x").is_err());
        assert!(check_relation("1abc").is_err());
    }

    #[test]
    fn test_schema_statements() {
        let statements = schema_statements("table_embeddings", 1536);
        assert_eq!(statements.len(), 4);
        assert!(statements[1].contains("embedding vector(1536) NOT NULL"));
        assert!(statements[1].contains("PRIMARY KEY (database_name, id)"));
        assert!(statements[2].contains("USING hnsw (embedding vector_cosine_ops)"));
    }

    #[test]
    fn test_statements_target_relation() {
        assert!(upsert_sql("example_embeddings").contains("INSERT INTO example_embeddings"));
        assert!(delete_sql("t").starts_with("DELETE FROM t WHERE"));
        assert!(load_sql("t").contains("embedding::text"));
        assert!(nearest_sql("t").contains("<=> $2::vector"));
    }
}
