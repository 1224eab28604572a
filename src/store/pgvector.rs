use super::{
    check_relation, delete_sql, format_vector, load_sql, nearest_sql, parse_vector,
    schema_statements, upsert_sql, StoredEntity, VectorStore,
};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::index::EntityKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info};

#[derive(Debug, FromRow)]
struct EntityRow {
    id: String,
    database_name: String,
    embedding: String,
    content_hash: String,
    payload: Value,
    updated_at: DateTime<Utc>,
}

/// Postgres + pgvector backed store, one relation per entity kind
#[derive(Clone)]
pub struct PgVectorStore {
    pool: PgPool,
    table_relation: String,
    example_relation: String,
    database_relation: String,
    dimension: usize,
}

impl PgVectorStore {
    /// Connect using the `[store]` section
    pub async fn connect(config: &StoreConfig, dimension: usize) -> Result<Self> {
        debug!("Connecting to Postgres at {}", redact(&config.database_url));
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        Self::from_pool(pool, config, dimension)
    }

    pub fn from_pool(pool: PgPool, config: &StoreConfig, dimension: usize) -> Result<Self> {
        check_relation(&config.table_relation)?;
        check_relation(&config.example_relation)?;
        check_relation(&config.database_relation)?;
        Ok(Self {
            pool,
            table_relation: config.table_relation.clone(),
            example_relation: config.example_relation.clone(),
            database_relation: config.database_relation.clone(),
            dimension,
        })
    }

    fn relation(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Table => &self.table_relation,
            EntityKind::Example => &self.example_relation,
            EntityKind::Database => &self.database_relation,
        }
    }

    /// Server-side cosine search, for callers that query the store directly
    pub async fn nearest(
        &self,
        kind: EntityKind,
        database: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<(String, f32)>> {
        let rows: Vec<(String, f64)> = sqlx::query_as(&nearest_sql(self.relation(kind)))
            .bind(database)
            .bind(format_vector(vector))
            .bind(k as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, similarity)| (id, similarity as f32))
            .collect())
    }
}

/// Hide the password of a connection URL in logs
fn redact(database_url: &str) -> String {
    match url::Url::parse(database_url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<unparseable url>".to_string(),
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn init(&self) -> Result<()> {
        info!(
            "Initializing pgvector relations {}, {} and {}",
            self.table_relation, self.example_relation, self.database_relation
        );
        for relation in [
            &self.table_relation,
            &self.example_relation,
            &self.database_relation,
        ] {
            for statement in schema_statements(relation, self.dimension) {
                sqlx::query(&statement).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    async fn upsert(&self, entities: &[StoredEntity]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for entity in entities {
            sqlx::query(&upsert_sql(self.relation(entity.kind)))
                .bind(&entity.id)
                .bind(&entity.database_name)
                .bind(format_vector(&entity.embedding))
                .bind(&entity.content_hash)
                .bind(&entity.payload)
                .bind(entity.updated_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!("Persisted {} entities", entities.len());
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, database: &str, id: &str) -> Result<bool> {
        let result = sqlx::query(&delete_sql(self.relation(kind)))
            .bind(database)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load(&self, kind: EntityKind, database: Option<&str>) -> Result<Vec<StoredEntity>> {
        let sql = load_sql(self.relation(kind));
        let mut rows = sqlx::query_as::<_, EntityRow>(&sql)
            .bind(database)
            .fetch(&self.pool);

        let mut entities = Vec::new();
        while let Some(row) = rows.try_next().await? {
            entities.push(StoredEntity {
                kind,
                embedding: parse_vector(&row.embedding)?,
                id: row.id,
                database_name: row.database_name,
                content_hash: row.content_hash,
                payload: row.payload,
                updated_at: row.updated_at,
            });
        }
        debug!("Loaded {} {} rows", entities.len(), kind);
        Ok(entities)
    }
}
