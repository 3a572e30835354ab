//! Store adapter: runs a [`CompiledQuery`] and returns rows as JSON objects.

use super::ast::CompiledQuery;
use crate::{
    db::PgPool,
    error::{Result, ServiceError},
    models::Row,
};
use async_trait::async_trait;
use diesel::{pg::Pg, sql_query, sql_types::Jsonb, QueryableByName};
use diesel_async::RunQueryDsl;
use serde_json::Value;
use tracing::{debug, error};

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn fetch_rows(&self, query: &CompiledQuery) -> Result<Vec<Row>>;
}

#[derive(Debug, QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Jsonb)]
    payload: Value,
}

/// PostgreSQL executor over the shared bb8 pool.
#[derive(Clone)]
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Wraps a statement so each row comes back as one JSON object keyed by column alias.
pub fn wrap_as_json(sql: &str) -> String {
    format!("SELECT to_jsonb(q) AS payload FROM (\n{sql}\n) AS q")
}

#[async_trait]
impl QueryExecutor for PgExecutor {
    async fn fetch_rows(&self, query: &CompiledQuery) -> Result<Vec<Row>> {
        let mut conn = self.pool.get().await.map_err(|err| {
            error!(error = ?err, "failed to acquire database connection");
            ServiceError::Store(anyhow::anyhow!("{err:?}"))
        })?;

        let mut statement = sql_query(wrap_as_json(&query.sql)).into_boxed::<Pg>();
        for param in &query.params {
            statement = param.apply(statement);
        }

        debug!(sql = %query.sql, params = query.params.len(), "executing analytics query");
        let rows: Vec<JsonRow> = statement
            .load(&mut *conn)
            .await
            .map_err(|err| ServiceError::Store(err.into()))?;

        rows.into_iter()
            .map(|row| match row.payload {
                Value::Object(map) => Ok(map),
                other => Err(ServiceError::Store(anyhow::anyhow!(
                    "expected a JSON object row, got {other}"
                ))),
            })
            .collect()
    }
}
