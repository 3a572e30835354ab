mod ast;
mod compiler;
mod dimensions;
mod executor;
mod reports;

pub use ast::{max_dollar_placeholder, CompiledQuery};
pub use compiler::compile;
pub use dimensions::{DimensionKind, DEFAULT_PRODUCT_LIMIT, MAX_PRODUCT_LIMIT};
pub use executor::{wrap_as_json, PgExecutor, QueryExecutor};
pub use reports::{ComparisonRequest, KpiParams, KpiRequest, ReportFilters};

use crate::{
    cache::{CacheStats, QueryCache, COMPARE_PREFIX, DIMENSIONS_PREFIX, KPI_PREFIX, QUERY_PREFIX},
    catalog::Catalog,
    config::AppConfig,
    error::{Result, ServiceError},
    models::{
        DimensionValuesResponse, KpiDashboard, PeriodComparisonResponse, QueryMetadata,
        QueryResponse,
    },
    time::DateRange,
    validate::{self, ScalarValue},
};
use chrono::NaiveDate;
use diesel::{
    pg::Pg,
    query_builder::{BoxedSqlQuery, SqlQuery},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{collections::BTreeMap, sync::Arc, time::Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum BindParam {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
}

impl BindParam {
    pub(crate) fn apply<'a>(
        &self,
        query: BoxedSqlQuery<'a, Pg, SqlQuery>,
    ) -> BoxedSqlQuery<'a, Pg, SqlQuery> {
        use diesel::sql_types::{Bool, Date, Float8, Int8, Text};
        match self {
            BindParam::Text(value) => query.bind::<Text, _>(value.clone()),
            BindParam::Int(value) => query.bind::<Int8, _>(*value),
            BindParam::Float(value) => query.bind::<Float8, _>(*value),
            BindParam::Bool(value) => query.bind::<Bool, _>(*value),
            BindParam::Date(value) => query.bind::<Date, _>(*value),
        }
    }
}

impl From<&ScalarValue> for BindParam {
    fn from(value: &ScalarValue) -> Self {
        match value {
            ScalarValue::Bool(flag) => BindParam::Bool(*flag),
            ScalarValue::Int(int) => BindParam::Int(*int),
            ScalarValue::Float(float) => BindParam::Float(*float),
            ScalarValue::Text(text) => BindParam::Text(text.clone()),
            ScalarValue::Date(date) => BindParam::Date(*date),
        }
    }
}

/// A filter as sent on the wire: a list, an operator map or a scalar.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FilterInput {
    List(Vec<Value>),
    Operators(BTreeMap<String, Value>),
    Scalar(Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OrderSpec {
    pub field: String,
    #[serde(default)]
    pub direction: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AnalyticsQueryRequest {
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub filters: BTreeMap<String, FilterInput>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    #[serde(default)]
    pub order_by: Option<Vec<OrderSpec>>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslateResponse {
    pub sql: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub params: Vec<BindParam>,
}

/// Validates, compiles and executes analytics requests with cache-aside reuse.
#[derive(Clone)]
pub struct QueryEngine {
    catalog: Arc<Catalog>,
    executor: Arc<dyn QueryExecutor>,
    cache: QueryCache,
    config: Arc<AppConfig>,
}

impl QueryEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        executor: Arc<dyn QueryExecutor>,
        cache: QueryCache,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            catalog,
            executor,
            cache,
            config,
        }
    }

    pub async fn execute_query(&self, request: AnalyticsQueryRequest) -> Result<QueryResponse> {
        let started = Instant::now();
        let (request, compiled) = self.prepare(request)?;
        let executor = Arc::clone(&self.executor);

        let (data, cached) = self
            .cache
            .get_or_compute(QUERY_PREFIX, &request, None, move || async move {
                executor.fetch_rows(&compiled).await
            })
            .await?;

        let metadata = QueryMetadata::new(data.len(), started.elapsed(), cached);
        debug!(
            rows = metadata.total_rows,
            cached,
            query_time_ms = metadata.query_time_ms,
            "analytics query completed"
        );
        Ok(QueryResponse { data, metadata })
    }

    pub fn translate(&self, request: AnalyticsQueryRequest) -> Result<TranslateResponse> {
        let (_, compiled) = self.prepare(request)?;
        Ok(TranslateResponse {
            sql: compiled.sql,
            params: compiled.params,
        })
    }

    pub async fn kpis(&self, request: KpiRequest) -> Result<KpiDashboard> {
        let started = Instant::now();
        let query = reports::aggregate_query(&request.date_range, &request.filters);
        let executor = Arc::clone(&self.executor);

        let (kpis, cached) = self
            .cache
            .get_or_compute(KPI_PREFIX, &request, None, move || async move {
                let rows = executor.fetch_rows(&query).await?;
                Ok::<_, ServiceError>(reports::kpi_cards(rows.first()))
            })
            .await?;

        Ok(KpiDashboard {
            metadata: QueryMetadata::new(kpis.len(), started.elapsed(), cached),
            period: request.date_range.label(),
            kpis,
        })
    }

    pub async fn compare(&self, request: ComparisonRequest) -> Result<PeriodComparisonResponse> {
        let started = Instant::now();
        let (base_period, compare_period) = request.periods()?;
        let base_query = reports::aggregate_query(&base_period.as_range(), &request.filters);
        let compare_query = reports::aggregate_query(&compare_period.as_range(), &request.filters);
        let executor = Arc::clone(&self.executor);

        let (comparisons, cached) = self
            .cache
            .get_or_compute(COMPARE_PREFIX, &request, None, move || async move {
                let (base, compare) = tokio::try_join!(
                    executor.fetch_rows(&base_query),
                    executor.fetch_rows(&compare_query)
                )?;
                Ok::<_, ServiceError>(reports::comparisons(base.first(), compare.first()))
            })
            .await?;

        Ok(PeriodComparisonResponse {
            base_period,
            compare_period,
            metadata: QueryMetadata::new(comparisons.len(), started.elapsed(), cached),
            comparisons,
        })
    }

    pub async fn dimension_values(
        &self,
        kind: DimensionKind,
        limit: Option<i64>,
    ) -> Result<DimensionValuesResponse> {
        let limit = match kind {
            DimensionKind::Products => Some(limit.unwrap_or(DEFAULT_PRODUCT_LIMIT)),
            _ => None,
        };
        let query = kind.query(limit)?;
        let executor = Arc::clone(&self.executor);
        let payload = json!({ "dimension": kind.as_str(), "limit": limit });

        let (values, _) = self
            .cache
            .get_or_compute(DIMENSIONS_PREFIX, &payload, None, move || async move {
                let rows = executor.fetch_rows(&query).await?;
                Ok::<_, ServiceError>(dimensions::dimension_values(&rows))
            })
            .await?;

        Ok(DimensionValuesResponse {
            dimension: kind.as_str().to_string(),
            total: values.len(),
            values,
        })
    }

    pub async fn clear_cache(&self, pattern: &str) -> u64 {
        self.cache.invalidate_pattern(pattern).await
    }

    /// Drops the cached result of one request; the key is derived as `execute_query` does.
    pub async fn invalidate_query(&self, request: AnalyticsQueryRequest) -> Result<bool> {
        let request = self.canonical_request(request)?;
        Ok(self.cache.invalidate_one(QUERY_PREFIX, &request).await)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    fn canonical_request(&self, request: AnalyticsQueryRequest) -> Result<AnalyticsQueryRequest> {
        let mut request = validate::normalize(request)?;
        if request.limit.is_none() {
            request.limit = Some(self.config.default_limit);
        }
        Ok(request)
    }

    fn prepare(
        &self,
        request: AnalyticsQueryRequest,
    ) -> Result<(AnalyticsQueryRequest, CompiledQuery)> {
        let request = self.canonical_request(request)?;
        let validated = validate::validate(&self.catalog, &request, self.config.max_limit)?;
        let compiled = compile(&validated, &self.catalog)?;
        Ok((request, compiled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::MemoryStore, models::Row};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[derive(Default)]
    struct RecordingExecutor {
        calls: AtomicUsize,
        seen: parking_lot::Mutex<Vec<CompiledQuery>>,
    }

    #[async_trait]
    impl QueryExecutor for RecordingExecutor {
        async fn fetch_rows(&self, query: &CompiledQuery) -> Result<Vec<Row>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(query.clone());
            let row = json!({"channel": "iFood", "faturamento": 1250.5});
            Ok(vec![row.as_object().cloned().unwrap_or_default()])
        }
    }

    fn engine(executor: Arc<RecordingExecutor>) -> QueryEngine {
        let config = Arc::new(AppConfig::embedded("postgres://unused/db".to_string()));
        let cache = QueryCache::new(Some(Arc::new(MemoryStore::new())), Duration::from_secs(60));
        QueryEngine::new(Arc::new(Catalog::restaurant()), executor, cache, config)
    }

    fn request(body: Value) -> AnalyticsQueryRequest {
        serde_json::from_value(body).expect("request fixture must deserialize")
    }

    #[test]
    fn translate_applies_default_limit() {
        let engine = engine(Arc::default());
        let response = engine
            .translate(request(json!({"metrics": ["faturamento"]})))
            .unwrap();
        assert!(response.sql.ends_with("LIMIT 100"), "{}", response.sql);
    }

    #[test]
    fn translate_param_arity_matches_sql_placeholders() {
        let engine = engine(Arc::default());
        let cases = [
            json!({"metrics": ["faturamento"], "dimensions": ["channel"]}),
            json!({
                "metrics": ["faturamento", "ticket_medio", "qtd_vendas"],
                "dimensions": ["channel", "periodo_dia"],
                "filters": {"channel_id": {"in": [2, 3]}},
                "date_range": {"start_date": "2024-01-01", "end_date": "2024-01-31"},
                "order_by": [{"field": "faturamento", "direction": "desc"}],
                "limit": 100
            }),
            json!({
                "metrics": ["SUM(ps.quantity) as total_vendido"],
                "dimensions": ["nome_produto"],
                "filters": {"canal_venda": ["iFood"], "nome_loja": ["Centro", "Savassi"]},
                "order_by": [{"field": "total_vendido", "direction": "desc"}],
                "limit": 10
            }),
        ];

        for body in cases {
            let response = engine.translate(request(body.clone())).unwrap();
            assert_eq!(
                max_dollar_placeholder(&response.sql),
                response.params.len(),
                "sql placeholders must match params length for {body}"
            );
        }
    }

    #[test]
    fn translate_serializes_tagged_params() {
        let engine = engine(Arc::default());
        let response = engine
            .translate(request(json!({
                "metrics": ["faturamento"],
                "filters": {"store_id": 4},
                "date_range": {"start_date": "2024-01-01"}
            })))
            .unwrap();
        assert_eq!(
            serde_json::to_value(&response.params).unwrap(),
            json!([{"t": "date", "v": "2024-01-01"}, {"t": "int", "v": 4}])
        );
    }

    #[tokio::test]
    async fn repeated_query_is_served_from_cache() {
        let executor = Arc::new(RecordingExecutor::default());
        let engine = engine(Arc::clone(&executor));
        let body = json!({"metrics": ["faturamento"], "dimensions": ["channel"]});

        let first = engine.execute_query(request(body.clone())).await.unwrap();
        assert!(!first.metadata.cached);
        assert_eq!(first.metadata.total_rows, 1);

        let second = engine.execute_query(request(body)).await.unwrap();
        assert!(second.metadata.cached);
        assert_eq!(second.data, first.data);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn date_shortcuts_share_a_cache_entry_with_date_range() {
        let executor = Arc::new(RecordingExecutor::default());
        let engine = engine(Arc::clone(&executor));

        engine
            .execute_query(request(json!({
                "metrics": ["faturamento"],
                "filters": {"data_venda_gte": "2024-01-01"}
            })))
            .await
            .unwrap();
        let second = engine
            .execute_query(request(json!({
                "metrics": ["faturamento"],
                "date_range": {"start_date": "2024-01-01", "end_date": null}
            })))
            .await
            .unwrap();
        assert!(second.metadata.cached);
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_the_store() {
        let executor = Arc::new(RecordingExecutor::default());
        let engine = engine(Arc::clone(&executor));
        let err = engine
            .execute_query(request(json!({"metrics": ["DROP TABLE sales; --"]})))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn comparison_runs_both_periods() {
        let executor = Arc::new(RecordingExecutor::default());
        let engine = engine(Arc::clone(&executor));
        let response = engine
            .compare(
                serde_json::from_value(json!({
                    "base_start": "2024-02-01",
                    "base_end": "2024-02-29",
                    "compare_start": "2024-01-01",
                    "compare_end": "2024-01-31"
                }))
                .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.comparisons.len(), 5);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        let seen = executor.seen.lock();
        assert!(seen.iter().all(|query| query.params.len() == 2));
    }

    #[tokio::test]
    async fn dimension_listing_reports_total() {
        let executor = Arc::new(RecordingExecutor::default());
        let engine = engine(Arc::clone(&executor));
        let response = engine
            .dimension_values(DimensionKind::Channels, None)
            .await
            .unwrap();
        assert_eq!(response.dimension, "channels");
        assert_eq!(response.total, 1);
    }
}
