use super::harness::TestApp;
use analytics::{
    cache::{MemoryStore, QueryCache},
    catalog::Catalog,
    config::AppConfig,
    error::Result,
    models::Row,
    query::{CompiledQuery, QueryEngine, QueryExecutor},
    server::build_router,
    state::AppState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// Answers every statement with canned rows chosen by what the SQL selects.
#[derive(Default)]
pub struct StubExecutor {
    calls: AtomicUsize,
    seen: Mutex<Vec<CompiledQuery>>,
}

impl StubExecutor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<CompiledQuery> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl QueryExecutor for StubExecutor {
    async fn fetch_rows(&self, query: &CompiledQuery) -> Result<Vec<Row>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(query.clone());

        let rows = if query.sql.contains("AS faturamento_total") {
            vec![json!({
                "faturamento_total": 1500.0,
                "ticket_medio": 75.0,
                "total_vendas": 20,
                "clientes_unicos": 12,
                "tempo_medio_entrega_min": 31.26,
                "tempo_medio_preparo_min": 11.94
            })]
        } else if query.sql.contains("FROM stores st") {
            vec![
                json!({"id": 1, "label": "Centro", "count": 3}),
                json!({"id": 2, "label": "Savassi", "count": 1}),
            ]
        } else if query.sql.contains("FROM products p") {
            vec![json!({"id": 7, "label": "X-Burger", "count": 40})]
        } else {
            vec![
                json!({"channel": "iFood", "faturamento": 1250.5}),
                json!({"channel": "Presencial", "faturamento": 430.0}),
            ]
        };

        Ok(rows.into_iter().filter_map(into_row).collect())
    }
}

fn into_row(value: Value) -> Option<Row> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Router over a [`StubExecutor`] and an in-process cache.
pub fn stub_app(api_key: Option<&str>) -> (TestApp, Arc<StubExecutor>) {
    let mut config = AppConfig::embedded("postgres://unused/analytics".to_string());
    config.api_key = api_key.map(str::to_string);
    let config = Arc::new(config);

    let executor = Arc::new(StubExecutor::default());
    let cache = QueryCache::new(Some(Arc::new(MemoryStore::new())), Duration::from_secs(60));
    let engine = QueryEngine::new(
        Arc::new(Catalog::restaurant()),
        Arc::clone(&executor) as Arc<dyn QueryExecutor>,
        cache,
        Arc::clone(&config),
    );
    let router = build_router(AppState::new(config, engine));

    (TestApp::new(router, api_key), executor)
}
