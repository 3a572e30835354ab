use crate::{
    cache::{CacheStats, CacheStore, MemoryStore, QueryCache, RedisStore, DEFAULT_CLEAR_PATTERN},
    catalog::Catalog,
    config::{AppConfig, CacheBackend},
    db,
    error::Result,
    models::{DimensionValuesResponse, KpiDashboard, PeriodComparisonResponse, QueryResponse},
    query::{
        AnalyticsQueryRequest, ComparisonRequest, DimensionKind, KpiParams, PgExecutor,
        QueryEngine, TranslateResponse,
    },
    state::AppState,
};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

const API_PREFIX: &str = "/api/v1/analytics";
const SERVICE_NAME: &str = "analytics-api";

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

#[derive(Debug, Default, Deserialize)]
struct LimitParams {
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ClearParams {
    #[serde(default)]
    pattern: Option<String>,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let pool = db::connect_pool(&config).await?;
        let config = Arc::new(config);
        let cache = build_cache(&config).await;
        let engine = QueryEngine::new(
            Arc::new(Catalog::restaurant()),
            Arc::new(PgExecutor::new(pool)),
            cache,
            Arc::clone(&config),
        );
        let state = AppState::new(Arc::clone(&config), engine);

        Ok(Self { config, state })
    }

    fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "analytics API listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Connects the configured cache backend. An unreachable Redis disables caching.
async fn build_cache(config: &AppConfig) -> QueryCache {
    let store: Option<Arc<dyn CacheStore>> = match &config.cache {
        CacheBackend::Redis { url } => match RedisStore::connect(url).await {
            Ok(store) => {
                info!("redis query cache connected");
                Some(Arc::new(store))
            }
            Err(err) => {
                warn!(error = %err, "redis unavailable, query cache disabled");
                None
            }
        },
        CacheBackend::Memory => {
            info!("in-process query cache enabled");
            Some(Arc::new(MemoryStore::new()))
        }
        CacheBackend::Disabled => None,
    };
    QueryCache::new(store, config.cache_ttl)
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/query", post(query))
        .route("/translate", post(translate))
        .route("/kpis", get(kpis))
        .route("/compare", post(compare))
        .route("/dimensions/stores", get(stores))
        .route("/dimensions/channels", get(channels))
        .route("/dimensions/products", get(products))
        .route("/dimensions/regions", get(regions))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(clear_cache))
        .route("/cache/query", delete(invalidate_query));

    let mut router = Router::new()
        .route("/healthz", get(health))
        .nest(API_PREFIX, api)
        .with_state(state.clone())
        .layer(TimeoutLayer::new(state.config.request_timeout));

    if let Some(cors) = cors_layer(state.config.allowed_origins.as_deref()) {
        router = router.layer(cors);
    }

    router.layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: Option<&[String]>) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins?
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": SERVICE_NAME }))
}

async fn query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AnalyticsQueryRequest>,
) -> Result<Json<QueryResponse>> {
    state.authorize(&headers)?;
    Ok(Json(state.engine.execute_query(request).await?))
}

async fn translate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AnalyticsQueryRequest>,
) -> Result<Json<TranslateResponse>> {
    state.authorize(&headers)?;
    Ok(Json(state.engine.translate(request)?))
}

async fn kpis(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<KpiParams>,
) -> Result<Json<KpiDashboard>> {
    state.authorize(&headers)?;
    let request = params.into_request()?;
    Ok(Json(state.engine.kpis(request).await?))
}

async fn compare(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ComparisonRequest>,
) -> Result<Json<PeriodComparisonResponse>> {
    state.authorize(&headers)?;
    Ok(Json(state.engine.compare(request).await?))
}

async fn list_dimension(
    state: &AppState,
    headers: &HeaderMap,
    kind: DimensionKind,
    limit: Option<i64>,
) -> Result<Json<DimensionValuesResponse>> {
    state.authorize(headers)?;
    Ok(Json(state.engine.dimension_values(kind, limit).await?))
}

async fn stores(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DimensionValuesResponse>> {
    list_dimension(&state, &headers, DimensionKind::Stores, None).await
}

async fn channels(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DimensionValuesResponse>> {
    list_dimension(&state, &headers, DimensionKind::Channels, None).await
}

async fn products(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<LimitParams>,
) -> Result<Json<DimensionValuesResponse>> {
    list_dimension(&state, &headers, DimensionKind::Products, params.limit).await
}

async fn regions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DimensionValuesResponse>> {
    list_dimension(&state, &headers, DimensionKind::Regions, None).await
}

async fn cache_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CacheStats>> {
    state.authorize(&headers)?;
    Ok(Json(state.engine.cache_stats().await))
}

async fn clear_cache(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ClearParams>,
) -> Result<Json<Value>> {
    state.authorize(&headers)?;
    let pattern = params
        .pattern
        .filter(|pattern| !pattern.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CLEAR_PATTERN.to_string());
    let deleted = state.engine.clear_cache(&pattern).await;
    info!(%pattern, deleted, "cache entries cleared");
    Ok(Json(json!({ "deleted": deleted, "pattern": pattern })))
}

async fn invalidate_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AnalyticsQueryRequest>,
) -> Result<Json<Value>> {
    state.authorize(&headers)?;
    let deleted = state.engine.invalidate_query(request).await?;
    Ok(Json(json!({ "deleted": deleted })))
}
