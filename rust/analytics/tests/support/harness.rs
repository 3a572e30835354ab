use analytics::{
    cache::{MemoryStore, QueryCache},
    catalog::Catalog,
    config::AppConfig,
    db,
    query::{PgExecutor, QueryEngine},
    server::build_router,
    state::{AppState, API_KEY_HEADER},
};
use axum::{
    body::{self, Body},
    http::{self, Method, Request, StatusCode},
    Router,
};
use serde::Serialize;
use serde_json::Value;
use std::{
    env, fs,
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, Once},
    time::Duration,
};
use tokio::{task::JoinHandle, time::sleep};
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";
const DB_CONNECT_RETRIES: usize = 40;
const DB_CONNECT_DELAY_MS: u64 = 250;
const FIXTURE_LOCK_ID: i64 = 7_310_224;

static TRACING_INIT: Once = Once::new();

/// Router under test plus the key it expects, if any.
#[derive(Clone)]
pub struct TestApp {
    router: Router,
    api_key: Option<String>,
}

impl TestApp {
    pub fn new(router: Router, api_key: Option<&str>) -> Self {
        Self {
            router,
            api_key: api_key.map(str::to_string),
        }
    }

    pub async fn get(&self, path: &str) -> http::Response<Body> {
        self.send(Method::GET, path, None::<&()>, true).await
    }

    pub async fn post<T: Serialize>(&self, path: &str, payload: &T) -> http::Response<Body> {
        self.send(Method::POST, path, Some(payload), true).await
    }

    pub async fn delete<T: Serialize>(&self, path: &str, payload: &T) -> http::Response<Body> {
        self.send(Method::DELETE, path, Some(payload), true).await
    }

    pub async fn post_without_api_key<T: Serialize>(
        &self,
        path: &str,
        payload: &T,
    ) -> http::Response<Body> {
        self.send(Method::POST, path, Some(payload), false).await
    }

    pub async fn send<T: Serialize>(
        &self,
        method: Method,
        path: &str,
        payload: Option<&T>,
        include_api_key: bool,
    ) -> http::Response<Body> {
        let mut builder = Request::builder().method(method).uri(path);
        if include_api_key {
            if let Some(key) = &self.api_key {
                builder = builder.header(API_KEY_HEADER, key);
            }
        }

        let body = match payload {
            Some(payload) => {
                builder = builder.header(http::header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(payload).expect("request payload should serialize"))
            }
            None => Body::empty(),
        };
        let request = builder.body(body).expect("failed to build test request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle test request")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should be readable");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}

/// Runs `test` against the analytics API backed by the seeded PostgreSQL fixture.
/// Skips when `ANALYTICS_TEST_DATABASE_URL` is not set.
pub async fn with_pg_harness<F, Fut>(test: F)
where
    F: FnOnce(TestApp) -> Fut,
    Fut: Future<Output = ()>,
{
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });

    let database_url = match read_env_value("ANALYTICS_TEST_DATABASE_URL")
        .expect("failed to read fixture database config")
    {
        Some(url) => url,
        None => {
            eprintln!("[analytics-test] skipping: ANALYTICS_TEST_DATABASE_URL is not set");
            return;
        }
    };

    let (client, _task) = connect_with_retry(&database_url)
        .await
        .expect("fixture database should be reachable");
    client
        .execute("SELECT pg_advisory_lock($1)", &[&FIXTURE_LOCK_ID])
        .await
        .expect("failed to take fixture lock");
    seed_fixture_database(&client)
        .await
        .expect("failed to seed fixture database");

    let config = Arc::new(test_config(database_url));
    let pool = db::connect_pool(&config)
        .await
        .expect("failed to build analytics pool");
    let engine = QueryEngine::new(
        Arc::new(Catalog::restaurant()),
        Arc::new(PgExecutor::new(pool)),
        QueryCache::new(Some(Arc::new(MemoryStore::new())), config.cache_ttl),
        Arc::clone(&config),
    );
    let app = TestApp::new(
        build_router(AppState::new(config, engine)),
        Some(API_KEY),
    );

    test(app).await;

    let _ = client
        .execute("SELECT pg_advisory_unlock($1)", &[&FIXTURE_LOCK_ID])
        .await;
}

fn test_config(database_url: String) -> AppConfig {
    let mut config = AppConfig::embedded(database_url);
    config.max_pool_size = 4;
    config.pg_ssl_root_cert = env::var("PGSSLROOTCERT").ok();
    config.pg_ssl_cert = env::var("PGSSLCERT").ok();
    config.pg_ssl_key = env::var("PGSSLKEY").ok();
    config.api_key = Some(API_KEY.to_string());
    config.cache_ttl = Duration::from_secs(30);
    config
}

async fn seed_fixture_database(client: &Client) -> anyhow::Result<()> {
    client.batch_execute(&load_fixture("schema.sql")?).await?;
    client.batch_execute(&load_fixture("seed.sql")?).await?;
    Ok(())
}

async fn connect_with_retry(database_url: &str) -> anyhow::Result<(Client, JoinHandle<()>)> {
    let mut attempts = 0usize;
    loop {
        let config: PgConfig = database_url.parse()?;
        match connect_with_env_tls(config).await {
            Ok(connected) => return Ok(connected),
            Err(err) => {
                attempts += 1;
                if attempts >= DB_CONNECT_RETRIES {
                    return Err(err);
                }
                sleep(Duration::from_millis(DB_CONNECT_DELAY_MS)).await;
            }
        }
    }
}

async fn connect_with_env_tls(config: PgConfig) -> anyhow::Result<(Client, JoinHandle<()>)> {
    let root_cert = env::var("PGSSLROOTCERT")
        .ok()
        .filter(|value| !value.trim().is_empty());

    let (client, task) = match root_cert {
        Some(root) => {
            let connector = db::rustls_connector(
                &root,
                env::var("PGSSLCERT").ok().as_deref(),
                env::var("PGSSLKEY").ok().as_deref(),
            )?;
            let (client, connection) = config.connect(connector).await?;
            let task = tokio::spawn(async move {
                if let Err(err) = connection.await {
                    eprintln!("fixture connection closed with error: {err}");
                }
            });
            (client, task)
        }
        None => {
            let (client, connection) = config.connect(NoTls).await?;
            let task = tokio::spawn(async move {
                if let Err(err) = connection.await {
                    eprintln!("fixture connection closed with error: {err}");
                }
            });
            (client, task)
        }
    };
    Ok((client, task))
}

fn read_env_value(key: &str) -> anyhow::Result<Option<String>> {
    if let Ok(value) = env::var(key) {
        if value.trim().is_empty() {
            anyhow::bail!("{key} is set but empty");
        }
        return Ok(Some(value));
    }
    let file_key = format!("{key}_FILE");
    if let Ok(path) = env::var(&file_key) {
        let value = fs::read_to_string(&path)
            .map_err(|err| anyhow::anyhow!("failed to read {file_key} ({path}): {err}"))?
            .trim()
            .to_string();
        if value.is_empty() {
            anyhow::bail!("{file_key} pointed at an empty file");
        }
        return Ok(Some(value));
    }
    Ok(None)
}

fn load_fixture(name: &str) -> anyhow::Result<String> {
    let path = fixture_root().join(name);
    fs::read_to_string(&path)
        .map_err(|err| anyhow::anyhow!("failed to read fixture {name} from {:?}: {err}", path))
}

fn fixture_root() -> PathBuf {
    if let Ok(root) = env::var("ANALYTICS_FIXTURE_ROOT") {
        let candidate = PathBuf::from(root);
        if candidate.exists() {
            return candidate;
        }
    }

    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}
