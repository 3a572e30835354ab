use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env,
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

/// Hard cap on rows returned by a single analytics query.
pub const HARD_MAX_LIMIT: i64 = 1000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub min_pool_idle: u32,
    pub max_pool_size: u32,
    pub pool_timeout: Duration,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_ssl_cert: Option<String>,
    pub pg_ssl_key: Option<String>,
    pub cache: CacheBackend,
    pub cache_ttl: Duration,
    pub api_key: Option<String>,
    pub allowed_origins: Option<Vec<String>>,
    pub default_limit: i64,
    pub max_limit: i64,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackend {
    Redis { url: String },
    Memory,
    Disabled,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    analytics_listen_addr: Option<String>,
    #[serde(default)]
    analytics_listen_host: Option<String>,
    #[serde(default)]
    analytics_listen_port: Option<u16>,
    #[serde(default)]
    analytics_database_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default = "default_min_idle")]
    analytics_min_pool_idle: u32,
    #[serde(default = "default_pool_size")]
    analytics_max_pool_size: u32,
    #[serde(default = "default_pool_timeout_secs")]
    analytics_pool_timeout_secs: u64,
    #[serde(default)]
    pgsslrootcert: Option<String>,
    #[serde(default)]
    pgsslcert: Option<String>,
    #[serde(default)]
    pgsslkey: Option<String>,
    #[serde(default)]
    analytics_cache_backend: Option<String>,
    #[serde(default)]
    analytics_redis_url: Option<String>,
    #[serde(default)]
    redis_url: Option<String>,
    #[serde(default = "default_cache_ttl_secs")]
    analytics_cache_ttl_secs: u64,
    #[serde(default)]
    analytics_api_key: Option<String>,
    #[serde(default)]
    analytics_allowed_origins: Option<String>,
    #[serde(default = "default_limit")]
    analytics_default_limit: i64,
    #[serde(default = "default_max_limit")]
    analytics_max_limit: i64,
    #[serde(default = "default_timeout_secs")]
    analytics_request_timeout_secs: u64,
}

const fn default_min_idle() -> u32 {
    5
}

const fn default_pool_size() -> u32 {
    20
}

const fn default_pool_timeout_secs() -> u64 {
    60
}

const fn default_cache_ttl_secs() -> u64 {
    300
}

const fn default_limit() -> i64 {
    100
}

const fn default_max_limit() -> i64 {
    HARD_MAX_LIMIT
}

const fn default_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse ANALYTICS_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.analytics_listen_addr,
            raw.analytics_listen_host,
            raw.analytics_listen_port,
        )?;

        let database_url = raw
            .analytics_database_url
            .or(raw.database_url)
            .or_else(|| env::var("DATABASE_URL").ok())
            .context("ANALYTICS_DATABASE_URL or DATABASE_URL must be set")?;

        let cache = resolve_cache_backend(
            raw.analytics_cache_backend.as_deref(),
            raw.analytics_redis_url.or(raw.redis_url),
        )?;

        let max_limit = raw.analytics_max_limit.clamp(1, HARD_MAX_LIMIT);
        let max_pool_size = raw.analytics_max_pool_size.max(1);

        Ok(Self {
            listen_addr,
            database_url,
            min_pool_idle: raw.analytics_min_pool_idle.min(max_pool_size),
            max_pool_size,
            pool_timeout: Duration::from_secs(raw.analytics_pool_timeout_secs.max(1)),
            pg_ssl_root_cert: raw.pgsslrootcert,
            pg_ssl_cert: raw.pgsslcert,
            pg_ssl_key: raw.pgsslkey,
            cache,
            cache_ttl: Duration::from_secs(raw.analytics_cache_ttl_secs.max(1)),
            api_key: raw.analytics_api_key,
            allowed_origins: raw.analytics_allowed_origins.as_deref().and_then(parse_csv),
            default_limit: raw.analytics_default_limit.clamp(1, max_limit),
            max_limit,
            request_timeout: Duration::from_secs(raw.analytics_request_timeout_secs.max(1)),
        })
    }

    /// Configuration for in-process use where no listener or database is started.
    pub fn embedded(database_url: String) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            database_url,
            min_pool_idle: 0,
            max_pool_size: 1,
            pool_timeout: Duration::from_secs(5),
            pg_ssl_root_cert: None,
            pg_ssl_cert: None,
            pg_ssl_key: None,
            cache: CacheBackend::Memory,
            cache_ttl: Duration::from_secs(default_cache_ttl_secs()),
            api_key: None,
            allowed_origins: None,
            default_limit: default_limit(),
            max_limit: HARD_MAX_LIMIT,
            request_timeout: Duration::from_secs(default_timeout_secs()),
        }
    }
}

fn resolve_cache_backend(backend: Option<&str>, redis_url: Option<String>) -> Result<CacheBackend> {
    match backend.map(|value| value.trim().to_lowercase()).as_deref() {
        None | Some("") => Ok(match redis_url {
            Some(url) => CacheBackend::Redis { url },
            None => CacheBackend::Disabled,
        }),
        Some("redis") => {
            let url = redis_url
                .context("ANALYTICS_CACHE_BACKEND=redis requires ANALYTICS_REDIS_URL or REDIS_URL")?;
            Ok(CacheBackend::Redis { url })
        }
        Some("memory") => Ok(CacheBackend::Memory),
        Some("none") | Some("disabled") => Ok(CacheBackend::Disabled),
        Some(other) => anyhow::bail!("unsupported ANALYTICS_CACHE_BACKEND '{other}'"),
    }
}

fn parse_csv(csv: &str) -> Option<Vec<String>> {
    let entries: Vec<_> = csv
        .split(',')
        .filter_map(|part| {
            let entry = part.trim();
            if entry.is_empty() {
                None
            } else {
                Some(entry.to_string())
            }
        })
        .collect();
    if entries.is_empty() {
        None
    } else {
        Some(entries)
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid ANALYTICS_LISTEN_ADDR value")?
            .next()
            .context("ANALYTICS_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8000);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid analytics listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
