//! Pooled PostgreSQL access for the analytics store.

use crate::config::AppConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool};
use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::fs::File;
use std::io::BufReader;
use tokio_postgres::{Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{error, info};

pub type PgPool = Pool<PgConnectionManager>;

/// PEM files used to secure the connection to PostgreSQL.
#[derive(Debug, Clone, Default)]
pub struct TlsFiles<'a> {
    pub root_cert: Option<&'a str>,
    pub client_cert: Option<&'a str>,
    pub client_key: Option<&'a str>,
}

impl<'a> TlsFiles<'a> {
    fn from_config(config: &'a AppConfig) -> Self {
        Self {
            root_cert: config.pg_ssl_root_cert.as_deref(),
            client_cert: config.pg_ssl_cert.as_deref(),
            client_key: config.pg_ssl_key.as_deref(),
        }
    }
}

pub async fn connect_pool(config: &AppConfig) -> Result<PgPool> {
    let manager =
        PgConnectionManager::new(&config.database_url, TlsFiles::from_config(config))?;
    let pool = Pool::builder()
        .min_idle(Some(config.min_pool_idle))
        .max_size(config.max_pool_size)
        .connection_timeout(config.pool_timeout)
        .build(manager)
        .await
        .context("failed to build PostgreSQL connection pool")?;

    match pool.get().await {
        Ok(_) => info!(
            min_idle = config.min_pool_idle,
            max_size = config.max_pool_size,
            "database connectivity check succeeded"
        ),
        Err(err) => error!(error = ?err, "initial database connectivity check failed"),
    }

    Ok(pool)
}

#[derive(Clone)]
pub struct PgConnectionManager {
    config: PgConfig,
    tls: Option<MakeRustlsConnect>,
}

impl PgConnectionManager {
    pub fn new(database_url: &str, tls: TlsFiles<'_>) -> Result<Self> {
        let config = database_url
            .parse::<PgConfig>()
            .context("invalid DATABASE_URL")?;
        let tls = match tls.root_cert {
            Some(root) => Some(rustls_connector(root, tls.client_cert, tls.client_key)?),
            None => None,
        };
        Ok(Self { config, tls })
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = AsyncPgConnection;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let config = self.config.clone();
        let connection = match &self.tls {
            None => {
                let (client, connection) = config.connect(NoTls).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection).await
            }
            Some(connector) => {
                let (client, connection) = config.connect(connector.clone()).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection).await
            }
        };
        connection.map_err(|err| anyhow::anyhow!(err))
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.batch_execute("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, _: &mut Self::Connection) -> bool {
        false
    }
}

/// Builds the rustls connector shared by the pool and fixture tooling.
pub fn rustls_connector(
    root_cert: &str,
    client_cert: Option<&str>,
    client_key: Option<&str>,
) -> Result<MakeRustlsConnect> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(root_cert, "PGSSLROOTCERT")? {
        roots
            .add(cert)
            .map_err(|_| anyhow::anyhow!("invalid certificate in PGSSLROOTCERT"))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let client_config = match (client_cert, client_key) {
        (None, None) => builder.with_no_client_auth(),
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(read_certs(cert, "PGSSLCERT")?, read_key(key)?)
            .with_context(|| format!("failed to build client TLS config for {root_cert}"))?,
        _ => anyhow::bail!("PGSSLCERT and PGSSLKEY must both be set (or neither)"),
    };

    Ok(MakeRustlsConnect::new(client_config))
}

fn read_certs(path: &str, var: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open {var} file '{path}'"))?,
    );

    let chain = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse {var}"))?;
    if chain.is_empty() {
        anyhow::bail!("{var} contained no certificates");
    }

    Ok(chain)
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open PGSSLKEY file '{path}'"))?,
    );

    rustls_pemfile::private_key(&mut reader)
        .context("failed to parse PGSSLKEY")?
        .context("PGSSLKEY contained no private keys")
}
