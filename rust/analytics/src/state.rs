use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    query::QueryEngine,
};
use axum::http::HeaderMap;
use std::sync::Arc;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: QueryEngine,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, engine: QueryEngine) -> Self {
        Self { config, engine }
    }

    /// Rejects the request unless it carries the configured API key. No key, no check.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<()> {
        let Some(expected) = &self.config.api_key else {
            return Ok(());
        };
        let provided = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok());
        if provided != Some(expected.as_str()) {
            return Err(ServiceError::Auth);
        }
        Ok(())
    }
}
