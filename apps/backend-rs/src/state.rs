use std::{sync::Arc, time::Duration};

use moka::future::Cache;
use reqwest::Client;
use serde_json::Value;
use sqlx::PgPool;

use crate::{
    config::AppConfig,
    db::build_pool,
    error::{AppError, AppResult},
    services::storage::ObjectStorage,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub http_client: Client,
    pub storage: Option<ObjectStorage>,
    /// Keyed by `{org_id}:{user_id}`; `None` caches a confirmed non-membership.
    pub org_membership_cache: Cache<String, Option<Value>>,
}

impl AppState {
    pub async fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let db_pool = build_pool(&config)?;

        let http_client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;

        let storage = ObjectStorage::from_config(&config).await;
        if storage.is_none() {
            tracing::warn!("STORAGE_BUCKET is not set, document uploads are disabled");
        }

        let org_membership_cache = Cache::builder()
            .max_capacity(config.org_membership_cache_max_entries)
            .time_to_live(Duration::from_secs(
                config.org_membership_cache_ttl_seconds.max(1),
            ))
            .build();

        Ok(Self {
            config: Arc::new(config),
            db_pool,
            http_client,
            storage,
            org_membership_cache,
        })
    }

    pub fn pool(&self) -> AppResult<&PgPool> {
        self.db_pool.as_ref().ok_or_else(|| {
            AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
        })
    }
}
