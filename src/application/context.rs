use std::sync::Arc;

use tracing::info;

use crate::{
    application::error::AppError,
    cache::{AlwaysAvailable, CacheManager, SyncCoordinator, SystemClock},
    config::Settings,
    infra::{db::SqliteStore, error::InfraError, remote::HttpRemote},
    remote::{OfflineRemote, RemoteSource},
};

/// Everything a command needs, built once from [`Settings`].
#[derive(Clone)]
pub struct CacheContext {
    pub store: SqliteStore,
    pub manager: CacheManager,
    pub sync: SyncCoordinator,
}

impl CacheContext {
    /// Open the database, apply migrations, wire the cache core and clear
    /// refresh flags left behind by a previous process.
    pub async fn build(settings: &Settings) -> Result<Self, AppError> {
        let pool = SqliteStore::connect(
            &settings.database.url,
            settings.database.max_connections.get(),
        )
        .await
        .map_err(|err| InfraError::open(&settings.database.url, err))?;
        SqliteStore::run_migrations(&pool)
            .await
            .map_err(InfraError::from)?;
        let store = SqliteStore::new(pool);

        let remote: Arc<dyn RemoteSource> = match settings.api.base_url.as_deref() {
            Some(base_url) => Arc::new(
                HttpRemote::new(base_url, settings.api.timeout)
                    .map_err(|err| InfraError::endpoint(base_url, err))?,
            ),
            None => {
                info!(
                    target = "postcache::context",
                    "api.base_url not set; running offline"
                );
                Arc::new(OfflineRemote)
            }
        };

        let manager = CacheManager::new(
            Arc::new(store.clone()),
            remote,
            Arc::new(SystemClock),
            settings.cache.clone(),
        );
        manager.recover().await?;

        let sync = manager.sync_coordinator(Arc::new(AlwaysAvailable), settings.sync);

        Ok(Self {
            store,
            manager,
            sync,
        })
    }
}
