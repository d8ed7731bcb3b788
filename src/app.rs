use crate::config::Settings;
use crate::constants::cache as cache_constants;
use crate::errors::ToolError;
use crate::managers::assets::AssetsManager;
use crate::managers::discovery::DiscoveryManager;
use crate::managers::query::QueryManager;
use crate::managers::ToolHandler;
use crate::services::auth::TokenManager;
use crate::services::cache::TtlCache;
use crate::services::client::EmsClient;
use crate::services::logger::Logger;
use crate::services::reference_store::ReferenceStore;
use crate::services::resolver::Resolver;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Wires the service graph once at startup. Everything downstream borrows
/// shared `Arc` handles; no service is a global.
pub struct App {
    pub settings: Arc<Settings>,
    pub client: Arc<EmsClient>,
    pub resolver: Arc<Resolver>,
    pub reference_store: Arc<ReferenceStore>,
    pub handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl App {
    pub fn initialize() -> Result<Self, ToolError> {
        let settings = Arc::new(Settings::from_env()?);
        Self::with_settings(settings)
    }

    pub fn with_settings(settings: Arc<Settings>) -> Result<Self, ToolError> {
        let logger = Logger::new("ems");

        let token_manager = Arc::new(TokenManager::new(logger.clone(), settings.clone()));
        let client = Arc::new(EmsClient::new(
            logger.clone(),
            settings.clone(),
            token_manager,
        ));

        let field_cache: Arc<TtlCache<Value>> = Arc::new(TtlCache::new(
            logger.child("field_cache"),
            settings.cache_ttl_secs,
            cache_constants::MAX_ENTRIES,
        ));
        let database_cache: Arc<TtlCache<Value>> = Arc::new(TtlCache::new(
            logger.child("database_cache"),
            settings.cache_ttl_secs,
            cache_constants::MAX_ENTRIES,
        ));
        let reference_store = Arc::new(ReferenceStore::new());

        let resolver = Arc::new(Resolver::new(
            logger.clone(),
            client.clone(),
            field_cache.clone(),
            database_cache.clone(),
            reference_store.clone(),
        ));

        let discovery = Arc::new(DiscoveryManager::new(
            logger.clone(),
            settings.clone(),
            client.clone(),
            resolver.clone(),
            database_cache,
            field_cache,
            reference_store.clone(),
        ));
        let query = Arc::new(QueryManager::new(
            logger.clone(),
            settings.clone(),
            client.clone(),
            resolver.clone(),
        ));
        let assets = Arc::new(AssetsManager::new(
            logger,
            settings.clone(),
            client.clone(),
        ));

        let mut handlers: HashMap<String, Arc<dyn ToolHandler>> = HashMap::new();
        handlers.insert("ems_discovery".to_string(), discovery);
        handlers.insert("ems_query".to_string(), query);
        handlers.insert("ems_assets".to_string(), assets);

        Ok(Self {
            settings,
            client,
            resolver,
            reference_store,
            handlers,
        })
    }
}
