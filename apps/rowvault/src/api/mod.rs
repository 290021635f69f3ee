//! # rowvault HTTP API Module
//!
//! This module implements the HTTP REST API server using axum.
//!
//! ## Endpoints
//!
//! - `GET /health`, `GET /status`
//! - `/entities`, `/relations`, `/observations`: knowledge-graph records
//! - `/results`: chunked result storage, summaries, chunk reads, analytics
//! - `/bloom`: filter build, search, stats, export, removal
//! - `/cache`: similarity cache get/put/similar/sweep/clear/stats
//!
//! ## Security Configuration (Environment Variables)
//!
//! - `ROWVAULT_CORS_ORIGINS`: Comma-separated list of allowed origins, or "*" for all (default: localhost only)
//! - `ROWVAULT_API_KEY`: If set, requires Bearer token authentication
//!
//! The rate limit comes from `[server] rate_limit` (or `ROWVAULT_RATE_LIMIT`).

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::get_api_key_from_env;
pub use handlers::ApiError;
pub use middleware::create_rate_limiter;
pub use types::{
    AddObservationRequest, AnalyzeRequest, BloomStatsResponse, BuildFilterRequest,
    CacheGetResponse, CacheLookupRequest, CachePutRequest, CachePutResponse, CacheSimilarRequest,
    ChunkQuery, ChunksResponse, ClearResponse, CreateEntityRequest, CreateRelationRequest,
    EntitySearchQuery, ErrorResponse, ExportFilterResponse, FilterSearchRequest, HealthResponse,
    StatusResponse, StoreResultRequest, TypeFilterQuery,
};

use crate::config::Config;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{delete, get, post},
};
use rowvault_core::primitives::{AUTO_BLOOM_THRESHOLD, DEFAULT_CHUNK_SIZE};
use rowvault_core::{
    AnalyticsEngine, AutoBloomHook, BloomManager, CacheConfig, ChunkedResultStore, Clock,
    EntityStore, FilterIndex, PersistentBloomIndex, SimilarityCache, SystemClock, TenantId,
    VaultError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// How often the server sweeps expired cache entries.
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// SERVER STATE
// =============================================================================

/// Tunables the handlers and router read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub default_chunk_size: usize,
    /// Requests per second; 0 disables limiting.
    pub rate_limit: u32,
    pub body_limit_bytes: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            rate_limit: 0,
            body_limit_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Shared server state: one service object per component, one tenant.
#[derive(Clone)]
pub struct AppState {
    pub tenant: TenantId,
    pub entities: Arc<EntityStore>,
    pub results: Arc<ChunkedResultStore>,
    pub bloom: Arc<dyn FilterIndex>,
    pub cache: Arc<SimilarityCache>,
    pub analytics: Arc<AnalyticsEngine>,
    pub settings: ServiceSettings,
    /// Set when filters are persisted; closed once at shutdown.
    persistent_bloom: Option<Arc<PersistentBloomIndex>>,
}

impl AppState {
    /// Volatile state with default tunables.
    pub fn in_memory(tenant: TenantId) -> Self {
        let entities = Arc::new(EntityStore::in_memory(tenant.clone()));
        let bloom: Arc<dyn FilterIndex> = Arc::new(BloomManager::new());
        Self::assemble(
            tenant,
            entities,
            bloom,
            None,
            Arc::new(SimilarityCache::default()),
            AUTO_BLOOM_THRESHOLD,
            None,
            ServiceSettings::default(),
        )
    }

    /// Open durable state under `config.data_dir` for the configured tenant.
    ///
    /// The entity store degrades to memory on its own. A bloom directory
    /// that cannot be opened degrades to the in-memory manager.
    pub fn open(config: &Config) -> Result<Self, VaultError> {
        let tenant = config.tenant_id()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let rate = config.bloom.false_positive_rate;

        let entities = Arc::new(EntityStore::open_with_clock(
            tenant.clone(),
            &config.data_dir,
            clock.clone(),
        ));

        let (bloom, persistent) =
            match PersistentBloomIndex::open(&config.data_dir, tenant.clone(), rate, clock.clone()) {
                Ok(index) => {
                    let index = Arc::new(index);
                    let shared: Arc<dyn FilterIndex> = index.clone();
                    (shared, Some(index))
                }
                Err(e) => {
                    tracing::warn!(tenant = %tenant, error = %e, "bloom filters will not be persisted");
                    let manager: Arc<dyn FilterIndex> =
                        Arc::new(BloomManager::with_config(rate, clock.clone())?);
                    (manager, None)
                }
            };

        let cache = SimilarityCache::new(config.cache.to_cache_config(), clock)?;

        let settings = ServiceSettings {
            default_chunk_size: config.chunking.default_chunk_size,
            rate_limit: config.server.rate_limit,
            body_limit_bytes: config.server.body_limit_bytes,
        };

        Ok(Self::assemble(
            tenant,
            entities,
            bloom,
            persistent,
            Arc::new(cache),
            config.chunking.auto_bloom_threshold,
            Some(config.analytics.default_row_limit),
            settings,
        ))
    }

    fn assemble(
        tenant: TenantId,
        entities: Arc<EntityStore>,
        bloom: Arc<dyn FilterIndex>,
        persistent_bloom: Option<Arc<PersistentBloomIndex>>,
        cache: Arc<SimilarityCache>,
        auto_bloom_threshold: usize,
        row_limit: Option<usize>,
        settings: ServiceSettings,
    ) -> Self {
        let results = Arc::new(ChunkedResultStore::new(entities.clone()));
        results.register_hook(Arc::new(AutoBloomHook::new(bloom.clone(), auto_bloom_threshold)));

        let mut analytics = AnalyticsEngine::new(results.clone());
        if let Some(limit) = row_limit {
            analytics = analytics.with_row_limit(limit);
        }

        tracing::info!(
            tenant = %tenant,
            persistent_entities = entities.is_persistent(),
            persistent_filters = persistent_bloom.is_some(),
            "services ready"
        );

        Self {
            tenant,
            entities,
            results,
            bloom,
            cache,
            analytics: Arc::new(analytics),
            settings,
            persistent_bloom,
        }
    }

    /// Replace the tunables (tests and embedding callers).
    #[must_use]
    pub fn with_settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the cache, e.g. with one driven by a manual clock.
    pub fn with_cache(mut self, config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, VaultError> {
        self.cache = Arc::new(SimilarityCache::new(config, clock)?);
        Ok(self)
    }

    pub fn bloom_stats(&self) -> BloomStatsResponse {
        BloomStatsResponse {
            filters: self.bloom.filter_stats(),
            memory_bytes: self.bloom.memory_usage(),
        }
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            tenant: self.tenant.to_string(),
            memory: self.entities.memory_stats(),
            bloom: self.bloom_stats(),
            cache: self.cache.stats(),
        }
    }

    /// Flush and close persisted filters. Returns the number of filters written.
    ///
    /// Safe to call more than once; later calls write nothing.
    pub fn shutdown(&self) -> Result<usize, VaultError> {
        match &self.persistent_bloom {
            Some(index) => index.close(),
            None => Ok(0),
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build CORS layer from `ROWVAULT_CORS_ORIGINS`.
///
/// - "*": allows all origins
/// - unset: localhost only
/// - otherwise: comma-separated list of allowed origins
fn build_cors_layer() -> CorsLayer {
    let origins_env = std::env::var("ROWVAULT_CORS_ORIGINS").ok();

    match origins_env.as_deref() {
        Some("*") => {
            tracing::warn!("CORS: allowing ALL origins (ROWVAULT_CORS_ORIGINS=*)");
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed_origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| {
                    let trimmed = s.trim();
                    match trimmed.parse::<HeaderValue>() {
                        Ok(hv) => Some(hv),
                        Err(e) => {
                            tracing::warn!("CORS: invalid origin '{}': {}", trimmed, e);
                            None
                        }
                    }
                })
                .collect();

            if allowed_origins.is_empty() {
                tracing::warn!("CORS: no valid origins in ROWVAULT_CORS_ORIGINS, using localhost");
                build_localhost_cors()
            } else {
                restricted_cors(allowed_origins)
            }
        }
        None => build_localhost_cors(),
    }
}

fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();

    restricted_cors(origins)
}

fn restricted_cors(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner):
/// 1. Tracing
/// 2. CORS
/// 3. Body limit
/// 4. Rate limiting (if enabled)
/// 5. Authentication (if `ROWVAULT_API_KEY` is set)
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer();

    let rate_limiter = if state.settings.rate_limit > 0 {
        tracing::info!("Rate limiting enabled: {} requests/second", state.settings.rate_limit);
        Some(create_rate_limiter(state.settings.rate_limit))
    } else {
        None
    };

    let has_auth = get_api_key_from_env().is_some();
    if has_auth {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!(
            "API key authentication DISABLED: set ROWVAULT_API_KEY to require a Bearer token"
        );
    }

    let body_limit = state.settings.body_limit_bytes;

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        // Knowledge graph
        .route("/entities", post(handlers::create_entity_handler))
        .route("/entities/search", get(handlers::search_entities_handler))
        .route(
            "/entities/{entity}",
            get(handlers::get_entity_handler).delete(handlers::delete_entity_handler),
        )
        .route(
            "/entities/{entity}/observations",
            get(handlers::get_observations_handler).post(handlers::add_observation_handler),
        )
        .route("/entities/{entity}/relations", get(handlers::get_relations_handler))
        .route("/relations", post(handlers::create_relation_handler))
        .route("/relations/{id}", delete(handlers::delete_relation_handler))
        .route("/observations/{id}", delete(handlers::delete_observation_handler))
        // Chunked results
        .route("/results", post(handlers::store_result_handler))
        .route("/results/{id}/summary", get(handlers::get_summary_handler))
        .route("/results/{id}/chunks", get(handlers::get_chunks_handler))
        .route("/results/{id}/analyze", post(handlers::analyze_handler))
        // Bloom filters
        .route("/bloom/stats", get(handlers::bloom_stats_handler))
        .route("/bloom/{dataset}", delete(handlers::remove_filter_handler))
        .route("/bloom/{dataset}/build", post(handlers::build_filter_handler))
        .route("/bloom/{dataset}/search", post(handlers::search_filter_handler))
        .route("/bloom/{dataset}/export", get(handlers::export_filter_handler))
        // Cache
        .route("/cache/get", post(handlers::cache_get_handler))
        .route("/cache/put", post(handlers::cache_put_handler))
        .route("/cache/similar", post(handlers::cache_similar_handler))
        .route("/cache/clear-expired", post(handlers::cache_clear_expired_handler))
        .route("/cache/clear", post(handlers::cache_clear_handler))
        .route("/cache/stats", get(handlers::cache_stats_handler));

    if has_auth {
        router = router.layer(axum_middleware::from_fn(auth::api_key_auth_middleware));
    }

    if let Some(limiter) = rate_limiter {
        router = router.layer(axum_middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    router
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Periodically drop expired cache entries.
pub fn spawn_cache_sweeper(cache: Arc<SimilarityCache>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = cache.clear_expired();
            if removed > 0 {
                tracing::info!(removed, "swept expired cache entries");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

/// Start the HTTP server and run until Ctrl-C.
pub async fn run_server(addr: &str, state: AppState) -> Result<(), VaultError> {
    let router = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| VaultError::IoError(format!("Bind failed: {}", e)))?;

    tracing::info!(tenant = %state.tenant, "rowvault HTTP server listening on {}", addr);

    let sweeper = spawn_cache_sweeper(state.cache.clone(), CACHE_SWEEP_INTERVAL);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| VaultError::IoError(format!("Server error: {}", e)));

    sweeper.abort();
    match state.shutdown() {
        Ok(written) => tracing::info!(written, "filters flushed"),
        Err(e) => tracing::error!(error = %e, "failed to flush filters"),
    }

    served
}

// =============================================================================
// TESTS
// =============================================================================
