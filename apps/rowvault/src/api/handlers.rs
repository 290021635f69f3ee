//! # API Endpoint Handlers
//!
//! Thin adapters from JSON to the core services. Row-heavy work (stores,
//! filter builds, searches, analytics) runs on the blocking pool.

use super::{
    AppState,
    types::{
        AddObservationRequest, AnalyzeRequest, BuildFilterRequest, CacheGetResponse,
        CacheLookupRequest, CachePutRequest, CachePutResponse, CacheSimilarRequest, ChunkQuery,
        ChunksResponse, ClearResponse, CreateEntityRequest, CreateRelationRequest,
        EntitySearchQuery, ErrorResponse, ExportFilterResponse, FilterSearchRequest,
        HealthResponse, StoreResultRequest, TypeFilterQuery,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::Engine;
use rowvault_core::{
    CacheScope, CancelFlag, Entity, EntityId, ObservationId, QueryFingerprint, RelationId,
    ResultKey, Row, StoreOptions, VaultError, codec,
};

// =============================================================================
// ERROR MAPPING
// =============================================================================

/// A core error on its way to becoming an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub VaultError);

impl From<VaultError> for ApiError {
    fn from(e: VaultError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            VaultError::NotFound { .. } | VaultError::NoData(_) => StatusCode::NOT_FOUND,
            VaultError::InvalidArgument(_)
            | VaultError::SchemaError(_)
            | VaultError::QueryError(_) => StatusCode::BAD_REQUEST,
            VaultError::Cancelled { .. } => StatusCode::CONFLICT,
            VaultError::StorageUnavailable(_)
            | VaultError::SerializationError(_)
            | VaultError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, "request rejected");
        }
        (status, Json(ErrorResponse::from_error(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run row-heavy core work off the async workers.
async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T, VaultError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError(VaultError::IoError(format!("worker task failed: {}", e))))?
        .map_err(ApiError)
}

/// Cancels a chunked store whose request went away.
struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn resolve_entity(state: &AppState, id_or_name: &str) -> ApiResult<Entity> {
    Ok(state.entities.get_entity(id_or_name)?)
}

/// Rows supplied inline or read back from a stored result (not both).
fn resolve_rows(
    state: &AppState,
    rows: Option<Vec<Row>>,
    entity_id: Option<u64>,
) -> Result<Option<Vec<Row>>, VaultError> {
    match (rows, entity_id) {
        (Some(_), Some(_)) => Err(VaultError::InvalidArgument(
            "give either rows or entity_id, not both".to_string(),
        )),
        (Some(rows), None) => Ok(Some(rows)),
        (None, Some(id)) => state.results.get_rows(EntityId(id)).map(Some),
        (None, None) => Ok(None),
    }
}

// =============================================================================
// HEALTH / STATUS
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

/// Combined component status.
pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status())
}

// =============================================================================
// KNOWLEDGE GRAPH
// =============================================================================

pub async fn create_entity_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateEntityRequest>,
) -> ApiResult<impl IntoResponse> {
    let entity = state
        .entities
        .create_entity(&request.name, &request.entity_type, request.metadata)?;
    Ok((StatusCode::CREATED, Json(entity)))
}

/// Look up by numeric id or by exact name.
pub async fn get_entity_handler(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(resolve_entity(&state, &entity)?))
}

/// Delete an entity with its relations and observations.
pub async fn delete_entity_handler(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let entity = resolve_entity(&state, &entity)?;
    Ok(Json(state.entities.delete_entity(entity.id)?))
}

pub async fn search_entities_handler(
    State(state): State<AppState>,
    Query(query): Query<EntitySearchQuery>,
) -> ApiResult<impl IntoResponse> {
    let hits = state
        .entities
        .search_entities(&query.q, query.type_filter.as_deref(), query.limit)?;
    Ok(Json(hits))
}

pub async fn add_observation_handler(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Json(request): Json<AddObservationRequest>,
) -> ApiResult<impl IntoResponse> {
    let entity = resolve_entity(&state, &entity)?;
    let observation = state.entities.add_observation(
        entity.id,
        request.content,
        &request.observation_type,
        request.metadata,
    )?;
    Ok((StatusCode::CREATED, Json(observation)))
}

pub async fn get_observations_handler(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Query(filter): Query<TypeFilterQuery>,
) -> ApiResult<impl IntoResponse> {
    let entity = resolve_entity(&state, &entity)?;
    Ok(Json(
        state
            .entities
            .get_observations(entity.id, filter.type_filter.as_deref()),
    ))
}

/// Relations touching the entity in either direction.
pub async fn get_relations_handler(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Query(filter): Query<TypeFilterQuery>,
) -> ApiResult<impl IntoResponse> {
    let entity = resolve_entity(&state, &entity)?;
    Ok(Json(
        state
            .entities
            .get_relations(entity.id, filter.type_filter.as_deref()),
    ))
}

pub async fn create_relation_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateRelationRequest>,
) -> ApiResult<impl IntoResponse> {
    let relation = state.entities.create_relation(
        EntityId(request.from),
        EntityId(request.to),
        &request.relation_type,
        request.properties,
    )?;
    Ok((StatusCode::CREATED, Json(relation)))
}

pub async fn delete_relation_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<StatusCode> {
    state.entities.delete_relation(RelationId(id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_observation_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<StatusCode> {
    state.entities.delete_observation(ObservationId(id))?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// CHUNKED RESULTS
// =============================================================================

/// Store a result set in chunks.
///
/// Dropping the request (client disconnect) cancels the store between chunks.
pub async fn store_result_handler(
    State(state): State<AppState>,
    Json(request): Json<StoreResultRequest>,
) -> ApiResult<impl IntoResponse> {
    let cancel = CancelFlag::new();
    let _guard = CancelOnDrop(cancel.clone());

    let key = ResultKey::new(request.query_id, request.network_id, request.snapshot_id);
    let options = StoreOptions {
        chunk_size: request
            .chunk_size
            .unwrap_or(state.settings.default_chunk_size),
        dataset_type: request.dataset_type,
        cancel: Some(cancel),
        ..StoreOptions::default()
    };
    let rows = request.rows;
    let columns = request.columns;
    let results = state.results.clone();

    let outcome =
        blocking(move || results.store_with_options(&key, &rows, &columns, &options)).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn get_summary_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.results.get_summary(EntityId(id))?))
}

/// All chunks in order, or just `?index=n`.
pub async fn get_chunks_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<ChunkQuery>,
) -> ApiResult<impl IntoResponse> {
    let payloads = state.results.get_chunks(EntityId(id))?;
    let chunk_count = payloads.len();

    let (offset, selected) = match query.index {
        Some(index) => {
            let payload = payloads.get(index).ok_or_else(|| {
                VaultError::not_found("chunk", format!("{}#{}", id, index), &state.tenant)
            })?;
            (index, std::slice::from_ref(payload))
        }
        None => (0, payloads.as_slice()),
    };

    let chunks = selected
        .iter()
        .map(|payload| codec::decode_chunk(payload))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(ChunksResponse {
        entity_id: id,
        chunk_count,
        offset,
        chunks,
    }))
}

/// Read-only SQL over the result's rows, as table `data`.
pub async fn analyze_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<AnalyzeRequest>,
) -> ApiResult<impl IntoResponse> {
    let analytics = state.analytics.clone();
    let result = blocking(move || analytics.run_query(EntityId(id), &request.sql)).await?;
    Ok(Json(result))
}

// =============================================================================
// BLOOM FILTERS
// =============================================================================

pub async fn build_filter_handler(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
    Json(request): Json<BuildFilterRequest>,
) -> ApiResult<impl IntoResponse> {
    let rows = resolve_rows(&state, request.rows, request.entity_id)?.ok_or_else(|| {
        VaultError::InvalidArgument("rows or entity_id is required".to_string())
    })?;
    let chunk_size = request
        .chunk_size
        .unwrap_or(state.settings.default_chunk_size);

    let bloom = state.bloom.clone();
    let tenant = state.tenant.clone();
    let metadata =
        blocking(move || bloom.build_filter(&tenant, &dataset, &rows, chunk_size)).await?;
    Ok(Json(metadata))
}

/// AND search; confirmed when rows (inline or stored) are supplied.
pub async fn search_filter_handler(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
    Json(request): Json<FilterSearchRequest>,
) -> ApiResult<impl IntoResponse> {
    let candidates = resolve_rows(&state, request.rows, request.entity_id)?;
    let terms = request.terms;

    let bloom = state.bloom.clone();
    let tenant = state.tenant.clone();
    let outcome =
        blocking(move || bloom.search(&tenant, &dataset, &terms, candidates.as_deref())).await?;
    Ok(Json(outcome))
}

pub async fn bloom_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.bloom_stats())
}

pub async fn export_filter_handler(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let bytes = state.bloom.export_filter(&state.tenant, &dataset)?;
    Ok(Json(ExportFilterResponse {
        dataset,
        size_bytes: bytes.len(),
        data: base64::engine::general_purpose::STANDARD.encode(&bytes),
    }))
}

pub async fn remove_filter_handler(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
) -> ApiResult<StatusCode> {
    state.bloom.remove_filter(&state.tenant, &dataset)?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// CACHE
// =============================================================================

fn cache_identity(request: &CacheLookupRequest) -> (QueryFingerprint, CacheScope) {
    (
        QueryFingerprint::of(&request.query, &request.parameters),
        CacheScope::new(request.network_id.as_str(), request.snapshot_id.as_str()),
    )
}

pub async fn cache_get_handler(
    State(state): State<AppState>,
    Json(request): Json<CacheLookupRequest>,
) -> impl IntoResponse {
    let (fingerprint, scope) = cache_identity(&request);
    let value = state.cache.get(&fingerprint, &state.tenant, &scope);
    Json(CacheGetResponse {
        fingerprint: fingerprint.to_string(),
        hit: value.is_some(),
        value,
    })
}

/// Best-effort insert: a rejected value is reported as `stored: false`, not as an error.
pub async fn cache_put_handler(
    State(state): State<AppState>,
    Json(request): Json<CachePutRequest>,
) -> impl IntoResponse {
    let (fingerprint, scope) = cache_identity(&request.lookup);
    let stored = state.cache.put_best_effort(
        &fingerprint,
        &state.tenant,
        &scope,
        &request.lookup.query,
        request.value,
    );
    let status = if stored { StatusCode::CREATED } else { StatusCode::OK };
    (
        status,
        Json(CachePutResponse {
            fingerprint: fingerprint.to_string(),
            stored,
        }),
    )
}

/// Earlier queries resembling this one, within this tenant.
pub async fn cache_similar_handler(
    State(state): State<AppState>,
    Json(request): Json<CacheSimilarRequest>,
) -> impl IntoResponse {
    Json(
        state
            .cache
            .find_similar(Some(&state.tenant), &request.query, request.limit),
    )
}

pub async fn cache_clear_expired_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(ClearResponse {
        removed: state.cache.clear_expired(),
    })
}

pub async fn cache_clear_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(ClearResponse {
        removed: state.cache.clear_all(),
    })
}

pub async fn cache_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.stats())
}
