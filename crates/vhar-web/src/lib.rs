//! JSON HTTP surface: ingestion targets for scheduled jobs and the vineyard
//! query endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, FromRequest, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use vhar_core::{
    BoundingBox, ErrorKind, HarvestError, ImageObservation, Observation, ObservationKind, PestObservation, Severity,
    TimeRange, Vineyard,
};
use vhar_storage::{BlobStore, CorrelationEngine, EnvironmentalSnapshot, SnapshotFilter};

pub const CRATE_NAME: &str = "vhar-web";

const DEFAULT_RECENT_LIMIT: i64 = 10;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CorrelationEngine>,
    pub blobs: Arc<dyn BlobStore>,
}

impl AppState {
    pub fn new(engine: Arc<CorrelationEngine>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { engine, blobs }
    }
}

/// A [`HarvestError`] rendered as a JSON error body with a matching status.
#[derive(Debug)]
pub struct ApiError(HarvestError);

impl From<HarvestError> for ApiError {
    fn from(err: HarvestError) -> Self {
        Self(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unavailable | ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(err: &HarvestError) -> serde_json::Value {
    json!({ "kind": err.kind(), "message": err.to_string() })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if status.is_server_error() {
            warn!(%status, error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": error_body(&self.0) }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(HarvestError::InvalidArgument(rejection.body_text()))
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `Json` whose rejections use the same error envelope as handler failures.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let started = Instant::now();
    let response = next.run(req).await;
    info!(
        %method,
        %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request handled"
    );
    response
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/vineyards", get(list_vineyards_handler).post(create_vineyard_handler))
        .route("/vineyards/{id}", get(vineyard_handler))
        .route("/vineyards/{id}/environmental-data", get(snapshot_handler))
        .route("/vineyards/{id}/observations/{kind}", get(list_observations_handler))
        .route("/vineyards/{id}/observations/{kind}/recent", get(recent_observations_handler))
        .route("/vineyards/{id}/pests", get(pests_handler))
        .route("/vineyards/{id}/imagery", post(imagery_upload_handler))
        .route("/observations", post(save_observation_handler))
        .route("/observations/batch", post(save_batch_handler))
        .route(
            "/observations/{kind}/{id}",
            get(get_observation_handler)
                .put(update_observation_handler)
                .delete(delete_observation_handler),
        )
        .layer(middleware::from_fn(log_requests))
        .with_state(Arc::new(state))
}

pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

fn parse_kind(raw: &str) -> ApiResult<ObservationKind> {
    Ok(raw.parse::<ObservationKind>()?)
}

/// Both ends or neither.
fn time_range(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> ApiResult<Option<TimeRange>> {
    match (start, end) {
        (Some(start), Some(end)) => Ok(Some(TimeRange::new(start, end)?)),
        (None, None) => Ok(None),
        _ => Err(HarvestError::invalid("`start` and `end` must be given together").into()),
    }
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_vineyards_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Vineyard>>> {
    Ok(Json(state.engine.vineyards().list().await?))
}

async fn create_vineyard_handler(
    State(state): State<Arc<AppState>>,
    ApiJson(vineyard): ApiJson<Vineyard>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let id = state.engine.vineyards().save(vineyard).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn vineyard_handler(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<Json<Vineyard>> {
    Ok(Json(state.engine.vineyards().get(id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    /// `minX,minY,maxX,maxY`
    bbox: Option<String>,
}

async fn snapshot_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<SnapshotQuery>,
) -> ApiResult<Json<EnvironmentalSnapshot>> {
    let filter = SnapshotFilter {
        range: time_range(query.start, query.end)?,
        area: query.bbox.as_deref().map(str::parse::<BoundingBox>).transpose()?,
    };
    Ok(Json(state.engine.snapshot_filtered(id, &filter).await?))
}

#[derive(Debug, Default, Deserialize)]
struct RangeQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

async fn list_observations_handler(
    State(state): State<Arc<AppState>>,
    Path((id, kind)): Path<(i64, String)>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Json<Vec<Observation>>> {
    let kind = parse_kind(&kind)?;
    let store = state.engine.observations();
    let rows = match time_range(query.start, query.end)? {
        Some(range) => store.list_by_date_range(kind, id, range.start(), range.end()).await?,
        None => store.list_by_vineyard(kind, id).await?,
    };
    Ok(Json(rows))
}

#[derive(Debug, Default, Deserialize)]
struct RecentQuery {
    limit: Option<i64>,
}

async fn recent_observations_handler(
    State(state): State<Arc<AppState>>,
    Path((id, kind)): Path<(i64, String)>,
    Query(query): Query<RecentQuery>,
) -> ApiResult<Json<Vec<Observation>>> {
    let kind = parse_kind(&kind)?;
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    Ok(Json(state.engine.observations().list_recent(kind, id, limit).await?))
}

#[derive(Debug, Default, Deserialize)]
struct PestQuery {
    pest_type: Option<String>,
    severity: Option<String>,
}

async fn pests_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<PestQuery>,
) -> ApiResult<Json<Vec<PestObservation>>> {
    let severity = query.severity.as_deref().map(str::parse::<Severity>).transpose()?;
    let pests = state
        .engine
        .filter_pests(id, query.pest_type.as_deref(), severity)
        .await?;
    Ok(Json(pests))
}

#[derive(Debug, Deserialize)]
struct ImageryQuery {
    captured_at: DateTime<Utc>,
    /// File extension for the stored blob; defaults to `bin`.
    format: Option<String>,
    resolution_meters: Option<f64>,
    /// Defaults to the vineyard's bounding box.
    bbox: Option<String>,
}

async fn imagery_upload_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<ImageryQuery>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    if body.is_empty() {
        return Err(HarvestError::invalid("imagery body is empty").into());
    }
    let vineyard = state.engine.vineyards().get(id).await?;
    let bounding_box = match query.bbox.as_deref() {
        Some(raw) => raw.parse::<BoundingBox>()?,
        None => vineyard.bounding_box,
    };

    let blob = state
        .blobs
        .put(id, query.format.as_deref().unwrap_or("bin"), &body)
        .await
        .map_err(|err| HarvestError::Internal(format!("storing imagery: {err:#}")))?;

    let observation = Observation::Image(ImageObservation {
        id: 0,
        vineyard_id: id,
        captured_at: query.captured_at,
        bounding_box,
        url: blob.url.clone(),
        resolution_meters: query.resolution_meters,
    });
    let observation_id = state.engine.observations().save(observation).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": observation_id,
            "url": blob.url,
            "content_hash": blob.content_hash,
            "deduplicated": blob.deduplicated,
        })),
    ))
}

async fn save_observation_handler(
    State(state): State<Arc<AppState>>,
    ApiJson(observation): ApiJson<Observation>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let kind = observation.kind();
    let id = state.engine.observations().save(observation).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id, "kind": kind }))))
}

#[derive(Debug, Default, Deserialize)]
struct BatchQuery {
    #[serde(default)]
    detailed: bool,
}

#[derive(Debug, Serialize)]
struct BatchItem {
    index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<serde_json::Value>,
}

async fn save_batch_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BatchQuery>,
    ApiJson(observations): ApiJson<Vec<Observation>>,
) -> ApiResult<Response> {
    let count = observations.len();
    if query.detailed {
        let items: Vec<BatchItem> = state
            .engine
            .save_many_detailed(observations)
            .await
            .into_iter()
            .enumerate()
            .map(|(index, result)| match result {
                Ok(id) => BatchItem {
                    index,
                    id: Some(id),
                    error: None,
                },
                Err(err) => BatchItem {
                    index,
                    id: None,
                    error: Some(error_body(&err)),
                },
            })
            .collect();
        return Ok(Json(json!({ "results": items })).into_response());
    }
    state.engine.save_many(observations).await?;
    Ok(Json(json!({ "submitted": count })).into_response())
}

async fn get_observation_handler(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, i64)>,
) -> ApiResult<Json<Observation>> {
    let kind = parse_kind(&kind)?;
    Ok(Json(state.engine.observations().get(kind, id).await?))
}

async fn update_observation_handler(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, i64)>,
    ApiJson(mut observation): ApiJson<Observation>,
) -> ApiResult<StatusCode> {
    let kind = parse_kind(&kind)?;
    if observation.kind() != kind {
        return Err(HarvestError::invalid(format!(
            "body is a {} observation but the path names {kind}",
            observation.kind()
        ))
        .into());
    }
    if observation.id() != 0 && observation.id() != id {
        return Err(HarvestError::invalid(format!(
            "body id {} does not match path id {id}",
            observation.id()
        ))
        .into());
    }
    observation.set_id(id);
    state.engine.observations().update(observation).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_observation_handler(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, i64)>,
) -> ApiResult<StatusCode> {
    let kind = parse_kind(&kind)?;
    state.engine.observations().delete(kind, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
