//! HTTP API: selects, field listings and connector teardown per configured source.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use rowtap_connectors::{ConnectionDescriptor, QueryService};
use rowtap_core::{FieldCatalog, QueryError, QueryParams};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::DaemonMetrics;
use crate::sources::SourceCatalog;

pub struct AppState {
    pub service: QueryService,
    pub sources: SourceCatalog,
    pub metrics: DaemonMetrics,
}

impl AppState {
    fn source(&self, id: &str) -> Result<&ConnectionDescriptor, ApiError> {
        self.sources
            .get(id)
            .ok_or_else(|| ApiError::UnknownSource(id.to_string()))
    }

    fn refresh_cache_gauge(&self) {
        self.metrics.set_cached_connectors(self.service.store().len());
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    UnknownSource(String),
    NoConnector(String),
    Query(QueryError),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        ApiError::Query(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::UnknownSource(_) | ApiError::NoConnector(_) => StatusCode::NOT_FOUND,
            ApiError::Query(QueryError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Query(QueryError::ConnectorResolution(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Query(QueryError::Execution(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Query(QueryError::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match self {
            ApiError::UnknownSource(id) => format!("Unknown source '{}'", id),
            ApiError::NoConnector(id) => format!("No cached connector for '{}'", id),
            ApiError::Query(e) => e.to_string(),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/sources/:id/select — run one (possibly long-polling) select.
async fn select(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<QueryParams>,
) -> Result<Response, ApiError> {
    let descriptor = state.source(&id)?;
    let cancel = CancellationToken::new();
    // Dropped with the handler future when the client goes away.
    let _cancel_on_drop = cancel.clone().drop_guard();

    let outcome = state.service.select(&id, descriptor, &params, &cancel).await;
    state.refresh_cache_gauge();
    let body = match outcome {
        Ok(body) => body,
        Err(e) => {
            warn!("Select on '{}' failed: {}", id, e);
            state.metrics.record_query(e.kind());
            return Err(e.into());
        }
    };
    state.metrics.record_query("ok");
    state.metrics.rows_returned.inc_by(body.row_count() as u64);

    let content_type = body.mime_type();
    let stream = futures::stream::iter(body);
    Ok(([(header::CONTENT_TYPE, content_type)], Body::from_stream(stream)).into_response())
}

/// GET /api/sources/:id/fields — the source's current field catalog.
async fn fields(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FieldCatalog>, ApiError> {
    let descriptor = state.source(&id)?;
    let catalog = state.service.fields(&id, descriptor).await;
    state.refresh_cache_gauge();
    Ok(Json(catalog?))
}

/// DELETE /api/sources/:id/connector — drop the cached connector.
async fn close_connector(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.source(&id)?;
    let closed = state.service.close(&id).await;
    state.refresh_cache_gauge();
    if closed {
        info!("Connector for '{}' closed on request", id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NoConnector(id))
    }
}

/// Build the source API router.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sources/:id/select", get(select))
        .route("/api/sources/:id/fields", get(fields))
        .route("/api/sources/:id/connector", delete(close_connector))
        .with_state(state)
}
