//! Management API served on the bare base domain

use std::sync::Arc;

use axum::{
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use burrow_control::TunnelRegistry;
use burrow_proto::{
    validate_requested_id, ErrorBody, ServerStatus, TunnelInfo, TunnelList, TunnelStatus,
};
use tracing::{debug, info, warn};

use crate::memory::memory_usage;

type ApiError = (StatusCode, Json<ErrorBody>);

/// State shared by the API handlers
pub struct ApiState {
    pub registry: TunnelRegistry,
    /// `http` or `https`, used for tunnel URLs
    pub scheme: &'static str,
    pub landing_page: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/status", get(server_status))
        .route("/api/tunnels", get(list_tunnels))
        .route("/api/tunnels/{id}/status", get(tunnel_status))
        .route("/{id}", get(request_tunnel))
        .with_state(Arc::new(state))
}

/// `GET /?new` creates a tunnel under a random id, plain `GET /` goes to the landing page
async fn root(
    State(state): State<Arc<ApiState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    if wants_new_tunnel(query.as_deref()) {
        return create_tunnel(&state, None, &headers).await.into_response();
    }

    match &state.landing_page {
        Some(url) => (StatusCode::FOUND, [(header::LOCATION, url.clone())]).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /{id}` creates a tunnel, under `id` if it is free
async fn request_tunnel(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TunnelInfo>, ApiError> {
    if let Err(e) = validate_requested_id(&id) {
        debug!("Rejected tunnel id {:?}", id);
        return Err((StatusCode::FORBIDDEN, Json(ErrorBody::new(e.to_string()))));
    }

    create_tunnel(&state, Some(&id), &headers).await
}

async fn server_status(State(state): State<Arc<ApiState>>) -> Json<ServerStatus> {
    Json(ServerStatus {
        tunnels: state.registry.stats().tunnels,
        mem: memory_usage(),
    })
}

async fn list_tunnels(State(state): State<Arc<ApiState>>) -> Json<TunnelList> {
    Json(TunnelList {
        tunnels: state.registry.ids(),
    })
}

async fn tunnel_status(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<TunnelStatus>, ApiError> {
    let tunnel = state.registry.get(&id).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorBody::new(format!("Tunnel {} not found", id))),
        )
    })?;

    Ok(Json(TunnelStatus {
        connected_sockets: tunnel.connected_sockets(),
    }))
}

async fn create_tunnel(
    state: &ApiState,
    requested: Option<&str>,
    headers: &HeaderMap,
) -> Result<Json<TunnelInfo>, ApiError> {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new("Host header is required")),
            )
        })?;

    let allocation = state.registry.allocate(requested).await.map_err(|e| {
        warn!("Failed to create tunnel: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody::new(e.to_string())),
        )
    })?;

    let url = format!("{}://{}.{}", state.scheme, allocation.id, host);
    info!("New tunnel {} at {}", allocation.id, url);

    Ok(Json(TunnelInfo {
        id: allocation.id,
        port: allocation.port,
        max_conn_count: allocation.max_connections,
        url,
        ip: None,
    }))
}

fn wants_new_tunnel(query: Option<&str>) -> bool {
    query.is_some_and(|q| {
        q.split('&')
            .any(|pair| pair == "new" || pair.starts_with("new="))
    })
}
