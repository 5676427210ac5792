//! Entity CRUD and streaming endpoints.

use std::sync::Arc;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use common::EntityId;
use domain::{CreateEntity, DeleteEntity, Entity, UpdateEntity};
use futures_util::StreamExt;
use projections::UserEntitiesView;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::server::EntityServer;

/// Page size used when the client does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 100;
/// Largest page a single stream will serve.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub server: EntityServer,
    pub user_entities: UserEntitiesView,
}

// -- Request types --

#[derive(Deserialize)]
pub struct CreateEntityRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Deserialize)]
pub struct UpdateEntityRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Deserialize)]
pub struct ListParams {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

// -- Response types --

#[derive(Serialize)]
pub struct UserEntitiesResponse {
    pub user_id: String,
    pub entity_ids: Vec<EntityId>,
}

// -- Handlers --

/// POST /entities
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateEntityRequest>,
) -> Result<(StatusCode, Json<Entity>), ApiError> {
    let entity = state
        .server
        .create(CreateEntity::new(req.user_id, req.title, req.body))
        .await?;
    Ok((StatusCode::CREATED, Json(entity)))
}

/// GET /entities/{id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Entity>, ApiError> {
    Ok(Json(state.server.get(&EntityId::new(id)).await?))
}

/// PUT /entities/{id}
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateEntityRequest>,
) -> Result<Json<Entity>, ApiError> {
    let entity = state
        .server
        .update(UpdateEntity::new(id, req.title, req.body))
        .await?;
    Ok(Json(entity))
}

/// DELETE /entities/{id}
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.server.delete(DeleteEntity::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /entities?offset&limit, one JSON entity per line.
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let offset = params.offset.unwrap_or(0);
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);

    let lines = state
        .server
        .get_stream(offset, limit)
        .await?
        .map(|entity| {
            serde_json::to_vec(&entity).map(|mut line| {
                line.push(b'\n');
                Bytes::from(line)
            })
        });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

/// GET /users/{user_id}/entities
pub async fn by_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<UserEntitiesResponse> {
    let entity_ids = state.user_entities.entities_for(&user_id).await;
    Json(UserEntitiesResponse {
        user_id,
        entity_ids,
    })
}
