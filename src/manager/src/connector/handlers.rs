use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use bridge::ModuleDescriptor;
use std::sync::Arc;

use super::system::ConnectorSystem;
use super::types::{ConnectorRecord, CreateConnectorRequest, PatchConnectorRequest};
use crate::error::SystemError;

type SharedSystem = State<Arc<ConnectorSystem>>;

fn parse_error(rejection: JsonRejection) -> SystemError {
    tracing::debug!(error = %rejection, "rejected connector body");
    SystemError::BadRequest("Unable to parse connector".to_string())
}

pub async fn list_modules_handler(State(system): SharedSystem) -> Json<Vec<ModuleDescriptor>> {
    Json(system.list_modules())
}

pub async fn list_connectors_handler(State(system): SharedSystem) -> Json<Vec<ConnectorRecord>> {
    Json(system.list_connectors())
}

pub async fn get_connector_handler(
    State(system): SharedSystem,
    Path(id): Path<String>,
) -> Result<Json<ConnectorRecord>, SystemError> {
    system.get_connector(&id).map(Json)
}

pub async fn create_connector_handler(
    State(system): SharedSystem,
    payload: Result<Json<CreateConnectorRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ConnectorRecord>), SystemError> {
    let Json(request) = payload.map_err(parse_error)?;
    let record = system.create_connector(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn patch_connector_handler(
    State(system): SharedSystem,
    Path(id): Path<String>,
    payload: Result<Json<PatchConnectorRequest>, JsonRejection>,
) -> Result<Json<ConnectorRecord>, SystemError> {
    let Json(request) = payload.map_err(parse_error)?;
    system.patch_connector(&id, request).await.map(Json)
}

pub async fn delete_connector_handler(
    State(system): SharedSystem,
    Path(id): Path<String>,
) -> Result<StatusCode, SystemError> {
    system.delete_connector(&id).await?;
    Ok(StatusCode::OK)
}

pub async fn start_connector_handler(
    State(system): SharedSystem,
    Path(id): Path<String>,
) -> Result<StatusCode, SystemError> {
    system.set_connector_running_state(&id, true).await?;
    Ok(StatusCode::OK)
}

pub async fn stop_connector_handler(
    State(system): SharedSystem,
    Path(id): Path<String>,
) -> Result<StatusCode, SystemError> {
    system.set_connector_running_state(&id, false).await?;
    Ok(StatusCode::OK)
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        bridge::metrics::render(),
    )
}
