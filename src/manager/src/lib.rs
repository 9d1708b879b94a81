mod connector;
mod error;
pub mod storage_bridge;

use axum::Router;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub use connector::{
    CONNECTOR_ID_LEN, ConnectorRecord, ConnectorSystem, CreateConnectorRequest,
    PatchConnectorRequest,
};
pub use error::{ErrorContent, ErrorResponse, SystemError};

/// Management API over a connector system.
pub fn router(system: Arc<ConnectorSystem>) -> Router {
    Router::new()
        .route("/Modules", get(connector::list_modules_handler))
        .route(
            "/Connectors",
            get(connector::list_connectors_handler).post(connector::create_connector_handler),
        )
        .route(
            "/Connectors/:id",
            get(connector::get_connector_handler)
                .patch(connector::patch_connector_handler)
                .delete(connector::delete_connector_handler),
        )
        .route(
            "/Connectors/:id/Start",
            post(connector::start_connector_handler),
        )
        .route("/Connectors/:id/Stop", post(connector::stop_connector_handler))
        .route("/metrics", get(connector::metrics_handler))
        .with_state(system)
}

pub async fn start_server(
    addr: String,
    system: Arc<ConnectorSystem>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(system);
    let addr: SocketAddr = addr.parse()?;
    tracing::info!(manager_addr = %addr, "manager listening");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
