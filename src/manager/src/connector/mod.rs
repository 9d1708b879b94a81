mod handlers;
mod system;
mod types;

pub use handlers::{
    create_connector_handler, delete_connector_handler, get_connector_handler,
    list_connectors_handler, list_modules_handler, metrics_handler, patch_connector_handler,
    start_connector_handler, stop_connector_handler,
};
pub use system::{CONNECTOR_ID_LEN, ConnectorSystem};
pub use types::{ConnectorRecord, CreateConnectorRequest, PatchConnectorRequest};
