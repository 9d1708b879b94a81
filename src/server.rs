use bridge::{
    BridgeContext, BrokerEndpoint, ConnectionTuning, DeliveryBus, ModuleRegistry, MqttTransport,
    PublishBridge, RumqttTransport,
};
use manager::ConnectorSystem;
use std::future::Future;
use std::sync::Arc;
use storage::{ConnectorStore, StorageManager};

pub const DEFAULT_DATA_DIR: &str = "./tmp";
pub const DEFAULT_MANAGER_ADDR: &str = "0.0.0.0:8080";

/// Options for initializing the server runtime.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Custom data directory for storage; if None, uses DEFAULT_DATA_DIR.
    pub data_dir: Option<String>,
    /// Manager listen address; if None, uses default.
    pub manager_addr: Option<String>,
    /// Outbound SensorThings broker.
    pub publish: BrokerEndpoint,
    pub tuning: ConnectionTuning,
    pub delivery_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        crate::config::AppConfig::default().to_server_options()
    }
}

/// Runtime context returned by [`init`] and consumed by [`start`].
pub struct ServerContext {
    storage: Arc<StorageManager>,
    system: Arc<ConnectorSystem>,
    publisher: PublishBridge,
    manager_addr: String,
    _bus: DeliveryBus,
}

impl ServerContext {
    /// Manager address that will be used when starting the server.
    pub fn manager_addr(&self) -> &str {
        &self.manager_addr
    }

    pub fn system(&self) -> Arc<ConnectorSystem> {
        Arc::clone(&self.system)
    }

    pub fn storage(&self) -> Arc<StorageManager> {
        Arc::clone(&self.storage)
    }

    pub fn publisher(&self) -> &PublishBridge {
        &self.publisher
    }
}

/// Initialize storage, the delivery bus, the module registry and the publish bridge
/// using the production MQTT transport.
pub fn init(opts: ServerOptions) -> Result<ServerContext, Box<dyn std::error::Error + Send + Sync>> {
    init_with_transport(opts, Arc::new(RumqttTransport::new()))
}

pub fn init_with_transport(
    opts: ServerOptions,
    transport: Arc<dyn MqttTransport>,
) -> Result<ServerContext, Box<dyn std::error::Error + Send + Sync>> {
    let manager_addr = opts
        .manager_addr
        .unwrap_or_else(|| DEFAULT_MANAGER_ADDR.to_string());
    let data_dir = opts
        .data_dir
        .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
    opts.publish.validate()?;

    let storage = Arc::new(StorageManager::new(&data_dir)?);
    tracing::info!(
        storage_dir = %storage.base_dir().display(),
        "storage initialized"
    );

    let bus = DeliveryBus::new(opts.delivery_capacity);
    let receiver = bus
        .take_receiver()
        .ok_or("delivery bus receiver already taken")?;
    let publisher = PublishBridge::new(opts.publish, Arc::clone(&transport), opts.tuning, receiver);
    let registry =
        ModuleRegistry::with_builtin_modules(BridgeContext::new(transport, opts.tuning));
    let system = Arc::new(ConnectorSystem::new(
        registry,
        Arc::clone(&storage) as Arc<dyn ConnectorStore>,
        bus.handle(),
    ));

    Ok(ServerContext {
        storage,
        system,
        publisher,
        manager_addr,
        _bus: bus,
    })
}

/// Start the manager server and await termination (Ctrl+C or server error).
pub async fn start(ctx: ServerContext) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    run_until(ctx, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
        tracing::info!("ctrl+c received, shutting down");
    })
    .await
}

/// Start publishing, load persisted connectors and serve the management API
/// until `shutdown` resolves or the server fails. Teardown always runs.
pub async fn run_until(
    ctx: ServerContext,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    ctx.publisher.start();
    let loaded = ctx.system.load_all().await;

    let result = match loaded {
        Ok(count) => {
            tracing::info!(connectors = count, "connectors loaded");
            tracing::info!(manager_addr = %ctx.manager_addr, "starting manager");
            let manager_future =
                manager::start_server(ctx.manager_addr.clone(), Arc::clone(&ctx.system));
            tokio::select! {
                result = manager_future => {
                    if let Err(err) = &result {
                        tracing::error!(error = %err, "manager server exited with error");
                    }
                    result
                }
                _ = shutdown => Ok(()),
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to load connectors");
            Err(err.into())
        }
    };

    ctx.system.shutdown().await;
    ctx.publisher.stop().await;
    ctx.storage.close();
    tracing::info!("server stopped");
    result
}
