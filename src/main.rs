use sensorthings_bridge::{bootstrap, server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let result = bootstrap::default_init()?;
    let _logging_guard = result.logging_guard;
    let ctx = server::init(result.options)?;
    server::start(ctx).await
}
