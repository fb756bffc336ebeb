use std::sync::Arc;

use tiein_server::{
    catalog::{StaticToolCatalog, ToolCatalog},
    config::GatewayConfig,
    orchestrator::GatewayOrchestrator,
    routes,
    upstream::OpenAiUpstream,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let config = GatewayConfig::from_env()?;
    info!("Using OpenAI model: {}", config.upstream.default_model);
    info!("Upstream: {}", config.upstream.base_url);

    let catalog: Arc<dyn ToolCatalog> = match &config.tool_catalog_path {
        Some(path) => Arc::new(StaticToolCatalog::load(path).await?),
        None => {
            info!("TOOL_CATALOG_PATH not set; running without tools");
            Arc::new(StaticToolCatalog::empty())
        }
    };

    let gateway = Arc::new(GatewayOrchestrator::new(
        Arc::new(OpenAiUpstream::new(&config.upstream)),
        catalog,
        config.limits,
        config.upstream.default_model.clone(),
    ));
    let app = routes::router(gateway);

    info!("Server listening on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
