pub mod config;
pub mod forward;
pub mod logger;
pub mod server;

use std::sync::Arc;

/// Load configuration, install logging, and serve until shutdown.
pub async fn run(config_path: Option<&str>) -> Result<(), String> {
    let settings = config::load(config_path)?;
    logger::init(&settings.log_level);
    logger::info(
        "app",
        &format!(
            "starting llmux {} with {} backends across {} providers",
            env!("CARGO_PKG_VERSION"),
            settings.backend.len(),
            settings.provider.len(),
        ),
    );
    let state = Arc::new(forward::AppState::new(settings)?);
    server::serve(state).await
}
