pub mod clock;
pub mod config;
pub mod distribution;
pub mod engine;
pub mod pacing;
pub mod probe;
pub mod statistics;
pub mod units;

use std::sync::Arc;

use config::FlowConfig;

/// In order to let integration tests drive the flow engine directly,
/// a function is opened to replace the main function and start the
/// configured server or client.
pub async fn engine_main(config: Arc<FlowConfig>) -> anyhow::Result<()> {
    engine::run(config).await
}
