#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use flowgen::config::FlowConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(FlowConfig::load()?);

    // Structured runs own stdout; keep the logger quiet there.
    let level = if config.structured {
        log::Level::Warn
    } else {
        log::Level::Info
    };
    simple_logger::init_with_level(level)?;

    flowgen::engine_main(config).await
}
