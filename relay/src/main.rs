#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::net::SocketAddr;
use std::sync::Arc;

use flowgen_relay::{config::Config, forward::Forwarder, handler::Handler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();
    simple_logger::init_with_level(log::Level::Info)?;

    log::info!(
        "relay endpoints: v4={}:{}, v6=[{}]:{}",
        config.ipv4_addr,
        config.ipv4_port,
        config.ipv6_addr,
        config.ipv6_port
    );
    log::info!(
        "payload handler: reserve_rate={}, new_rate={}, new_content={:?}",
        config.reserve_rate,
        config.new_rate,
        config.new_content
    );

    let handler = Arc::new(Handler::new(
        config.reserve_rate,
        config.new_rate,
        config.new_content.as_bytes(),
    ));

    let v4_side = Forwarder::v4_to_v6(
        config.ipv4_port,
        SocketAddr::new(config.ipv6_addr.into(), config.ipv6_port),
        handler.clone(),
    )
    .await?;

    let v6_side = Forwarder::v6_to_v4(
        config.ipv6_port,
        SocketAddr::new(config.ipv4_addr.into(), config.ipv4_port),
        handler,
    )
    .await?;

    tokio::select! {
        ret = v4_side.run() => ret,
        ret = v6_side.run() => ret,
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupt received, closing listeners");
            Ok(())
        }
    }
}
