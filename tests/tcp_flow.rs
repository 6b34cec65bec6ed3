use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use flowgen::{
    config::{FlowConfig, Role, Transport},
    distribution::Sampling,
};
use tokio::{io::AsyncReadExt, net::TcpListener, time::timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn tcp_config(role: Role, port: u16, total_size: Option<u64>) -> FlowConfig {
    FlowConfig {
        transport: Transport::Tcp,
        role,
        host: match role {
            Role::Client => Some("127.0.0.1".to_string()),
            Role::Server => None,
        },
        bind_address: match role {
            Role::Server => Some("127.0.0.1".to_string()),
            Role::Client => None,
        },
        port,
        ipv6: false,
        duration: None,
        total_size,
        packet_size: 16_000,
        bandwidth: None,
        interval: 0.2,
        dist_gap: Sampling::Fixed,
        dist_len: Sampling::Fixed,
        dist_bandwidth: Sampling::Fixed,
        bandwidth_reset_interval: None,
        structured: true,
        one_test: true,
        printpkg: false,
        clock_config: "config.json".to_string(),
    }
}

/// The byte budget is honored within one frame: the client stops at
/// or just past the requested total, and everything it wrote reaches
/// the peer.
#[tokio::test]
async fn test_byte_budget_against_scripted_sink() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let total = 500_000u64;
    let config = Arc::new(tcp_config(Role::Client, port, Some(total)));
    let client = tokio::spawn(flowgen::engine_main(config));

    let (mut stream, _) = timeout(TEST_TIMEOUT, listener.accept()).await??;

    let mut received = 0u64;
    let mut buf = vec![0u8; 65535];
    loop {
        let size = timeout(TEST_TIMEOUT, stream.read(&mut buf)).await??;
        if size == 0 {
            break;
        }

        assert!(buf[..size].iter().all(|byte| *byte == b'X'));
        received += size as u64;
    }

    assert!(received >= total);
    assert!(received <= total + 16_000);

    timeout(TEST_TIMEOUT, client).await???;
    Ok(())
}

/// A full real-to-real stream run over loopback.
#[tokio::test]
async fn test_end_to_end_run() -> Result<()> {
    let server = tokio::spawn(flowgen::engine_main(Arc::new(tcp_config(
        Role::Server,
        48631,
        None,
    ))));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let client = flowgen::engine_main(Arc::new(tcp_config(Role::Client, 48631, Some(200_000))));
    timeout(TEST_TIMEOUT, client).await??;

    timeout(TEST_TIMEOUT, server).await???;
    Ok(())
}

/// Nothing listening: connecting fails loudly instead of hanging.
#[tokio::test]
async fn test_connect_failure() -> Result<()> {
    let config = Arc::new(tcp_config(Role::Client, 48632, Some(1000)));
    let ret = timeout(TEST_TIMEOUT, flowgen::engine_main(config)).await?;

    assert!(ret.is_err());
    Ok(())
}
