use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::BytesMut;
use codec::{Kind, Packet};
use flowgen::{
    config::{FlowConfig, Role, Transport},
    distribution::Sampling,
};
use tokio::{net::UdpSocket, time::timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn udp_config(role: Role, port: u16, total_size: Option<u64>) -> FlowConfig {
    FlowConfig {
        transport: Transport::Udp,
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
        packet_size: 500,
        bandwidth: Some(4_000_000),
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

fn control(seq_no: u32, total_packets: u32) -> BytesMut {
    let mut bytes = BytesMut::new();
    Packet::control(seq_no, 0, total_packets).encode(&mut bytes);
    bytes
}

/// Drive a real client against a scripted peer and check the whole
/// session: handshake, monotonically increasing data sequence
/// numbers starting at 1, and a FIN that carries the sent total.
#[tokio::test]
async fn test_client_session_wire_behavior() -> Result<()> {
    let server = UdpSocket::bind("127.0.0.1:0").await?;
    let port = server.local_addr()?.port();

    let config = Arc::new(udp_config(Role::Client, port, Some(20_000)));
    let client = tokio::spawn(flowgen::engine_main(config));

    let mut buf = vec![0u8; 65535];

    // Handshake.
    let (size, peer) = server.recv_from(&mut buf).await?;
    let packet = Packet::decode(&buf[..size]).unwrap();
    assert_eq!(packet.kind(), Kind::Init);
    server.send_to(&control(codec::INIT_ACK, 0), peer).await?;

    // Data until FIN; loopback delivers in order and without loss.
    let mut received = 0u32;
    loop {
        let (size, addr) = timeout(TEST_TIMEOUT, server.recv_from(&mut buf)).await??;
        let packet = Packet::decode(&buf[..size]).unwrap();

        match packet.kind() {
            Kind::Init => {
                // Retransmitted handshake, acknowledge again.
                server.send_to(&control(codec::INIT_ACK, 0), addr).await?;
            }
            Kind::Data => {
                received += 1;
                assert_eq!(packet.seq_no, received);
                assert_eq!(packet.total_packets, 0);
                assert_eq!(packet.payload.len(), 500 - codec::HEADER_SIZE);
            }
            Kind::Fin => {
                assert_eq!(packet.total_packets, received);
                server
                    .send_to(&control(codec::FIN_ACK, received), addr)
                    .await?;
                break;
            }
            other => panic!("unexpected packet during data phase: {:?}", other),
        }
    }

    assert!(received > 0);
    timeout(TEST_TIMEOUT, client).await???;
    Ok(())
}

/// Drive a scripted client against a real one-shot server: the
/// handshake is acknowledged, data is counted, and the FIN_ACK
/// carries the server's received total.
#[tokio::test]
async fn test_server_session_wire_behavior() -> Result<()> {
    let config = Arc::new(udp_config(Role::Server, 48621, None));
    let server = tokio::spawn(flowgen::engine_main(config));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await?;
    client.connect("127.0.0.1:48621").await?;

    let mut buf = vec![0u8; 65535];

    client.send(&control(codec::INIT, 0)).await?;
    let size = timeout(TEST_TIMEOUT, client.recv(&mut buf)).await??;
    assert_eq!(Packet::decode(&buf[..size]).unwrap().kind(), Kind::InitAck);

    // Four data packets with a gap in the sequence: one counts as
    // lost against max_seq_no, but all four count as received.
    for seq_no in [1u32, 2, 3, 5] {
        let mut bytes = BytesMut::new();
        Packet {
            seq_no,
            timestamp: 0,
            total_packets: 0,
            payload: &[b'x'; 100],
        }
        .encode(&mut bytes);
        client.send(&bytes).await?;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.send(&control(codec::FIN, 5)).await?;

    let size = timeout(TEST_TIMEOUT, client.recv(&mut buf)).await??;
    let ack = Packet::decode(&buf[..size]).unwrap();
    assert_eq!(ack.kind(), Kind::FinAck);
    assert_eq!(ack.total_packets, 4);

    timeout(TEST_TIMEOUT, server).await???;
    Ok(())
}

/// A full real-to-real run over loopback: one-shot server plus a
/// byte-budget client, both ending cleanly.
#[tokio::test]
async fn test_end_to_end_run() -> Result<()> {
    let server = tokio::spawn(flowgen::engine_main(Arc::new(udp_config(
        Role::Server,
        48622,
        None,
    ))));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let client = flowgen::engine_main(Arc::new(udp_config(Role::Client, 48622, Some(30_000))));
    timeout(TEST_TIMEOUT, client).await??;

    timeout(TEST_TIMEOUT, server).await???;
    Ok(())
}

/// Nothing listening: the handshake gives up after its retries.
#[tokio::test]
async fn test_handshake_timeout() -> Result<()> {
    let config = Arc::new(udp_config(Role::Client, 48623, Some(1000)));
    let ret = timeout(TEST_TIMEOUT, flowgen::engine_main(config)).await?;

    assert!(ret.is_err());
    Ok(())
}
