use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use flowgen_relay::{forward::Forwarder, handler::Handler};
use tokio::{net::UdpSocket, time::timeout};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn recv_from(socket: &UdpSocket) -> Result<(Vec<u8>, SocketAddr)> {
    let mut buf = vec![0u8; 65535];
    let (size, addr) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)).await??;
    buf.truncate(size);
    Ok((buf, addr))
}

/// One v4 client, one v6 upstream: the inbound datagram arrives
/// transformed, the reply comes back raw from the relay's stable
/// listener address.
#[tokio::test]
async fn test_bidirectional_echo() -> Result<()> {
    let upstream = UdpSocket::bind("[::1]:0").await?;
    let target = upstream.local_addr()?;

    let handler = Arc::new(Handler::new(0.5, 0.2, b"ab"));
    let forwarder = Forwarder::v4_to_v6(48710, target, handler).await?;
    tokio::spawn(forwarder.run());

    let client = UdpSocket::bind("127.0.0.1:0").await?;
    client.send_to(b"0123456789", "127.0.0.1:48710").await?;

    let (data, peer) = recv_from(&upstream).await?;
    assert_eq!(&data, b"01234ab");

    upstream.send_to(b"pong", peer).await?;

    let (reply, relay_addr) = recv_from(&client).await?;
    assert_eq!(&reply, b"pong");
    assert_eq!(relay_addr.port(), 48710);

    Ok(())
}

/// Two source endpoints produce two sessions, and each keeps its own
/// source identity upstream: the relay binds the upstream socket to
/// the client's source port.
#[tokio::test]
async fn test_sessions_are_per_source_endpoint() -> Result<()> {
    let upstream = UdpSocket::bind("[::1]:0").await?;
    let target = upstream.local_addr()?;

    let handler = Arc::new(Handler::new(1.0, 0.0, b""));
    let forwarder = Forwarder::v4_to_v6(48711, target, handler).await?;
    tokio::spawn(forwarder.run());

    let first = UdpSocket::bind("127.0.0.1:0").await?;
    let second = UdpSocket::bind("127.0.0.1:0").await?;

    first.send_to(b"from-first", "127.0.0.1:48711").await?;
    let (data, peer) = recv_from(&upstream).await?;
    assert_eq!(&data, b"from-first");
    assert_eq!(peer.port(), first.local_addr()?.port());

    second.send_to(b"from-second", "127.0.0.1:48711").await?;
    let (data, peer) = recv_from(&upstream).await?;
    assert_eq!(&data, b"from-second");
    assert_eq!(peer.port(), second.local_addr()?.port());

    // Replies routed by session: each client only sees traffic
    // addressed to its own endpoint.
    upstream
        .send_to(b"reply-first", (target.ip(), first.local_addr()?.port()))
        .await?;
    let (reply, _) = recv_from(&first).await?;
    assert_eq!(&reply, b"reply-first");

    Ok(())
}

/// Datagrams keep arriving in order through one session.
#[tokio::test]
async fn test_ordered_forwarding() -> Result<()> {
    let upstream = UdpSocket::bind("[::1]:0").await?;
    let target = upstream.local_addr()?;

    let handler = Arc::new(Handler::new(1.0, 0.0, b""));
    let forwarder = Forwarder::v4_to_v6(48712, target, handler).await?;
    tokio::spawn(forwarder.run());

    let client = UdpSocket::bind("127.0.0.1:0").await?;
    for index in 0u8..10 {
        client.send_to(&[index], "127.0.0.1:48712").await?;
    }

    for index in 0u8..10 {
        let (data, _) = recv_from(&upstream).await?;
        assert_eq!(data, vec![index]);
    }

    Ok(())
}
