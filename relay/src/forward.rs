//! Per-source sessions and the two forwarding directions.
//!
//! Each direction owns one listener socket. Every distinct source
//! endpoint gets a session: an upstream socket on the opposite address
//! family bound to the client's own port number, an inbound queue, and
//! a pair of tasks moving datagrams. Inbound traffic passes through
//! the payload handler; replies go back raw through the shared
//! listener so the client keeps seeing one stable peer address.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use ahash::AHashMap;
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::UdpSocket,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::timeout,
};

use crate::handler::Handler;

/// Both session tasks wake up at least once a second to observe the
/// other side's liveness flag.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(1);

const RECV_BUF: usize = 65535;

struct Session {
    queue: UnboundedSender<Vec<u8>>,
    active: Arc<AtomicBool>,
}

pub struct Forwarder {
    listener: Arc<UdpSocket>,
    target: SocketAddr,
    handler: Arc<Handler>,
    sessions: AHashMap<String, Session>,
}

impl Forwarder {
    /// Listen on the IPv4 side, forward to an IPv6 target.
    pub async fn v4_to_v6(port: u16, target: SocketAddr, handler: Arc<Handler>) -> Result<Self> {
        let listener = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .with_context(|| format!("IPv4 listener bind failed: port={}", port))?;

        log::info!("IPv4 listener bound: {}", listener.local_addr()?);

        Ok(Self {
            listener: Arc::new(listener),
            target,
            handler,
            sessions: AHashMap::new(),
        })
    }

    /// Listen on the IPv6 side (v6-only), forward to an IPv4 target.
    pub async fn v6_to_v4(port: u16, target: SocketAddr, handler: Arc<Handler>) -> Result<Self> {
        let listener = bind_v6_only(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)))
            .with_context(|| format!("IPv6 listener bind failed: port={}", port))?;

        log::info!("IPv6 listener bound: {}", listener.local_addr()?);

        Ok(Self {
            listener: Arc::new(listener),
            target,
            handler,
            sessions: AHashMap::new(),
        })
    }

    /// Accept datagrams forever, creating sessions on demand.
    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUF];

        loop {
            let (size, addr) = match self.listener.recv_from(&mut buf).await {
                Ok(ret) => ret,
                Err(e) => {
                    log::warn!("listener receive error: {:?}", e);
                    continue;
                }
            };

            let key = session_key(&addr);
            log::trace!("datagram: size={}, client={}", size, key);

            if let Some(session) = self.sessions.get(&key)
                && !session.active.load(Ordering::Relaxed)
            {
                self.sessions.remove(&key);
            }

            if !self.sessions.contains_key(&key) {
                match self.create_session(addr) {
                    Ok(session) => {
                        log::info!("new client session: {}", key);
                        self.sessions.insert(key.clone(), session);
                    }
                    Err(e) => {
                        log::warn!("session setup failed: client={}, {:?}", key, e);
                        continue;
                    }
                }
            }

            if let Some(session) = self.sessions.get(&key)
                && session.queue.send(buf[..size].to_vec()).is_err()
            {
                self.sessions.remove(&key);
            }
        }
    }

    fn create_session(&self, client: SocketAddr) -> Result<Session> {
        // The upstream socket reuses the client's source port on the
        // opposite family; a port already taken there fails the
        // session and the packet is dropped.
        let upstream = match self.target {
            SocketAddr::V4(_) => bind_v4(SocketAddr::from((Ipv4Addr::UNSPECIFIED, client.port())))?,
            SocketAddr::V6(_) => {
                bind_v6_only(SocketAddr::from((Ipv6Addr::UNSPECIFIED, client.port())))?
            }
        };
        let upstream = Arc::new(upstream);

        let (queue, receiver) = unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));

        tokio::spawn(inbound_to_upstream(
            receiver,
            upstream.clone(),
            self.target,
            self.handler.clone(),
            active.clone(),
        ));

        tokio::spawn(upstream_to_inbound(
            upstream,
            self.listener.clone(),
            client,
            active.clone(),
        ));

        Ok(Session { queue, active })
    }
}

async fn inbound_to_upstream(
    mut queue: UnboundedReceiver<Vec<u8>>,
    upstream: Arc<UdpSocket>,
    target: SocketAddr,
    handler: Arc<Handler>,
    active: Arc<AtomicBool>,
) {
    while active.load(Ordering::Relaxed) {
        let data = match timeout(LIVENESS_TIMEOUT, queue.recv()).await {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(data)) => data,
        };

        let data = handler.handle(&data);
        if let Err(e) = upstream.send_to(&data, target).await {
            log::warn!("upstream send error: target={}, {:?}", target, e);
            break;
        }
    }

    active.store(false, Ordering::Relaxed);
}

async fn upstream_to_inbound(
    upstream: Arc<UdpSocket>,
    listener: Arc<UdpSocket>,
    client: SocketAddr,
    active: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; RECV_BUF];

    while active.load(Ordering::Relaxed) {
        let (size, _) = match timeout(LIVENESS_TIMEOUT, upstream.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                log::warn!("upstream receive error: {:?}", e);
                break;
            }
            Ok(Ok(ret)) => ret,
        };

        if let Err(e) = listener.send_to(&buf[..size], client).await {
            log::warn!("client send error: client={}, {:?}", client, e);
            break;
        }
    }

    active.store(false, Ordering::Relaxed);
}

/// Sessions are keyed by the stringified source endpoint; the v6 form
/// separates address and port with `%` since the address itself
/// contains colons.
fn session_key(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("{}:{}", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("{}%{}", v6.ip(), v6.port()),
    }
}

fn bind_v4(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket)?)
}

fn bind_v6_only(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_keys() {
        let v4: SocketAddr = "192.0.2.1:5201".parse().unwrap();
        assert_eq!(session_key(&v4), "192.0.2.1:5201");

        let v6: SocketAddr = "[2001:db8::2]:5201".parse().unwrap();
        assert_eq!(session_key(&v6), "2001:db8::2%5201");
    }
}
