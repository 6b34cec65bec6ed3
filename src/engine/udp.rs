//! Datagram flow driver.
//!
//! A small session protocol rides on top of the unreliable socket: an
//! INIT/INIT_ACK handshake pins the peer, DATA packets carry sequence
//! numbers and send timestamps, and the run ends in a FIN/FIN_ACK
//! exchange (or FORCE_QUIT/FORCE_QUIT_ACK on interrupt) that swaps
//! packet totals so both ends can account losses.

use std::{fmt::Write, net::SocketAddr, ops::ControlFlow, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use bytes::BytesMut;
use codec::{HEADER_SIZE, Kind, Packet, RESERVED_BASE};
use tokio::{net::UdpSocket, time::timeout};

use super::{Shutdown, epoch_seconds, now_micros};
use crate::{
    clock::{ClockConfig, ClockEstimator, ClockOffset},
    config::FlowConfig,
    pacing::{self, Sender, Stop},
    statistics::{self, FlowKind, RunCounters, Sampler, SamplerMode, Totals},
};

/// Link framing ahead of the measurement datagram (ethernet + IP +
/// UDP plus the measurement header itself), counted so reported rates
/// reflect on-wire bytes.
const FRAME_OVERHEAD_V4: u64 = 58;
const FRAME_OVERHEAD_V6: u64 = 78;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(100);
const INIT_RETRIES: usize = 10;
const FIN_RETRIES: usize = 40;
const QUIT_RETRIES: usize = 10;

const RECV_BUF: usize = 65535;

fn frame_overhead(ipv6: bool) -> u64 {
    if ipv6 { FRAME_OVERHEAD_V6 } else { FRAME_OVERHEAD_V4 }
}

/// Send timestamp: local clock corrected by the estimated offset.
fn send_timestamp(offset: &ClockOffset) -> u64 {
    (now_micros() + offset.micros()).max(0) as u64
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, byte| {
            let _ = write!(out, "{:02x}", byte);
            out
        },
    )
}

enum Received {
    Datagram(usize, SocketAddr),
    TimedOut,
}

/// Receive with an explicit deadline instead of a blocking call, so
/// callers can interleave liveness and shutdown checks.
async fn recv_deadline(
    socket: &UdpSocket,
    buf: &mut [u8],
    deadline: Duration,
) -> std::io::Result<Received> {
    match timeout(deadline, socket.recv_from(buf)).await {
        Ok(Ok((size, addr))) => Ok(Received::Datagram(size, addr)),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(Received::TimedOut),
    }
}

/// Retry `seq_no` until the matching acknowledgement arrives, up to
/// `retries` rounds of 100 ms. Returns the packet total the peer put
/// in its acknowledgement, or `None` when every round timed out.
async fn control_exchange(
    socket: &UdpSocket,
    peer: SocketAddr,
    seq_no: u32,
    ack: Kind,
    total_packets: u32,
    offset: &ClockOffset,
    retries: usize,
) -> Result<Option<u32>> {
    let mut bytes = BytesMut::with_capacity(HEADER_SIZE);
    let mut buf = vec![0u8; RECV_BUF];

    for _ in 0..retries {
        Packet::control(seq_no, send_timestamp(offset), total_packets).encode(&mut bytes);
        socket.send_to(&bytes, peer).await?;

        if let Received::Datagram(size, _) = recv_deadline(socket, &mut buf, CONTROL_TIMEOUT).await?
            && let Ok(packet) = Packet::decode(&buf[..size])
            && packet.kind() == ack
        {
            return Ok(Some(packet.total_packets));
        }
    }

    Ok(None)
}

/// Like [`control_exchange`], but failure only costs us the peer's
/// total, never the run summary.
async fn teardown(
    socket: &UdpSocket,
    peer: SocketAddr,
    seq_no: u32,
    ack: Kind,
    total_packets: u32,
    offset: &ClockOffset,
    retries: usize,
) -> Option<u32> {
    match control_exchange(socket, peer, seq_no, ack, total_packets, offset, retries).await {
        Ok(total) => total,
        Err(e) => {
            log::warn!("teardown exchange failed: {:?}", e);
            None
        }
    }
}

/// Fire-and-forget control reply.
async fn reply_control(
    socket: &UdpSocket,
    peer: SocketAddr,
    seq_no: u32,
    total_packets: u32,
    offset: &ClockOffset,
) {
    let mut bytes = BytesMut::with_capacity(HEADER_SIZE);
    Packet::control(seq_no, send_timestamp(offset), total_packets).encode(&mut bytes);

    if let Err(e) = socket.send_to(&bytes, peer).await {
        log::warn!("control reply failed: {:?}", e);
    }
}

struct DatagramSender<'a> {
    socket: &'a UdpSocket,
    peer: SocketAddr,
    counters: Arc<RunCounters>,
    offset: ClockOffset,
    overhead: u64,
    seq_no: u32,
    bytes: BytesMut,
    recv_buf: Vec<u8>,
    want_sample: bool,
    sample_hex: Option<String>,
    peer_total: Option<u32>,
}

impl<'a> DatagramSender<'a> {
    fn new(
        socket: &'a UdpSocket,
        peer: SocketAddr,
        counters: Arc<RunCounters>,
        offset: ClockOffset,
        config: &FlowConfig,
    ) -> Self {
        Self {
            socket,
            peer,
            counters,
            offset,
            overhead: frame_overhead(config.ipv6),
            seq_no: 1,
            bytes: BytesMut::with_capacity(HEADER_SIZE + config.packet_size),
            recv_buf: vec![0u8; RECV_BUF],
            want_sample: config.printpkg,
            sample_hex: None,
            peer_total: None,
        }
    }
}

impl Sender for DatagramSender<'_> {
    async fn send_one(&mut self, payload: &[u8]) -> std::io::Result<usize> {
        // A run long enough to reach the reserved range would alias
        // control messages; refuse loudly instead.
        assert!(self.seq_no < RESERVED_BASE, "data sequence space exhausted");

        Packet {
            seq_no: self.seq_no,
            timestamp: send_timestamp(&self.offset),
            total_packets: 0,
            payload,
        }
        .encode(&mut self.bytes);

        self.socket.send_to(&self.bytes, self.peer).await?;

        if self.want_sample && self.sample_hex.is_none() {
            self.sample_hex = Some(hex_string(&self.bytes));
        }

        self.seq_no += 1;
        Ok(self.bytes.len() + self.overhead as usize)
    }

    async fn poll_control(&mut self) -> Result<ControlFlow<()>> {
        match self.socket.try_recv_from(&mut self.recv_buf) {
            Ok((size, addr)) if addr == self.peer => {
                if let Ok(packet) = Packet::decode(&self.recv_buf[..size])
                    && packet.kind() == Kind::ForceQuit
                {
                    self.peer_total = Some(packet.total_packets);
                    reply_control(
                        self.socket,
                        self.peer,
                        codec::FORCE_QUIT_ACK,
                        self.counters.packets.get() as u32,
                        &self.offset,
                    )
                    .await;

                    return Ok(ControlFlow::Break(()));
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => log::trace!("control poll error: {:?}", e),
        }

        Ok(ControlFlow::Continue(()))
    }
}

pub async fn run_client(config: Arc<FlowConfig>) -> Result<()> {
    let peer = config.peer_addr()?;
    let bind = config.ephemeral_addr();
    let socket = UdpSocket::bind(bind)
        .await
        .with_context(|| format!("bind failed: {}", bind))?;

    if !config.structured {
        println!("UDP Client connecting to {}", peer);
    }

    let estimator = ClockEstimator::spawn(ClockConfig::load(&config.clock_config));
    let offset = estimator.offset();

    let established =
        control_exchange(&socket, peer, codec::INIT, Kind::InitAck, 0, &offset, INIT_RETRIES)
            .await?
            .is_some();
    if !established {
        bail!("failed to establish connection");
    }

    if !config.structured {
        println!("Connection established");
    }

    let counters = Arc::new(RunCounters::default());
    counters.start();

    let start = epoch_seconds();
    let sampler = Sampler::spawn(
        counters.clone(),
        config.interval,
        SamplerMode::UdpClient,
        config.structured,
    );

    let shutdown = Shutdown::listen();
    let mut shaper = config.shaper();
    let mut sender = DatagramSender::new(&socket, peer, counters.clone(), offset.clone(), &config);

    let stop = pacing::run(&mut sender, &mut shaper, &counters, &config, &shutdown).await?;

    let DatagramSender {
        sample_hex,
        peer_total,
        ..
    } = sender;

    let total = counters.packets.get() as u32;
    let peer_total = match stop {
        Stop::Criterion | Stop::SendFailed => {
            teardown(&socket, peer, codec::FIN, Kind::FinAck, total, &offset, FIN_RETRIES).await
        }
        Stop::Interrupted => {
            teardown(
                &socket,
                peer,
                codec::FORCE_QUIT,
                Kind::ForceQuitAck,
                total,
                &offset,
                QUIT_RETRIES,
            )
            .await
        }
        Stop::PeerQuit => peer_total,
    };

    counters.stop();
    let end = epoch_seconds();
    let report = sampler.join().await;

    statistics::emit_summary(
        FlowKind::UdpClient,
        config.structured,
        &report,
        &Totals {
            start,
            end,
            bytes: counters.sent_bytes.get(),
            packets: counters.packets.get(),
            peer_packets: peer_total.map(u64::from),
            jitter_ms: 0.0,
            sample_hex,
        },
    );

    Ok(())
}

pub async fn run_server(config: Arc<FlowConfig>) -> Result<()> {
    let listen = config.listen_addr()?;
    let socket = UdpSocket::bind(listen)
        .await
        .with_context(|| format!("bind failed: {}", listen))?;

    if !config.structured {
        println!("UDP Server listening on {}", listen);
    }

    let estimator = ClockEstimator::spawn(ClockConfig::load(&config.clock_config));
    let offset = estimator.offset();
    let shutdown = Shutdown::listen();

    let counters = Arc::new(RunCounters::default());
    let overhead = frame_overhead(config.ipv6);
    let mut buf = vec![0u8; RECV_BUF];

    'accepting: loop {
        if !config.structured {
            println!("Waiting for client connection...");
        }

        // Discard everything until an INIT arrives, then pin its
        // source as the session peer.
        let peer = loop {
            if shutdown.is_raised() {
                break 'accepting;
            }

            match recv_deadline(&socket, &mut buf, CONTROL_TIMEOUT).await {
                Err(e) => {
                    log::warn!("receive error: {:?}", e);
                    break 'accepting;
                }
                Ok(Received::TimedOut) => continue,
                Ok(Received::Datagram(size, addr)) => {
                    if let Ok(packet) = Packet::decode(&buf[..size])
                        && packet.kind() == Kind::Init
                    {
                        reply_control(&socket, addr, codec::INIT_ACK, 0, &offset).await;
                        break addr;
                    }
                }
            }
        };

        if !config.structured {
            println!("Client connected, starting test...");
        }

        counters.start();
        let start = epoch_seconds();
        let sampler = Sampler::spawn(
            counters.clone(),
            config.interval,
            SamplerMode::UdpServer,
            config.structured,
        );

        let mut last_transit_us = 0i64;
        let mut sender_total: Option<u32> = None;
        let mut forced_quit = false;
        let mut sample_hex: Option<String> = None;

        loop {
            if shutdown.is_raised() {
                sender_total = teardown(
                    &socket,
                    peer,
                    codec::FORCE_QUIT,
                    Kind::ForceQuitAck,
                    counters.packets.get() as u32,
                    &offset,
                    QUIT_RETRIES,
                )
                .await;
                forced_quit = true;
                break;
            }

            let (size, addr) = match recv_deadline(&socket, &mut buf, CONTROL_TIMEOUT).await {
                Err(e) => {
                    log::warn!("receive error: {:?}", e);
                    break;
                }
                Ok(Received::TimedOut) => continue,
                Ok(Received::Datagram(size, addr)) => (size, addr),
            };

            if addr != peer {
                log::trace!("datagram from unexpected peer: {}", addr);
                continue;
            }

            let now_us = now_micros() + offset.micros();
            let packet = match Packet::decode(&buf[..size]) {
                Ok(packet) => packet,
                Err(e) => {
                    log::warn!("undecodable datagram: size={}, {:?}", size, e);
                    continue;
                }
            };

            match packet.kind() {
                Kind::ForceQuit => {
                    sender_total = Some(packet.total_packets);
                    reply_control(
                        &socket,
                        peer,
                        codec::FORCE_QUIT_ACK,
                        counters.packets.get() as u32,
                        &offset,
                    )
                    .await;
                    break;
                }
                Kind::Fin => {
                    sender_total = Some(packet.total_packets);
                    reply_control(
                        &socket,
                        peer,
                        codec::FIN_ACK,
                        counters.packets.get() as u32,
                        &offset,
                    )
                    .await;
                    break;
                }
                Kind::Data => {
                    counters.max_seq_no.max(packet.seq_no as u64);
                    counters.sent_bytes.add(size as u64 + overhead);
                    counters.packets.add(1);

                    // The first datagram is measured against a zero
                    // baseline and contributes its whole transit to
                    // the jitter sum.
                    let transit_us = now_us - packet.timestamp as i64;
                    counters.jitter_us.add(transit_us.abs_diff(last_transit_us));
                    counters.delay_us.add(transit_us);
                    last_transit_us = transit_us;

                    if config.printpkg && sample_hex.is_none() {
                        sample_hex = Some(hex_string(&buf[..size]));
                    }
                }
                _ => log::trace!("unexpected control datagram: seq={:08x}", packet.seq_no),
            }
        }

        counters.stop();
        let end = epoch_seconds();
        let report = sampler.join().await;

        if counters.sent_bytes.get() > 0 {
            statistics::emit_summary(
                FlowKind::UdpServer,
                config.structured,
                &report,
                &Totals {
                    start,
                    end,
                    bytes: counters.sent_bytes.get(),
                    packets: counters.packets.get(),
                    peer_packets: sender_total.map(u64::from),
                    jitter_ms: counters.jitter_us.get() as f64 / 1000.0,
                    sample_hex,
                },
            );
        }

        if config.one_test || forced_quit {
            break;
        }
    }

    Ok(())
}
