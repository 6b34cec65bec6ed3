//! Stream flow driver.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
};

use super::{Shutdown, epoch_seconds};
use crate::{
    config::FlowConfig,
    pacing::{self, Sender},
    probe::TcpProbe,
    statistics::{self, FlowKind, RunCounters, Sampler, SamplerMode, Totals},
};

const RECV_BUF: usize = 65535;

struct StreamSender<'a> {
    stream: &'a mut TcpStream,
}

impl Sender for StreamSender<'_> {
    async fn send_one(&mut self, payload: &[u8]) -> std::io::Result<usize> {
        self.stream.write_all(payload).await?;
        Ok(payload.len())
    }
}

fn socket_for(config: &FlowConfig) -> std::io::Result<TcpSocket> {
    if config.ipv6 {
        TcpSocket::new_v6()
    } else {
        TcpSocket::new_v4()
    }
}

/// One-connection-at-a-time receiver. Every stream read counts as one
/// "packet"; the run ends at EOF or on a receive error.
pub async fn run_server(config: Arc<FlowConfig>) -> Result<()> {
    let listen = config.listen_addr()?;
    let socket = socket_for(&config)?;
    socket.set_reuseaddr(true)?;
    socket
        .bind(listen)
        .with_context(|| format!("bind failed: {}", listen))?;
    let listener = socket.listen(1)?;

    if !config.structured {
        println!("TCP Server listening on {}", listen);
    }

    let mut shutdown = Shutdown::listen();
    let counters = Arc::new(RunCounters::default());
    let mut buf = vec![0u8; RECV_BUF];

    loop {
        let (mut stream, addr) = tokio::select! {
            ret = listener.accept() => ret.context("accept failed")?,
            _ = shutdown.raised() => break,
        };

        if !config.structured {
            println!("Connection from {}", addr);
        }

        counters.start();
        let start = epoch_seconds();
        let sampler = Sampler::spawn(
            counters.clone(),
            config.interval,
            SamplerMode::TcpServer,
            config.structured,
        );

        loop {
            let size = tokio::select! {
                ret = stream.read(&mut buf) => match ret {
                    Ok(size) => size,
                    Err(e) => {
                        log::warn!("receive error: {:?}", e);
                        break;
                    }
                },
                _ = shutdown.raised() => break,
            };

            if size == 0 {
                break;
            }

            counters.sent_bytes.add(size as u64);
            counters.packets.add(1);
        }

        counters.stop();
        let end = epoch_seconds();
        let report = sampler.join().await;

        if counters.sent_bytes.get() > 0 {
            statistics::emit_summary(
                FlowKind::TcpServer,
                config.structured,
                &report,
                &Totals {
                    start,
                    end,
                    bytes: counters.sent_bytes.get(),
                    packets: counters.packets.get(),
                    peer_packets: None,
                    jitter_ms: 0.0,
                    sample_hex: None,
                },
            );
        }

        if config.one_test || shutdown.is_raised() {
            break;
        }
    }

    Ok(())
}

/// Paced sender. Buffer sizing is left to the kernel and Nagle is
/// disabled so the pacing loop controls what goes on the wire.
pub async fn run_client(config: Arc<FlowConfig>) -> Result<()> {
    let peer = config.peer_addr()?;
    let socket = socket_for(&config)?;
    socket.set_send_buffer_size(0)?;
    socket.set_recv_buffer_size(0)?;

    let mut stream = socket
        .connect(peer)
        .await
        .with_context(|| format!("connect failed: {}", peer))?;
    stream.set_nodelay(true)?;

    if !config.structured {
        println!("Connected to {}", peer);
    }

    let counters = Arc::new(RunCounters::default());
    counters.start();

    let start = epoch_seconds();
    let sampler = Sampler::spawn(
        counters.clone(),
        config.interval,
        SamplerMode::TcpClient(TcpProbe::new(&stream)),
        config.structured,
    );

    let shutdown = Shutdown::listen();
    let mut shaper = config.shaper();
    let mut sender = StreamSender {
        stream: &mut stream,
    };

    pacing::run(&mut sender, &mut shaper, &counters, &config, &shutdown).await?;

    counters.stop();
    let end = epoch_seconds();
    let report = sampler.join().await;

    statistics::emit_summary(
        FlowKind::TcpClient,
        config.structured,
        &report,
        &Totals {
            start,
            end,
            bytes: counters.sent_bytes.get(),
            packets: counters.packets.get(),
            peer_packets: None,
            jitter_ms: 0.0,
            sample_hex: None,
        },
    );

    Ok(())
}
