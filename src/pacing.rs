//! The paced send loop shared by both transports.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::time::sleep;

use crate::{
    config::FlowConfig, distribution::Shaper, engine::Shutdown, statistics::RunCounters,
};

/// Longest single sleep inside the loop, so peer teardown and user
/// interrupts are noticed promptly even at low packet rates.
const POLL_SLICE: Duration = Duration::from_millis(5);

/// Why the send loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// The duration or byte budget was reached.
    Criterion,
    /// User interrupt.
    Interrupted,
    /// The peer tore the session down; it has already been
    /// acknowledged by the transport.
    PeerQuit,
    /// The transport reported a send failure.
    SendFailed,
}

/// What the pacing loop needs from a transport.
pub trait Sender {
    /// Frame and transmit one payload, returning the on-wire byte
    /// count to account.
    async fn send_one(&mut self, payload: &[u8]) -> std::io::Result<usize>;

    /// Non-blocking look at inbound control traffic between send
    /// slots.
    async fn poll_control(&mut self) -> Result<ControlFlow<()>> {
        Ok(ControlFlow::Continue(()))
    }
}

/// Drive `sender` until a stop criterion fires.
///
/// With a packet rate in effect the loop keeps a soft schedule: a send
/// is due whenever the wall clock passes `next_send`, and every send
/// advances the schedule by one sampled gap. All slots that have come
/// due are drained in one pass, so a stalled scheduler is paid back
/// with a burst rather than a permanently lowered rate. Without a rate
/// the loop sends back to back.
pub async fn run<S: Sender>(
    sender: &mut S,
    shaper: &mut Shaper,
    counters: &RunCounters,
    config: &FlowConfig,
    shutdown: &Shutdown,
) -> Result<Stop> {
    let start = Instant::now();
    let mut next_send = start;
    let mut last_reset = start;

    shaper.reset_bandwidth();

    loop {
        if let Some(duration) = config.duration
            && start.elapsed().as_secs_f64() >= duration as f64
        {
            return Ok(Stop::Criterion);
        }

        if let Some(total) = config.total_size
            && counters.sent_bytes.get() >= total
        {
            return Ok(Stop::Criterion);
        }

        if shutdown.is_raised() {
            return Ok(Stop::Interrupted);
        }

        if let Some(reset) = config.bandwidth_reset_interval
            && last_reset.elapsed().as_secs_f64() >= reset
        {
            shaper.reset_bandwidth();
            last_reset = Instant::now();
        }

        if let ControlFlow::Break(()) = sender.poll_control().await? {
            return Ok(Stop::PeerQuit);
        }

        if shaper.is_paced() {
            let now = Instant::now();
            if now < next_send {
                sleep(POLL_SLICE.min(next_send - now)).await;
                continue;
            }

            while Instant::now() >= next_send {
                match send_one(sender, shaper, counters).await {
                    Ok(()) => {}
                    Err(stop) => return Ok(stop),
                }

                match shaper.next_gap() {
                    Some(gap) => next_send += gap,
                    // A bandwidth redraw can drop the loop out of
                    // pacing entirely.
                    None => break,
                }
            }
        } else if let Err(stop) = send_one(sender, shaper, counters).await {
            return Ok(stop);
        }
    }
}

async fn send_one<S: Sender>(
    sender: &mut S,
    shaper: &mut Shaper,
    counters: &RunCounters,
) -> Result<(), Stop> {
    let payload = shaper.payload();
    match sender.send_one(&payload).await {
        Ok(size) => {
            counters.sent_bytes.add(size as u64);
            counters.packets.add(1);
            Ok(())
        }
        Err(e) => {
            log::warn!("send error: {:?}", e);
            Err(Stop::SendFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Role, Transport};
    use crate::distribution::Sampling;

    struct NullSender {
        sent: usize,
    }

    impl Sender for NullSender {
        async fn send_one(&mut self, payload: &[u8]) -> std::io::Result<usize> {
            self.sent += 1;
            Ok(payload.len())
        }
    }

    fn config(duration: Option<u64>, total_size: Option<u64>) -> FlowConfig {
        FlowConfig {
            transport: Transport::Tcp,
            role: Role::Client,
            host: Some("127.0.0.1".to_string()),
            bind_address: None,
            port: 5001,
            ipv6: false,
            duration,
            total_size,
            packet_size: 1000,
            bandwidth: None,
            interval: 1.0,
            dist_gap: Sampling::Fixed,
            dist_len: Sampling::Fixed,
            dist_bandwidth: Sampling::Fixed,
            bandwidth_reset_interval: None,
            structured: true,
            one_test: false,
            printpkg: false,
            clock_config: "config.json".to_string(),
        }
    }

    #[tokio::test]
    async fn test_byte_budget_stop() {
        let config = config(None, Some(50_000));
        let mut shaper = Shaper::new(
            1000,
            None,
            Sampling::Fixed,
            Sampling::Fixed,
            Sampling::Fixed,
            0,
            b'X',
        );

        let counters = RunCounters::default();
        counters.start();

        let mut sender = NullSender { sent: 0 };
        let shutdown = Shutdown::disarmed();
        let stop = run(&mut sender, &mut shaper, &counters, &config, &shutdown)
            .await
            .unwrap();

        assert_eq!(stop, Stop::Criterion);
        assert!(counters.sent_bytes.get() >= 50_000);
        assert!(counters.sent_bytes.get() <= 51_000);
        assert_eq!(sender.sent as u64, counters.packets.get());
    }

    #[tokio::test]
    async fn test_rate_cap() {
        let config = config(None, Some(25_000));
        // 400 kbit/s over 1000-byte frames: 50 packets per second, so
        // 25 frames should take roughly half a second.
        let mut shaper = Shaper::new(
            1000,
            Some(400_000),
            Sampling::Fixed,
            Sampling::Fixed,
            Sampling::Fixed,
            0,
            b'X',
        );

        let counters = RunCounters::default();
        counters.start();

        let mut sender = NullSender { sent: 0 };
        let shutdown = Shutdown::disarmed();
        let started = Instant::now();
        let stop = run(&mut sender, &mut shaper, &counters, &config, &shutdown)
            .await
            .unwrap();
        let elapsed = started.elapsed().as_secs_f64();

        assert_eq!(stop, Stop::Criterion);
        let rate = counters.sent_bytes.get() as f64 * 8.0 / elapsed;
        assert!(rate <= 400_000.0 * 1.2, "observed {} bit/s", rate);
    }

    #[tokio::test]
    async fn test_duration_stop() {
        let config = config(Some(1), None);
        let mut shaper = Shaper::new(
            100,
            Some(80_000),
            Sampling::Fixed,
            Sampling::Fixed,
            Sampling::Fixed,
            0,
            b'X',
        );

        let counters = RunCounters::default();
        counters.start();

        let mut sender = NullSender { sent: 0 };
        let shutdown = Shutdown::disarmed();
        let started = Instant::now();
        let stop = run(&mut sender, &mut shaper, &counters, &config, &shutdown)
            .await
            .unwrap();

        assert_eq!(stop, Stop::Criterion);
        let elapsed = started.elapsed().as_secs_f64();
        assert!((0.9..2.0).contains(&elapsed), "{}", elapsed);
    }
}
