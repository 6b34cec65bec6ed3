//! Run counters and the background statistics sampler.
//!
//! The I/O driver is the only writer of every counter and the sampler
//! task is the only reader, so plain relaxed atomics are enough; the
//! sampler tolerates reads that are a few packets stale.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{task::JoinHandle, time::sleep};

use crate::probe::TcpProbe;

/// Single-writer cumulative counter.
#[derive(Default)]
pub struct Count(AtomicU64);

impl Count {
    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn max(&self, value: u64) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Signed counterpart of [`Count`]; one-way delays can be negative
/// under clock skew.
#[derive(Default)]
pub struct SignedCount(AtomicI64);

impl SignedCount {
    pub fn add(&self, value: i64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Cumulative counters for one measurement run.
///
/// Byte totals are on-wire bytes: the datagram engine adds its
/// per-frame overhead constant before accounting. Jitter and delay are
/// kept in integer microseconds and scaled to milliseconds at report
/// time.
#[derive(Default)]
pub struct RunCounters {
    pub sent_bytes: Count,
    pub packets: Count,
    pub max_seq_no: Count,
    pub jitter_us: Count,
    pub delay_us: SignedCount,
    running: AtomicBool,
}

impl RunCounters {
    /// Reset all counters and mark the run live.
    pub fn start(&self) {
        self.sent_bytes.reset();
        self.packets.reset();
        self.max_seq_no.reset();
        self.jitter_us.reset();
        self.delay_us.reset();
        self.running.store(true, Ordering::Relaxed);
    }

    /// Mark the run finished; the sampler exits at its next check.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Transport/role pair, fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    TcpServer,
    TcpClient,
    UdpServer,
    UdpClient,
}

/// What the sampler measures besides the shared counters.
pub enum SamplerMode {
    TcpServer,
    TcpClient(TcpProbe),
    UdpServer,
    UdpClient,
}

impl SamplerMode {
    pub fn kind(&self) -> FlowKind {
        match self {
            Self::TcpServer => FlowKind::TcpServer,
            Self::TcpClient(_) => FlowKind::TcpClient,
            Self::UdpServer => FlowKind::UdpServer,
            Self::UdpClient => FlowKind::UdpClient,
        }
    }
}

/// One reporting window.
#[derive(Debug, Clone, Serialize)]
pub struct IntervalRow {
    pub times: String,
    pub bytes: u64,
    pub bandwidth: f64,
    pub packets: u64,
    pub pps: f64,
    pub total_bytes: u64,
    pub total_packets: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwnd: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retr: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_packets: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
}

/// Everything the sampler accumulated over a run, handed back to the
/// engine when it joins the task.
#[derive(Default)]
pub struct Report {
    pub rows: Vec<IntervalRow>,
    pub max_cwnd: u64,
    pub mean_rtt: f64,
    pub retransmits: u64,
}

/// The background sampler task.
pub struct Sampler {
    handle: JoinHandle<Report>,
}

impl Sampler {
    /// Start sampling `counters` every `interval` seconds. Rows are
    /// printed live in human mode and only collected in structured
    /// mode.
    pub fn spawn(
        counters: Arc<RunCounters>,
        interval: f64,
        mode: SamplerMode,
        structured: bool,
    ) -> Self {
        Self {
            handle: tokio::spawn(sample_loop(counters, interval, mode, structured)),
        }
    }

    /// Wait for the sampler to observe the stopped run and collect its
    /// report. Must be called after [`RunCounters::stop`].
    pub async fn join(self) -> Report {
        self.handle.await.unwrap_or_default()
    }
}

async fn sample_loop(
    counters: Arc<RunCounters>,
    interval: f64,
    mode: SamplerMode,
    structured: bool,
) -> Report {
    let start = Instant::now();
    let mut last_time = start;

    let mut last_bytes = 0u64;
    let mut last_packets = 0u64;
    let mut last_max_seq = 0u64;
    let mut last_jitter_us = 0u64;
    let mut retransmits = 0u64;

    let mut report = Report::default();
    let mut rtt_rows = 0u64;
    let mut rtt_sum = 0f64;

    loop {
        sleep(Duration::from_millis(5)).await;

        let now = Instant::now();
        let running = counters.is_running();
        if now.duration_since(last_time).as_secs_f64() <= interval && running {
            continue;
        }

        let elapsed = now.duration_since(last_time).as_secs_f64();
        let begin = last_time.duration_since(start).as_secs_f64();
        let end = now.duration_since(start).as_secs_f64();

        let bytes = counters.sent_bytes.get();
        let packets = counters.packets.get();
        let bytes_diff = bytes - last_bytes;
        let packets_diff = packets - last_packets;

        let mut row = IntervalRow {
            times: format!("{:.2}-{:.2}", begin, end),
            bytes: bytes_diff,
            bandwidth: zero_div(bytes_diff as f64 * 8.0, elapsed),
            packets: packets_diff,
            pps: zero_div(packets_diff as f64, elapsed),
            total_bytes: bytes,
            total_packets: packets,
            cwnd: None,
            retr: None,
            rtt: None,
            lost_packets: None,
            lost_percent: None,
            jitter_ms: None,
        };

        match &mode {
            SamplerMode::TcpClient(probe) => {
                let info = probe.read();
                let cwnd = info.snd_cwnd * info.mss;
                let retr = info.retransmits.saturating_sub(retransmits);
                retransmits = info.retransmits;

                row.cwnd = Some(cwnd);
                row.retr = Some(retr);
                row.rtt = Some(info.rtt_us);

                report.max_cwnd = report.max_cwnd.max(cwnd);
                rtt_sum += info.rtt_us as f64;
                rtt_rows += 1;
            }
            SamplerMode::UdpServer => {
                let max_seq = counters.max_seq_no.get();
                let jitter_us = counters.jitter_us.get();
                let seq_diff = max_seq - last_max_seq;
                let jitter_diff = jitter_us - last_jitter_us;
                let lost = seq_diff as i64 - packets_diff as i64;

                row.lost_packets = Some(lost);
                row.lost_percent = Some(zero_div(100.0 * lost as f64, seq_diff as f64));
                row.jitter_ms = Some(zero_div(jitter_diff as f64 / 1000.0, packets_diff as f64));

                last_max_seq = max_seq;
                last_jitter_us = jitter_us;
            }
            _ => {}
        }

        if !structured {
            print_row(mode.kind(), &row, elapsed);
        }

        report.rows.push(row);

        last_bytes = bytes;
        last_packets = packets;
        last_time += Duration::from_secs_f64(interval);

        if !running {
            break;
        }
    }

    report.retransmits = retransmits;
    report.mean_rtt = zero_div(rtt_sum, rtt_rows as f64);
    report
}

fn zero_div(num: f64, div: f64) -> f64 {
    if div > 0.0 { num / div } else { 0.0 }
}

const MB: f64 = 1024.0 * 1024.0;

fn print_row(kind: FlowKind, row: &IntervalRow, elapsed: f64) {
    let transfer = row.bytes as f64 / MB;
    let mbps = zero_div(row.bytes as f64 * 8.0 / 1_000_000.0, elapsed);

    match kind {
        FlowKind::TcpClient => println!(
            "[ {} s]  Transfer: {:.2} MB  Bandwidth: {:.2} Mbps  Cwnd: {}  Retr: {}  RTT: {:.2}  ",
            row.times,
            transfer,
            mbps,
            row.cwnd.unwrap_or(0),
            row.retr.unwrap_or(0),
            row.rtt.unwrap_or(0) as f64,
        ),
        FlowKind::TcpServer => println!(
            "[ {} s]  Received: {:.2} MB  Bandwidth: {:.2} Mbps  ",
            row.times, transfer, mbps,
        ),
        FlowKind::UdpClient => println!(
            "[ {} s]  Transfer: {:.2} MB  Bandwidth: {:.2} Mbps  Total Datagrams: {}  ",
            row.times, transfer, mbps, row.packets,
        ),
        FlowKind::UdpServer => {
            let lost = row.lost_packets.unwrap_or(0);
            let total = lost + row.packets as i64;
            println!(
                "[ {} s]  Transfer: {:.2} MB  Bitrate: {:.2} Mbps  Jitters: {:.3} ms  Lost/Total Datagrams: {}/{} ({:.0}%)  ",
                row.times,
                transfer,
                mbps,
                row.jitter_ms.unwrap_or(0.0),
                lost,
                total,
                row.lost_percent.unwrap_or(0.0),
            )
        }
    }
}

/// Run totals the engine carries into the final summary.
pub struct Totals {
    /// Run start, seconds since the epoch.
    pub start: f64,
    /// Run end, seconds since the epoch.
    pub end: f64,
    pub bytes: u64,
    pub packets: u64,
    /// The packet total the peer reported during teardown: the
    /// sender's sent count on a server, the receiver's received count
    /// on a client.
    pub peer_packets: Option<u64>,
    /// Whole-run jitter sum in milliseconds (UDP server).
    pub jitter_ms: f64,
    /// First datagram of the run, hex encoded, when requested.
    pub sample_hex: Option<String>,
}

#[derive(Serialize)]
struct EndSummary {
    start: f64,
    end: f64,
    seconds: f64,
    bytes: u64,
    bits_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_snd_cwnd: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mean_rtt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retransmits: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lost_packets: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lost_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jitter_ms: Option<f64>,
}

#[derive(Serialize)]
struct StructuredOutput<'a> {
    intervals: &'a [IntervalRow],
    end: EndSummary,
}

/// Print the end-of-run summary; in structured mode this flushes the
/// whole `{intervals, end}` object instead.
pub fn emit_summary(kind: FlowKind, structured: bool, report: &Report, totals: &Totals) {
    if report.rows.is_empty() {
        return;
    }

    let seconds = totals.end - totals.start;
    let avg_bps = zero_div(totals.bytes as f64 * 8.0, seconds);

    let mut end = EndSummary {
        start: totals.start,
        end: totals.end,
        seconds,
        bytes: totals.bytes,
        bits_per_second: avg_bps,
        max_snd_cwnd: None,
        mean_rtt: None,
        retransmits: None,
        lost_packets: None,
        lost_percent: None,
        jitter_ms: None,
    };

    match kind {
        FlowKind::TcpClient => {
            end.max_snd_cwnd = Some(report.max_cwnd);
            end.mean_rtt = Some(report.mean_rtt);
            end.retransmits = Some(report.retransmits);
        }
        FlowKind::UdpServer => {
            // Reordering or duplication can push the received count
            // past the sender's total; losses clamp at zero.
            let sent = totals.peer_packets.unwrap_or(0);
            let lost = sent.saturating_sub(totals.packets);
            end.lost_packets = Some(lost);
            end.lost_percent = Some(zero_div(100.0 * lost as f64, sent as f64));
            end.jitter_ms = Some(zero_div(totals.jitter_ms, totals.packets as f64));
        }
        FlowKind::UdpClient => {
            let received = totals.peer_packets.unwrap_or(0);
            let lost = totals.packets.saturating_sub(received);
            end.lost_packets = Some(lost);
            end.lost_percent = Some(zero_div(100.0 * lost as f64, totals.packets as f64));
        }
        FlowKind::TcpServer => {}
    }

    if structured {
        let output = StructuredOutput {
            intervals: &report.rows,
            end,
        };

        match serde_json::to_string_pretty(&output) {
            Ok(text) => println!("{}", text),
            Err(e) => log::error!("statistics serialization failed: {:?}", e),
        }

        return;
    }

    println!("\n=== Test Summary ===");
    println!("Duration: {:.2} seconds", seconds);
    println!("Total Data: {:.2} MB", totals.bytes as f64 / MB);
    println!("Average Bandwidth: {:.2} Mbps", avg_bps / 1_000_000.0);

    match kind {
        FlowKind::TcpClient => {
            println!("Max_cwnd: {} bytes", report.max_cwnd);
            println!("Mean_RTT: {:.2}", report.mean_rtt);
            println!("Retransmissions: {}", report.retransmits);
        }
        FlowKind::UdpServer => {
            let sent = totals.peer_packets.unwrap_or(0);
            let lost = sent.saturating_sub(totals.packets);
            println!(
                "Jitters: {:.3} ms",
                zero_div(totals.jitter_ms, totals.packets as f64)
            );
            println!(
                "Lost/Total Datagrams: {}/{} ({:.0}%)",
                lost,
                sent,
                zero_div(100.0 * lost as f64, sent as f64)
            );
        }
        FlowKind::UdpClient => {
            let received = totals.peer_packets.unwrap_or(0);
            let lost = totals.packets.saturating_sub(received);
            println!(
                "Lost/Total Datagrams: {}/{} ({:.0}%)",
                lost,
                totals.packets,
                zero_div(100.0 * lost as f64, totals.packets as f64)
            );
        }
        FlowKind::TcpServer => {}
    }

    if let Some(hex) = &totals.sample_hex {
        println!("Sample package: {}", hex);
    }
}
