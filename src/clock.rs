//! Clock offset estimation against the local time-sync daemon.
//!
//! One-way delay measurement needs both hosts on comparable clocks. A
//! background task polls the system's chrony instance every 500 ms and
//! publishes the measured offset in microseconds; the datagram engine
//! folds it into every outgoing timestamp and into the receive-side
//! clock. Hosts without a reachable daemon run with a zero offset.

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};
use std::time::Duration;

use serde::Deserialize;
use tokio::{task::JoinHandle, time::sleep};

/// Optional correction config (`config.json`). The measured offset is
/// multiplied by `offset_fix_rate`; an absent file keeps the neutral
/// rate of 1.0.
#[derive(Deserialize, Debug)]
pub struct ClockConfig {
    #[serde(default = "ClockConfig::offset_fix_rate")]
    pub offset_fix_rate: f64,
}

impl ClockConfig {
    fn offset_fix_rate() -> f64 {
        1.0
    }

    pub fn load(path: &str) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json5::from_str(&text).ok())
            .unwrap_or_default()
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            offset_fix_rate: Self::offset_fix_rate(),
        }
    }
}

/// Shared handle to the most recent offset estimate.
#[derive(Clone, Default)]
pub struct ClockOffset(Arc<AtomicI64>);

impl ClockOffset {
    pub fn micros(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    fn store(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }
}

/// The background poller task.
pub struct ClockEstimator {
    offset: ClockOffset,
    handle: JoinHandle<()>,
}

impl ClockEstimator {
    pub fn spawn(config: ClockConfig) -> Self {
        let offset = ClockOffset::default();

        Self {
            handle: tokio::spawn(poll_loop(offset.clone(), config.offset_fix_rate)),
            offset,
        }
    }

    pub fn offset(&self) -> ClockOffset {
        self.offset.clone()
    }
}

impl Drop for ClockEstimator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn poll_loop(offset: ClockOffset, rate: f64) {
    if !sync_daemon_active().await {
        log::info!("time-sync daemon not active, clock offset stays 0");
        return;
    }

    loop {
        let micros = read_clock_offset().await.unwrap_or(0.0) * rate;
        offset.store(micros as i64);
        sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(target_os = "linux")]
async fn sync_daemon_active() -> bool {
    match tokio::process::Command::new("systemctl")
        .args(["is-active", "chronyd"])
        .output()
        .await
    {
        Ok(output) => output.stdout.as_slice() == b"active\n",
        Err(_) => false,
    }
}

/// Current offset in microseconds as chrony measures it, `None` when
/// the probe is unavailable or its output does not parse.
#[cfg(target_os = "linux")]
async fn read_clock_offset() -> Option<f64> {
    let output = tokio::process::Command::new("chronyc")
        .arg("sources")
        .output()
        .await
        .ok()?;

    parse_sources(std::str::from_utf8(&output.stdout).ok()?)
}

#[cfg(not(target_os = "linux"))]
async fn sync_daemon_active() -> bool {
    false
}

#[cfg(not(target_os = "linux"))]
async fn read_clock_offset() -> Option<f64> {
    None
}

/// Pick the measured offset of the selected source out of a
/// `chronyc sources` listing. The selected source row starts with
/// `^*`; its last column reads like `+12us[ -36us] +/- 45ms` and the
/// bracketed value is the measured offset.
fn parse_sources(output: &str) -> Option<f64> {
    for line in output.lines().rev() {
        let line = line.trim_start();
        if !line.starts_with("^*") {
            continue;
        }

        let open = line.rfind('[')?;
        let close = line.rfind(']')?;
        return parse_offset_micros(line.get(open + 1..close)?.trim());
    }

    None
}

fn parse_offset_micros(value: &str) -> Option<f64> {
    for (suffix, scale) in [("ns", 1e-3), ("us", 1.0), ("ms", 1e3), ("s", 1e6)] {
        if let Some(digits) = value.strip_suffix(suffix) {
            return digits.trim().parse::<f64>().ok().map(|n| n * scale);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCES: &str = "MS Name/IP address         Stratum Poll Reach LastRx Last sample
===============================================================================
^- ntp2.example.net              2  10   377   909   +784us[ +784us] +/-   45ms
^* ntp1.example.net              1  10   377   371    +30us[  -36us] +/-   23ms
";

    #[test]
    fn test_parse_sources() {
        assert_eq!(parse_sources(SOURCES), Some(-36.0));
        assert_eq!(parse_sources(""), None);
        assert_eq!(parse_sources("no sync sources"), None);
    }

    #[test]
    fn test_parse_offset_units() {
        assert_eq!(parse_offset_micros("-36us"), Some(-36.0));
        assert_eq!(parse_offset_micros("0.5ms"), Some(500.0));
        assert_eq!(parse_offset_micros("150ns"), Some(0.15));
        assert_eq!(parse_offset_micros("2s"), Some(2_000_000.0));
        assert_eq!(parse_offset_micros("12parsec"), None);
    }

    #[test]
    fn test_config_defaults_without_file() {
        let config = ClockConfig::load("/nonexistent/config.json");
        assert_eq!(config.offset_fix_rate, 1.0);
    }
}
