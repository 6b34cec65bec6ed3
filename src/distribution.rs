//! Traffic shaping knobs.
//!
//! Three quantities can be drawn from a distribution instead of staying
//! fixed: the inter-send gap, the frame length, and the bandwidth used
//! to derive both. Each knob is either fixed at its configured mean or
//! exponentially distributed around it.

use std::time::Duration;

use anyhow::{Result, bail};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Largest frame length an exponential draw may produce.
pub const MAX_FRAME_LEN: usize = 64_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sampling {
    #[default]
    Fixed,
    Exponential,
}

impl Sampling {
    /// Parse a distribution tag from the command line. Absent means
    /// fixed; only "exp" is supported.
    pub fn from_tag(tag: Option<&str>) -> Result<Self> {
        match tag {
            None => Ok(Self::Fixed),
            Some(tag) if tag.eq_ignore_ascii_case("exp") => Ok(Self::Exponential),
            Some(tag) => bail!("unsupported distribution: {:?}", tag),
        }
    }
}

/// Draws frame lengths and send gaps for the pacing loop.
///
/// Owned by the I/O driver alone, so a bandwidth redraw replaces the
/// packet rate and the mean gap in one step without synchronization.
pub struct Shaper {
    frame_len: usize,
    reserve: usize,
    fill: u8,
    bandwidth: Option<u64>,
    mean_gap: Option<Duration>,
    dist_gap: Sampling,
    dist_len: Sampling,
    dist_bandwidth: Sampling,
    rng: StdRng,
}

impl Shaper {
    /// `reserve` is subtracted from every drawn frame length before the
    /// payload is built; the datagram transport uses it to leave room
    /// for its fixed header. `fill` is the payload filler byte.
    pub fn new(
        frame_len: usize,
        bandwidth: Option<u64>,
        dist_gap: Sampling,
        dist_len: Sampling,
        dist_bandwidth: Sampling,
        reserve: usize,
        fill: u8,
    ) -> Self {
        let pps = bandwidth.map(|bits| bits / (frame_len as u64 * 8));

        Self {
            frame_len,
            reserve,
            fill,
            bandwidth,
            mean_gap: mean_gap(pps),
            dist_gap,
            dist_len,
            dist_bandwidth,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Whether the send loop is rate-limited at all. An unset or
    /// degenerate (sub-one-packet-per-second) bandwidth sends
    /// back-to-back.
    pub fn is_paced(&self) -> bool {
        self.mean_gap.is_some()
    }

    /// Redraw the bandwidth and rederive the packet rate and mean gap.
    /// A no-op when the bandwidth knob is fixed.
    pub fn reset_bandwidth(&mut self) {
        if self.dist_bandwidth == Sampling::Fixed {
            return;
        }

        if let Some(mean) = self.bandwidth {
            let bits = self.exponential(mean as f64) as u64;
            self.mean_gap = mean_gap(Some(bits / (self.frame_len as u64 * 8)));
        }
    }

    /// The next payload to transmit.
    pub fn payload(&mut self) -> Vec<u8> {
        let len = match self.dist_len {
            Sampling::Fixed => self.frame_len,
            Sampling::Exponential => {
                (self.exponential(self.frame_len as f64) as usize).min(MAX_FRAME_LEN)
            }
        };

        vec![self.fill; len.saturating_sub(self.reserve)]
    }

    /// The gap to schedule after the current send. `None` when unpaced.
    pub fn next_gap(&mut self) -> Option<Duration> {
        let mean = self.mean_gap?;
        Some(match self.dist_gap {
            Sampling::Fixed => mean,
            Sampling::Exponential => Duration::from_secs_f64(self.exponential(mean.as_secs_f64())),
        })
    }

    // Inverse-transform sampling; 1 - u keeps the argument of ln away
    // from zero.
    fn exponential(&mut self, mean: f64) -> f64 {
        let u: f64 = self.rng.random();
        -mean * (1.0 - u).ln()
    }
}

fn mean_gap(pps: Option<u64>) -> Option<Duration> {
    match pps {
        Some(pps) if pps > 0 => Some(Duration::from_secs_f64(1.0 / pps as f64)),
        _ => None,
    }
}
