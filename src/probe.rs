//! Kernel connection-state probe for stream flows.
//!
//! The sampler reads congestion window, retransmit, and RTT figures
//! straight from the kernel on platforms that expose them; everywhere
//! else the probe degrades to zero fields.

use tokio::net::TcpStream;

/// A snapshot of kernel TCP state. `snd_cwnd` is in segments; the
/// congestion window in bytes is `snd_cwnd * mss`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpInfo {
    pub mss: u64,
    pub snd_cwnd: u64,
    pub retransmits: u64,
    pub rtt_us: u64,
}

#[cfg(target_os = "linux")]
pub use linux::TcpProbe;

#[cfg(target_os = "linux")]
mod linux {
    use std::{
        mem,
        os::fd::{AsRawFd, RawFd},
    };

    use super::{TcpInfo, TcpStream};

    /// Reads TCP_INFO from the stream's descriptor.
    ///
    /// Holds the raw descriptor only; the engine joins the sampler
    /// before dropping the stream, so every read happens while the
    /// socket is still open.
    pub struct TcpProbe {
        fd: RawFd,
    }

    impl TcpProbe {
        pub fn new(stream: &TcpStream) -> Self {
            Self {
                fd: stream.as_raw_fd(),
            }
        }

        pub fn read(&self) -> TcpInfo {
            let mut info: libc::tcp_info = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::tcp_info>() as libc::socklen_t;

            let ret = unsafe {
                libc::getsockopt(
                    self.fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_INFO,
                    (&mut info as *mut libc::tcp_info).cast(),
                    &mut len,
                )
            };

            if ret != 0 {
                log::warn!("TCP_INFO probe failed, reporting zero fields");
                return TcpInfo::default();
            }

            TcpInfo {
                mss: info.tcpi_advmss as u64,
                snd_cwnd: info.tcpi_snd_cwnd as u64,
                retransmits: info.tcpi_total_retrans as u64,
                rtt_us: info.tcpi_rtt as u64,
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use fallback::TcpProbe;

#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::{TcpInfo, TcpStream};

    /// No probe on this platform; every field reads as zero.
    pub struct TcpProbe;

    impl TcpProbe {
        pub fn new(_stream: &TcpStream) -> Self {
            Self
        }

        pub fn read(&self) -> TcpInfo {
            TcpInfo::default()
        }
    }
}
