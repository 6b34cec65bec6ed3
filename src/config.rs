//! Command line surface and the immutable per-run configuration.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::distribution::{Sampling, Shaper};
use crate::units;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Parser, Debug)]
#[command(
    name = "flowgen",
    about = env!("CARGO_PKG_DESCRIPTION"),
    disable_version_flag = true,
)]
struct Cli {
    /// run as a server
    #[arg(short = 's', long)]
    server: bool,

    /// server address to connect to
    #[arg(short = 'c', long, value_name = "HOST")]
    client: Option<String>,

    /// port number
    #[arg(short = 'p', long, default_value_t = 5001)]
    port: u16,

    /// use UDP instead of TCP
    #[arg(short = 'u', long)]
    udp: bool,

    /// test duration in seconds
    #[arg(short = 't', long)]
    time: Option<u64>,

    /// total size to transfer (K/M/G byte suffixes)
    #[arg(short = 'n', long, value_name = "SIZE")]
    size: Option<String>,

    /// packet size in bytes
    #[arg(short = 'l', long)]
    packet_size: Option<usize>,

    /// bandwidth limit in bit/s (K/M/G suffixes)
    #[arg(short = 'b', long, value_name = "RATE")]
    bandwidth: Option<String>,

    /// statistics interval in seconds
    #[arg(short = 'i', long, default_value_t = 1.0)]
    interval: f64,

    /// packet interval distribution ("exp")
    #[arg(long, value_name = "TAG")]
    dpps: Option<String>,

    /// packet size distribution ("exp")
    #[arg(long, value_name = "TAG")]
    dl: Option<String>,

    /// bandwidth distribution ("exp")
    #[arg(long, value_name = "TAG")]
    db: Option<String>,

    /// bandwidth resample interval in seconds
    #[arg(long, value_name = "SECONDS")]
    bri: Option<f64>,

    /// print statistics as a JSON object
    #[arg(short = 'J', long)]
    json: bool,

    /// server exits after the first test
    #[arg(short = '1', long)]
    one_test: bool,

    /// bind address for the server
    #[arg(short = 'B', long, value_name = "ADDR")]
    bind_address: Option<String>,

    /// use IPv6 instead of IPv4
    #[arg(short = '6', long)]
    ipv6: bool,

    /// print a sample payload in hex with the summary
    #[arg(long)]
    ppkg: bool,

    /// clock correction config file
    #[arg(long, default_value = "config.json", value_name = "PATH")]
    config: String,

    /// print version
    #[arg(short = 'v', long)]
    version: bool,
}

/// Immutable flow configuration, fixed before the engine starts.
#[derive(Debug)]
pub struct FlowConfig {
    pub transport: Transport,
    pub role: Role,
    pub host: Option<String>,
    pub bind_address: Option<String>,
    pub port: u16,
    pub ipv6: bool,
    pub duration: Option<u64>,
    pub total_size: Option<u64>,
    pub packet_size: usize,
    pub bandwidth: Option<u64>,
    pub interval: f64,
    pub dist_gap: Sampling,
    pub dist_len: Sampling,
    pub dist_bandwidth: Sampling,
    pub bandwidth_reset_interval: Option<f64>,
    pub structured: bool,
    pub one_test: bool,
    pub printpkg: bool,
    pub clock_config: String,
}

impl FlowConfig {
    /// Parse and validate the command line. Prints the version string
    /// and leaves early when `-v` is given.
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        if cli.version {
            println!("flowgen: {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        Self::from_cli(cli)
    }

    fn from_cli(cli: Cli) -> Result<Self> {
        if cli.server && cli.client.is_some() {
            bail!("cannot specify both server and client");
        }

        if !cli.server && cli.client.is_none() {
            bail!("must specify either server or client");
        }

        if cli.time.is_some() && cli.size.is_some() {
            bail!("cannot specify both time and size");
        }

        if cli.client.is_some() && cli.time.is_none() && cli.size.is_none() {
            bail!("must specify either time or size");
        }

        if cli.ppkg && !cli.udp {
            bail!("sample payload printing is only available for UDP");
        }

        if let Some(addr) = &cli.bind_address {
            check_family(addr, cli.ipv6, "bind address")?;
        }

        if let Some(host) = &cli.client {
            check_family(host, cli.ipv6, "client address")?;
        }

        let transport = if cli.udp { Transport::Udp } else { Transport::Tcp };
        let role = if cli.server { Role::Server } else { Role::Client };

        let mut bandwidth = cli
            .bandwidth
            .as_deref()
            .map(units::parse_bps)
            .transpose()
            .context("invalid bandwidth")?;

        let total_size = cli
            .size
            .as_deref()
            .map(units::parse_bytes)
            .transpose()
            .context("invalid size")?;

        // UDP flows default to a 1 Mbit/s cap; the default frame
        // length tracks the rate so slow flows still send several
        // frames per second.
        let packet_size = match (transport, cli.packet_size) {
            (_, Some(size)) => size,
            (Transport::Tcp, None) => 64_000,
            (Transport::Udp, None) => {
                let rate = *bandwidth.get_or_insert(1_000_000);
                ((rate as f64 * 0.005) as usize).clamp(80, 1450)
            }
        };
        if transport == Transport::Udp {
            bandwidth.get_or_insert(1_000_000);
        }

        if packet_size == 0 {
            bail!("packet size must be positive");
        }

        if cli.interval <= 0.0 {
            bail!("statistics interval must be positive");
        }

        let dist_bandwidth = Sampling::from_tag(cli.db.as_deref())?;
        if dist_bandwidth != Sampling::Fixed && bandwidth.is_none() {
            bail!("bandwidth distribution requires a bandwidth");
        }

        Ok(Self {
            transport,
            role,
            host: cli.client,
            bind_address: cli.bind_address,
            port: cli.port,
            ipv6: cli.ipv6,
            duration: cli.time,
            total_size,
            packet_size,
            bandwidth,
            interval: cli.interval,
            dist_gap: Sampling::from_tag(cli.dpps.as_deref())?,
            dist_len: Sampling::from_tag(cli.dl.as_deref())?,
            dist_bandwidth,
            bandwidth_reset_interval: cli.bri,
            structured: cli.json,
            one_test: cli.one_test,
            printpkg: cli.ppkg,
            clock_config: cli.config,
        })
    }

    /// The server listen address: the bind flag, or the family's
    /// wildcard.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip = match &self.bind_address {
            Some(addr) => IpAddr::from_str(addr)?,
            None if self.ipv6 => IpAddr::from_str("::")?,
            None => IpAddr::from_str("0.0.0.0")?,
        };

        Ok(SocketAddr::new(ip, self.port))
    }

    /// The client's target endpoint.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let host = self.host.as_deref().context("missing peer host")?;
        Ok(SocketAddr::new(IpAddr::from_str(host)?, self.port))
    }

    /// A wildcard address with an ephemeral port on the configured
    /// family, for the client-side datagram socket.
    pub fn ephemeral_addr(&self) -> SocketAddr {
        let ip = if self.ipv6 {
            IpAddr::from(std::net::Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::from(std::net::Ipv4Addr::UNSPECIFIED)
        };

        SocketAddr::new(ip, 0)
    }

    /// The traffic shaper for this flow. The datagram transport
    /// reserves room for its fixed header inside each frame.
    pub fn shaper(&self) -> Shaper {
        let (reserve, fill) = match self.transport {
            Transport::Tcp => (0, b'X'),
            Transport::Udp => (codec::HEADER_SIZE, b'x'),
        };

        Shaper::new(
            self.packet_size,
            self.bandwidth,
            self.dist_gap,
            self.dist_len,
            self.dist_bandwidth,
            reserve,
            fill,
        )
    }
}

fn check_family(value: &str, ipv6: bool, what: &str) -> Result<()> {
    let family = if ipv6 { "IPv6" } else { "IPv4" };
    let addr = IpAddr::from_str(value)
        .with_context(|| format!("{} must be a valid {} address", what, family))?;

    if addr.is_ipv6() != ipv6 {
        bail!("{} must be a valid {} address", what, family);
    }

    Ok(())
}
