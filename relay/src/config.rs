//! Relay command line.

use std::net::{Ipv4Addr, Ipv6Addr};

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "flowgen-relay",
    about = env!("CARGO_PKG_DESCRIPTION"),
    disable_version_flag = true,
)]
pub struct Config {
    /// IPv4 endpoint address (listen side and forward target)
    #[arg(long = "ipv4_addr", default_value = "172.17.0.3")]
    pub ipv4_addr: Ipv4Addr,

    /// IPv4 endpoint port
    #[arg(long = "ipv4_port", default_value_t = 5201)]
    pub ipv4_port: u16,

    /// IPv6 endpoint address (listen side and forward target)
    #[arg(long = "ipv6_addr", default_value = "2001:db8::2")]
    pub ipv6_addr: Ipv6Addr,

    /// IPv6 endpoint port
    #[arg(long = "ipv6_port", default_value_t = 5201)]
    pub ipv6_port: u16,

    /// share of each datagram to keep
    #[arg(long = "reserve_rate", default_value_t = 0.5)]
    pub reserve_rate: f64,

    /// share of each datagram to append as filler
    #[arg(long = "new_rate", default_value_t = 0.2)]
    pub new_rate: f64,

    /// filler content appended by the handler
    #[arg(long = "new_content", default_value = "-uestc-")]
    pub new_content: String,

    /// print version
    #[arg(short = 'v', long)]
    version: bool,
}

impl Config {
    /// Parse the command line. Prints the version string and leaves
    /// early when `-v` is given.
    pub fn load() -> Self {
        let config = Self::parse();
        if config.version {
            println!("flowgen-relay: {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        config
    }
}
