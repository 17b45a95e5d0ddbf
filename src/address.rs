//! Address space enumeration and DNS resolver plumbing.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use cidr_utils::cidr::{IpCidr, IpInet};
use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use tokio::{fs, io, time};

use crate::error::Error;

/// A parsed CIDR block.
///
/// Iterating yields every address of the masked range in ascending order,
/// network and broadcast addresses included. The block can be iterated any
/// number of times.
///
/// ```rust
/// # use netprobe::address::Subnet;
/// let subnet = Subnet::parse("192.168.0.5/30").unwrap();
/// let ips: Vec<_> = subnet.iter().map(|ip| ip.to_string()).collect();
/// assert_eq!(ips, ["192.168.0.4", "192.168.0.5", "192.168.0.6", "192.168.0.7"]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    cidr: IpCidr,
}

impl Subnet {
    /// Parses `a.b.c.d/len` (or an IPv6 block). Host bits are masked off, and
    /// a bare address is treated as a single-address block.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let input = input.trim();
        let cidr = match IpCidr::from_str(input) {
            Ok(cidr) => cidr,
            Err(_) => IpInet::from_str(input)
                .map(|inet| inet.network())
                .map_err(|e| Error::InvalidSubnet {
                    subnet: input.to_owned(),
                    reason: e.to_string(),
                })?,
        };

        Ok(Self { cidr })
    }

    pub fn iter(&self) -> impl Iterator<Item = IpAddr> {
        self.cidr.iter().map(|inet| inet.address())
    }

    pub const fn cidr(&self) -> IpCidr {
        self.cidr
    }
}

impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.cidr, f)
    }
}

impl IntoIterator for Subnet {
    type Item = IpAddr;
    type IntoIter = Box<dyn Iterator<Item = IpAddr> + Send>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.cidr.iter().map(|inet| inet.address()))
    }
}

/// Derive a DNS resolver.
///
/// 1. if the `resolver` parameter has been set:
///     1. assume the parameter is a path and attempt to read IPs.
///     2. parse the input as a comma-separated list of IPs.
/// 2. if `resolver` is not set:
///    1. attempt to derive a resolver from the system config. (e.g.
///       `/etc/resolv.conf` on *nix).
///    2. finally, build a CloudFlare-based resolver.
pub async fn get_resolver(resolver: Option<&str>) -> TokioAsyncResolver {
    match resolver {
        Some(r) => {
            let mut config = ResolverConfig::new();
            let resolver_ips = match read_resolver_from_file(r).await {
                Ok(ips) => ips,
                Err(_) => r
                    .split(',')
                    .filter_map(|r| IpAddr::from_str(r.trim()).ok())
                    .collect::<Vec<_>>(),
            };
            for ip in resolver_ips {
                config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(ip, 53),
                    Protocol::Udp,
                ));
            }
            TokioAsyncResolver::tokio(config, ResolverOpts::default())
        }
        None => TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare_tls(), ResolverOpts::default())
        }),
    }
}

/// Parses an input file of IPs for use in DNS resolution.
async fn read_resolver_from_file(path: &str) -> io::Result<Vec<IpAddr>> {
    let ips = fs::read_to_string(path)
        .await?
        .lines()
        .filter_map(|line| IpAddr::from_str(line.trim()).ok())
        .collect();

    Ok(ips)
}

/// Best-effort PTR lookup. Any failure, including running out of `timeout`,
/// yields `None`.
pub async fn reverse_lookup(
    resolver: &TokioAsyncResolver,
    ip: IpAddr,
    timeout: Duration,
) -> Option<String> {
    let lookup = time::timeout(timeout, resolver.reverse_lookup(ip))
        .await
        .ok()?
        .ok()?;

    lookup
        .iter()
        .map(|name| name.to_string().trim_end_matches('.').to_owned())
        .find(|name| !name.is_empty())
}
