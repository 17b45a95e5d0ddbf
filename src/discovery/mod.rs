//! Subnet host discovery.
//!
//! Every address of a CIDR block is checked through an injected
//! [`ReachabilityProbe`]; addresses that answer get a best-effort reverse DNS
//! lookup. Unreachable addresses simply do not appear in the result.
mod interfaces;
mod reachability;

pub use interfaces::InterfaceInfo;
pub use reachability::{ReachabilityProbe, SystemPing};

use std::{net::IpAddr, sync::Arc, time::Duration};

use serde_derive::Serialize;
use tokio_util::sync::CancellationToken;

use crate::address::{self, Subnet};
use crate::error::{Error, Partial};
use crate::logger::Logger;
use crate::pool::WorkerPool;

/// Reachability and reverse lookup timeout used when none is given.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
/// Addresses in flight when no cap is given.
pub const DEFAULT_CONCURRENT: usize = 10;

/// Options of a discovery run. Zero values fall back to the defaults above.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    pub timeout: Duration,
    pub concurrent: usize,
    /// DNS servers for reverse lookups: a comma separated list of IPs, or a
    /// file with one IP per line. The system configuration when unset.
    pub resolver: Option<String>,
}

impl DiscoveryOptions {
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.concurrent == 0 {
            self.concurrent = DEFAULT_CONCURRENT;
        }
        self
    }
}

/// A host that answered the reachability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostResult {
    pub ip: String,
    /// Empty when the reverse lookup failed.
    pub hostname: String,
}

pub struct Discoverer {
    options: DiscoveryOptions,
    pool: WorkerPool,
    probe: Arc<dyn ReachabilityProbe>,
    logger: Arc<dyn Logger>,
}

impl Discoverer {
    pub fn new(
        options: DiscoveryOptions,
        probe: Arc<dyn ReachabilityProbe>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let options = options.with_defaults();
        Self {
            pool: WorkerPool::new(options.concurrent),
            options,
            probe,
            logger,
        }
    }

    /// Discoverer backed by the system `ping` utility.
    pub fn with_system_ping(options: DiscoveryOptions, logger: Arc<dyn Logger>) -> Self {
        let ping = SystemPing::new(Arc::clone(&logger));
        Self::new(options, Arc::new(ping), logger)
    }

    /// Probes every address of `subnet`, network and broadcast included.
    ///
    /// The order of the returned hosts is not significant. Cancellation is
    /// checked before each address is dispatched; the hosts found up to that
    /// point come back in the [`Partial`].
    pub async fn discover(
        &self,
        subnet: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<HostResult>, Partial<Vec<HostResult>>> {
        let parsed = Subnet::parse(subnet)?;
        let logger = self.logger.with_fields(&[("subnet", &parsed)]);
        logger.info(
            "Starting host discovery",
            &[("concurrent", &self.pool.concurrency())],
        );

        let resolver = address::get_resolver(self.options.resolver.as_deref()).await;
        let timeout = self.options.timeout;

        let done = self
            .pool
            .run(parsed, cancel, |ip| {
                let probe = Arc::clone(&self.probe);
                let resolver = resolver.clone();
                async move {
                    if !probe.is_reachable(ip, timeout).await {
                        return None;
                    }
                    let hostname = address::reverse_lookup(&resolver, ip, timeout)
                        .await
                        .unwrap_or_default();
                    Some(host_result(ip, hostname))
                }
            })
            .await;

        let hosts: Vec<HostResult> = done.outputs.into_iter().flatten().collect();

        if done.cancelled {
            logger.warn("Host discovery cancelled", &[("count", &hosts.len())]);
            return Err(Partial::new(hosts, Error::Cancelled));
        }

        logger.info("Discovered hosts", &[("count", &hosts.len())]);
        Ok(hosts)
    }

    /// Local network interfaces with their addresses.
    pub fn interfaces(&self) -> Vec<InterfaceInfo> {
        let found = interfaces::list();
        self.logger
            .info("Discovered network interfaces", &[("count", &found.len())]);
        found
    }
}

fn host_result(ip: IpAddr, hostname: String) -> HostResult {
    HostResult {
        ip: ip.to_string(),
        hostname,
    }
}
