//! Core functionality for TCP port scanning.
use crate::error::{Error, Partial};
use crate::logger::Logger;
use crate::pool::WorkerPool;
use crate::service;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use serde_derive::Serialize;
use tokio::{
    io::{self, AsyncWriteExt},
    net::TcpStream,
    time,
};
use tokio_util::sync::CancellationToken;

/// Connect timeout used when none is given.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
/// Ports in flight per host when no cap is given.
pub const DEFAULT_CONCURRENT: usize = 100;

/// Options of a port scan. Zero values fall back to the defaults above.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub timeout: Duration,
    pub concurrent: usize,
    pub detect_service: bool,
}

impl ScanOptions {
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

/// State of one probed port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortResult {
    pub number: u16,
    pub open: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service: String,
}

/// All probed ports of one host, ascending by port number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub host: String,
    pub ports: Vec<PortResult>,
}

#[derive(Debug)]
struct ScannerConnector {
    timeout: Duration,
    detect_service: bool,
}

impl ScannerConnector {
    /// Probes a single port once. A failed connect only means the port is
    /// closed; it never fails the scan.
    async fn scan_port(&self, host: &str, port: u16) -> PortResult {
        let mut result = PortResult {
            number: port,
            open: false,
            service: String::new(),
        };

        if let Ok(mut tcp_stream) = self.connect(host, port).await {
            // The port answered; a failed shutdown does not change that.
            let _ = tcp_stream.shutdown().await;
            result.open = true;
            if self.detect_service {
                result.service = service::classify(port).to_owned();
            }
        }

        result
    }

    /// Performs the connection to the socket with timeout.
    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        time::timeout(self.timeout, TcpStream::connect((host, port))).await?
    }
}

/// Scans hosts sequentially, and the ports of each host in parallel.
pub struct Scanner {
    pool: WorkerPool,
    connector: Arc<ScannerConnector>,
    logger: Arc<dyn Logger>,
}

impl Scanner {
    pub fn new(options: ScanOptions, logger: Arc<dyn Logger>) -> Self {
        let options = options.with_defaults();
        Self {
            pool: WorkerPool::new(options.concurrent),
            connector: Arc::new(ScannerConnector {
                timeout: options.timeout,
                detect_service: options.detect_service,
            }),
            logger,
        }
    }

    /// Scans every port of every host.
    ///
    /// Returns one [`ScanResult`] per host in input order. Each result lists
    /// every distinct requested port exactly once, sorted ascending, however
    /// the probes happened to complete.
    ///
    /// Cancellation is checked before each host. A host interrupted halfway
    /// is dropped and the hosts finished so far come back in the [`Partial`].
    pub async fn scan(
        &self,
        hosts: &[String],
        ports: &[u16],
        cancel: &CancellationToken,
    ) -> Result<Vec<ScanResult>, Partial<Vec<ScanResult>>> {
        if hosts.is_empty() {
            return Err(Error::NoHosts.into());
        }
        if ports.is_empty() {
            return Err(Error::NoPorts.into());
        }
        let ports: Vec<u16> = ports
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        self.logger.info(
            "Starting port scan",
            &[
                ("hosts", &hosts.len()),
                ("ports", &ports.len()),
                ("concurrent", &self.pool.concurrency()),
            ],
        );

        let mut results = Vec::with_capacity(hosts.len());
        for host in hosts {
            if cancel.is_cancelled() {
                return Err(self.cancelled(results));
            }

            match self.scan_host(host, &ports, cancel).await {
                Some(result) => results.push(result),
                None => return Err(self.cancelled(results)),
            }
        }

        self.logger
            .info("Port scan finished", &[("hosts", &results.len())]);
        Ok(results)
    }

    /// `None` when cancellation cut the fan-out short.
    async fn scan_host(
        &self,
        host: &str,
        ports: &[u16],
        cancel: &CancellationToken,
    ) -> Option<ScanResult> {
        let host_arc: Arc<str> = Arc::from(host);
        let done = self
            .pool
            .run(ports.iter().copied(), cancel, |port| {
                let connector = Arc::clone(&self.connector);
                let host = Arc::clone(&host_arc);
                async move { connector.scan_port(&host, port).await }
            })
            .await;

        if done.cancelled {
            return None;
        }

        let by_port: BTreeMap<u16, PortResult> = done
            .outputs
            .into_iter()
            .map(|result| (result.number, result))
            .collect();

        let open = by_port.values().filter(|p| p.open).count();
        self.logger
            .debug("Host scanned", &[("host", &host), ("open", &open)]);

        Some(ScanResult {
            host: host.to_owned(),
            ports: by_port.into_values().collect(),
        })
    }

    fn cancelled(&self, results: Vec<ScanResult>) -> Partial<Vec<ScanResult>> {
        self.logger
            .warn("Port scan cancelled", &[("completed_hosts", &results.len())]);
        Partial::new(results, Error::Cancelled)
    }
}
