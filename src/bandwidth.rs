//! Link throughput measurement against a TCP peer.
//!
//! A test runs three phases back to back, never in parallel:
//!
//! 1. **latency**: time to open (and drop) a fresh connection,
//! 2. **download**: read from a new connection for `test_duration`,
//! 3. **upload**: write to a new connection for `test_duration`.
//!
//! Every single read or write is bounded by `io_timeout`, so a stalled peer
//! fails the phase even when the phase budget is not spent yet. The first
//! failing phase stops the test; what was measured before it is kept.
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_derive::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Partial, Phase};
use crate::logger::Logger;
use crate::report;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_TEST_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_PROTOCOL: &str = "tcp";
/// Bound on a single read or write.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Options of a throughput test. Zero or empty values fall back to the
/// defaults above.
#[derive(Debug, Clone, Default)]
pub struct ThroughputOptions {
    /// Connect timeout, per phase.
    pub timeout: Duration,
    pub buffer_size: usize,
    /// Wall-clock budget of the download and of the upload phase.
    pub test_duration: Duration,
    pub protocol: String,
    pub io_timeout: Duration,
}

impl ThroughputOptions {
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.buffer_size == 0 {
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.test_duration.is_zero() {
            self.test_duration = DEFAULT_TEST_DURATION;
        }
        if self.protocol.is_empty() {
            DEFAULT_PROTOCOL.clone_into(&mut self.protocol);
        }
        if self.io_timeout.is_zero() {
            self.io_timeout = DEFAULT_IO_TIMEOUT;
        }
        self
    }
}

/// Outcome of a throughput test. Speeds are in megabits per second.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThroughputResult {
    pub upload_speed: f64,
    pub download_speed: f64,
    #[serde(rename = "latency_ms", serialize_with = "report::serialize_millis")]
    pub latency: Duration,
    /// Rendered error of the phase that stopped the test.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Tester {
    options: ThroughputOptions,
    logger: Arc<dyn Logger>,
}

impl Tester {
    pub fn new(options: ThroughputOptions, logger: Arc<dyn Logger>) -> Self {
        Self {
            options: options.with_defaults(),
            logger,
        }
    }

    /// Runs latency, download and upload against `host:port`.
    ///
    /// On failure the [`Partial`] holds the result filled up to the failing
    /// phase, with `error` set, next to the phase-wrapped error.
    pub async fn test(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<ThroughputResult, Partial<ThroughputResult>> {
        let logger = self.logger.with_fields(&[("host", &host), ("port", &port)]);
        let mut result = ThroughputResult::default();

        if !self.options.protocol.eq_ignore_ascii_case("tcp") {
            let error = Error::UnsupportedProtocol(self.options.protocol.clone());
            return Err(fail(result, error, &*logger));
        }

        logger.info(
            "Starting throughput test",
            &[
                ("duration_ms", &self.options.test_duration.as_millis()),
                ("buffer_size", &self.options.buffer_size),
            ],
        );

        match self.measure_latency(host, port, cancel).await {
            Ok(latency) => result.latency = latency,
            Err(e) => return Err(fail(result, e.in_phase(Phase::Latency), &*logger)),
        }

        match self.download(host, port, cancel).await {
            Ok(speed) => result.download_speed = speed,
            Err(e) => return Err(fail(result, e.in_phase(Phase::Download), &*logger)),
        }

        match self.upload(host, port, cancel).await {
            Ok(speed) => result.upload_speed = speed,
            Err(e) => return Err(fail(result, e.in_phase(Phase::Upload), &*logger)),
        }

        logger.info(
            "Throughput test finished",
            &[
                ("latency_ms", &result.latency.as_millis()),
                ("download_mbps", &result.download_speed),
                ("upload_mbps", &result.upload_speed),
            ],
        );
        Ok(result)
    }

    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, Error> {
        match time::timeout(self.options.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(Error::Connect {
                addr: format!("{host}:{port}"),
                source,
            }),
            Err(_) => Err(Error::Timeout {
                operation: "connect",
                timeout: self.options.timeout,
            }),
        }
    }

    async fn measure_latency(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<Duration, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let start = Instant::now();
        let stream = self.connect(host, port).await?;
        let latency = start.elapsed();
        drop(stream);

        Ok(latency)
    }

    async fn download(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<f64, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut stream = self.connect(host, port).await?;
        let mut buffer = vec![0u8; self.options.buffer_size];
        let mut total_bytes: u64 = 0;
        let start = Instant::now();

        while start.elapsed() < self.options.test_duration {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match time::timeout(self.options.io_timeout, stream.read(&mut buffer)).await {
                // End of stream.
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => total_bytes += n as u64,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(Error::Timeout {
                        operation: "download read",
                        timeout: self.options.io_timeout,
                    })
                }
            }
        }

        Ok(megabits_per_second(total_bytes, start.elapsed()))
    }

    async fn upload(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<f64, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut stream = self.connect(host, port).await?;
        let buffer = test_pattern(self.options.buffer_size);
        let mut total_bytes: u64 = 0;
        let start = Instant::now();

        while start.elapsed() < self.options.test_duration {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match time::timeout(self.options.io_timeout, stream.write(&buffer)).await {
                Ok(Ok(0)) => return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into()),
                Ok(Ok(n)) => total_bytes += n as u64,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(Error::Timeout {
                        operation: "upload write",
                        timeout: self.options.io_timeout,
                    })
                }
            }
        }

        Ok(megabits_per_second(total_bytes, start.elapsed()))
    }
}

fn fail(
    mut result: ThroughputResult,
    error: Error,
    logger: &dyn Logger,
) -> Partial<ThroughputResult> {
    logger.error("Throughput test failed", &[("error", &error)]);
    result.error = Some(error.to_string());
    Partial::new(result, error)
}

/// Upload payload: byte `i` is `i % 256`.
fn test_pattern(len: usize) -> Vec<u8> {
    (0..=u8::MAX).cycle().take(len).collect()
}

/// An elapsed time of zero counts as one second.
#[allow(clippy::cast_precision_loss)]
fn megabits_per_second(bytes: u64, elapsed: Duration) -> f64 {
    let mut secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        secs = 1.0;
    }
    (bytes * 8) as f64 / (1_000_000.0 * secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NullLogger;
    use tokio::net::TcpListener;

    fn tester(options: ThroughputOptions) -> Tester {
        Tester::new(options, Arc::new(NullLogger))
    }

    #[test]
    fn zero_options_take_defaults() {
        let options = ThroughputOptions::default().with_defaults();
        assert_eq!(options.timeout, DEFAULT_TIMEOUT);
        assert_eq!(options.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(options.test_duration, DEFAULT_TEST_DURATION);
        assert_eq!(options.protocol, "tcp");
        assert_eq!(options.io_timeout, DEFAULT_IO_TIMEOUT);
    }

    #[test]
    fn pattern_wraps_every_256_bytes() {
        let pattern = test_pattern(600);
        assert_eq!(pattern.len(), 600);
        assert_eq!(pattern[0], 0);
        assert_eq!(pattern[255], 255);
        assert_eq!(pattern[256], 0);
        assert_eq!(pattern[599], (599 % 256) as u8);
    }

    #[test]
    fn mbps_formula() {
        let speed = megabits_per_second(1_250_000, Duration::from_secs(2));
        assert!((speed - 5.0).abs() < f64::EPSILON);
        // Zero elapsed is floored to one second.
        let floored = megabits_per_second(125_000, Duration::ZERO);
        assert!((floored - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unsupported_protocol_is_rejected_before_io() {
        let err = tester(ThroughputOptions {
            protocol: "udp".to_owned(),
            ..ThroughputOptions::default()
        })
        .test("127.0.0.1", 9, &CancellationToken::new())
        .await
        .unwrap_err();

        assert!(matches!(err.error, Error::UnsupportedProtocol(_)));
        assert_eq!(err.partial.latency, Duration::ZERO);
    }

    #[tokio::test]
    async fn closed_port_fails_latency_phase() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = tester(ThroughputOptions {
            timeout: Duration::from_secs(1),
            ..ThroughputOptions::default()
        })
        .test("127.0.0.1", port, &CancellationToken::new())
        .await
        .unwrap_err();

        assert!(matches!(
            err.error,
            Error::Phase {
                phase: Phase::Latency,
                ..
            }
        ));
        let message = err.partial.error.as_deref().unwrap();
        assert!(message.starts_with("latency test failed"), "{message}");
        assert_eq!(err.partial.download_speed, 0.0);
    }

    #[tokio::test]
    async fn stalled_peer_times_out_download() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accept and hold connections without ever writing.
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let err = tester(ThroughputOptions {
            timeout: Duration::from_secs(1),
            test_duration: Duration::from_secs(5),
            io_timeout: Duration::from_millis(200),
            ..ThroughputOptions::default()
        })
        .test("127.0.0.1", port, &CancellationToken::new())
        .await
        .unwrap_err();

        assert!(err.error.is_timeout());
        assert!(matches!(
            err.error,
            Error::Phase {
                phase: Phase::Download,
                ..
            }
        ));
        assert!(err.partial.latency > Duration::ZERO);
        assert_eq!(
            err.partial.error.as_deref(),
            Some("download test failed: download read operation timed out after 200ms")
        );
    }

    #[tokio::test]
    async fn download_ends_early_at_end_of_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(&[7u8; 4096]).await;
                // Dropping the socket closes the stream.
            }
        });

        let started = Instant::now();
        let speed = tester(ThroughputOptions {
            timeout: Duration::from_secs(1),
            test_duration: Duration::from_secs(10),
            io_timeout: Duration::from_secs(2),
            ..ThroughputOptions::default()
        })
        .download("127.0.0.1", port, &CancellationToken::new())
        .await
        .unwrap();

        assert!(speed > 0.0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancelled_before_start_skips_every_phase() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = tester(ThroughputOptions::default())
            .test("127.0.0.1", 9, &cancel)
            .await
            .unwrap_err();

        assert!(err.error.is_cancelled());
        assert_eq!(err.partial.latency, Duration::ZERO);
    }
}
