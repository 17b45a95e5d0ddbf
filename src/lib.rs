//! This crate exposes the probe engine behind the `netprobe` network
//! diagnostics tool.
//!
//! Three probes share one bounded worker pool, one cancellation model and one
//! structured logging capability:
//!
//! - **Port scanning**: TCP connect checks over a list of hosts and ports,
//!   with optional well-known service naming.
//! - **Host discovery**: a reachability sweep of every address in a CIDR
//!   block, followed by best-effort reverse DNS.
//! - **Throughput testing**: latency, then download, then upload against a
//!   peer that streams and sinks bytes.
//!
//! ## Architecture Overview
//!
//! Each probe is built from options (zero values mean "use the default") and
//! an [`Arc<dyn Logger>`](crate::logger::Logger). Work items are handed to a
//! [`WorkerPool`](crate::pool::WorkerPool), which never runs more tasks than
//! its cap and checks the caller's
//! [`CancellationToken`](tokio_util::sync::CancellationToken) before starting
//! each one. Failures of a single target are part of the result; call-level
//! failures come back as an [`Error`], together with the partial result when
//! one exists (see [`Partial`]).
//!
//! ## Basic Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use netprobe::logger::LogLogger;
//! use netprobe::scanner::{ScanOptions, Scanner};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let scanner = Scanner::new(
//!     ScanOptions {
//!         detect_service: true,
//!         ..ScanOptions::default()
//!     },
//!     Arc::new(LogLogger::default()),
//! );
//!
//! let hosts = vec!["127.0.0.1".to_owned()];
//! let results = scanner
//!     .scan(&hosts, &[22, 80, 443], &CancellationToken::new())
//!     .await?;
//!
//! for port in results.iter().flat_map(|r| &r.ports).filter(|p| p.open) {
//!     println!("{} open ({})", port.number, port.service);
//! }
//! # Ok(())
//! # }
//! ```
#![doc(html_root_url = "https://docs.rs/netprobe/0.3.0")]

pub mod address;

pub mod bandwidth;

pub mod discovery;

pub mod error;

pub mod input;

pub mod logger;

pub mod pool;

pub mod report;

pub mod scanner;

pub mod service;

pub use error::{Error, Partial};
