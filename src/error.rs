//! Error taxonomy shared by every probe.
//!
//! Per-target failures (a closed port, an unreachable address) never show up
//! here: they are folded into the result model. What remains are call-level
//! failures, optionally carried together with whatever partial result the call
//! had already produced (see [`Partial`]).
use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Call-level failure of a probe operation.
#[derive(Debug, Error)]
pub enum Error {
    /// `scan` was called without any host.
    #[error("no hosts provided")]
    NoHosts,

    /// `scan` was called without any port.
    #[error("no ports provided")]
    NoPorts,

    /// The subnet string is not a valid CIDR block.
    #[error("invalid subnet {subnet:?}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },

    /// The throughput tester only speaks TCP.
    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),

    /// Establishing a connection failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A single deadline-bounded operation did not finish in time.
    #[error("{operation} operation timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A throughput phase failed; wraps the underlying cause.
    #[error("{phase} test failed: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<Error>,
    },

    /// Configuration could not be read or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Wraps `self` with the name of the throughput phase it happened in.
    #[must_use]
    pub fn in_phase(self, phase: Phase) -> Self {
        Self::Phase {
            phase,
            source: Box::new(self),
        }
    }

    /// Strips phase wrapping and returns the underlying cause.
    pub fn root(&self) -> &Self {
        match self {
            Self::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the operation stopped because the caller cancelled it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }

    /// True when a per-operation deadline was exceeded.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::Timeout { .. })
    }

    /// True for caller mistakes detected before any work started.
    pub const fn is_input(&self) -> bool {
        matches!(
            self,
            Self::NoHosts | Self::NoPorts | Self::InvalidSubnet { .. } | Self::UnsupportedProtocol(_)
        )
    }
}

/// Phases of a throughput test, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Latency,
    Download,
    Upload,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Latency => "latency",
            Self::Download => "download",
            Self::Upload => "upload",
        })
    }
}

/// An error together with the partial result gathered before it happened.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct Partial<T: fmt::Debug> {
    /// Results gathered before the failure. Empty when nothing ran.
    pub partial: T,
    #[source]
    pub error: Error,
}

impl<T: fmt::Debug> Partial<T> {
    pub const fn new(partial: T, error: Error) -> Self {
        Self { partial, error }
    }

    pub fn into_parts(self) -> (T, Error) {
        (self.partial, self.error)
    }
}

impl<T: fmt::Debug + Default> From<Error> for Partial<T> {
    fn from(error: Error) -> Self {
        Self::new(T::default(), error)
    }
}
