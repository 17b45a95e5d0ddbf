//! Reachability checks used by host discovery.
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::{process::Command, time};

use crate::logger::Logger;

/// Single echo-style check against one address.
///
/// Implementations must give up after `timeout` and report `false`, never an
/// error: an unreachable address is an ordinary outcome of discovery.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self, addr: IpAddr, timeout: Duration) -> bool;
}

/// Shells out to the operating system's `ping` utility, one echo request.
pub struct SystemPing {
    logger: Arc<dyn Logger>,
}

impl SystemPing {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self { logger }
    }

    /// Arguments for one echo request on `os` (as in [`std::env::consts::OS`]).
    fn args(os: &str, addr: IpAddr, timeout: Duration) -> Vec<String> {
        let millis = timeout.as_millis().max(1);
        let (count, wait, wait_value) = match os {
            "windows" => ("-n", "-w", millis.to_string()),
            // BSD ping takes its wait in milliseconds.
            "macos" => ("-c", "-W", millis.to_string()),
            _ => {
                // iputils only takes whole seconds.
                let secs = timeout.as_secs_f64().ceil().max(1.0);
                ("-c", "-W", format!("{secs:.0}"))
            }
        };

        vec![
            count.to_owned(),
            "1".to_owned(),
            wait.to_owned(),
            wait_value,
            addr.to_string(),
        ]
    }
}

#[async_trait]
impl ReachabilityProbe for SystemPing {
    async fn is_reachable(&self, addr: IpAddr, timeout: Duration) -> bool {
        let mut command = Command::new("ping");
        command
            .args(Self::args(std::env::consts::OS, addr, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // ping rounds its own timeout up; allow it one extra second.
        match time::timeout(timeout + Duration::from_secs(1), command.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                self.logger
                    .warn("Ping could not run", &[("ip", &addr), ("error", &e)]);
                false
            }
            Err(_) => false,
        }
    }
}
