//! Provides a means to read, parse and hold configuration options for probes.
//!
//! Values are layered: command line first, then `NETPROBE_*` environment
//! variables, then the TOML configuration file. Anything still unset is left
//! at zero so each probe applies its own defaults.
use clap::{Args, Parser, Subcommand};
use serde_derive::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::bandwidth::ThroughputOptions;
use crate::discovery::DiscoveryOptions;
use crate::error::Error;
use crate::scanner::ScanOptions;

const LOWEST_PORT_NUMBER: u16 = 1;
const TOP_PORT_NUMBER: u16 = 65535;

/// Ports scanned when neither the command line nor the config names any.
const DEFAULT_SCAN_PORTS: std::ops::RangeInclusive<u16> = 1..=1024;

/// Prefix of environment variables overriding the configuration file.
pub const ENV_PREFIX: &str = "NETPROBE_";

pub type Ports = Vec<u16>;

pub fn parse_ports_and_ranges(input: &str) -> Result<Ports, String> {
    let mut ports = Vec::new();

    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if part.contains('-') {
            let range_ports = parse_port_range(part)?;
            ports.extend(range_ports);
        } else {
            let port = parse_single_port(part)?;
            ports.push(port);
        }
    }

    if ports.is_empty() {
        return Err(String::from("No valid ports or ranges provided"));
    }

    ports.sort_unstable();
    ports.dedup();

    Ok(ports)
}

fn parse_port_range(range_str: &str) -> Result<Vec<u16>, String> {
    let range_parts: Vec<&str> = range_str.split('-').collect();
    if range_parts.len() != 2 {
        return Err(format!(
            "Invalid range format '{range_str}'. Expected 'start-end'. Example: 1-1000.",
        ));
    }

    let start: u16 = range_parts[0].trim().parse().map_err(|_| {
        format!(
            "Invalid start port '{}' in range '{range_str}'",
            range_parts[0]
        )
    })?;
    let end: u16 = range_parts[1].trim().parse().map_err(|_| {
        format!(
            "Invalid end port '{}' in range '{range_str}'",
            range_parts[1]
        )
    })?;

    if start > end {
        return Err(format!(
            "Start port {start} is greater than end port {end} in range '{range_str}'",
        ));
    }

    if start < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Ports in range '{range_str}' must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok((start..=end).collect())
}

fn parse_single_port(port_str: &str) -> Result<u16, String> {
    let port: u16 = port_str
        .parse()
        .map_err(|_| format!("Invalid port number '{port_str}'"))?;

    if port < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Port {port} must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok(port)
}

fn millis(value: Option<u64>) -> Duration {
    value.map_or(Duration::ZERO, Duration::from_millis)
}

/// Fills every listed field still unset on the command line from the config.
macro_rules! merge_optional {
    ($args: ident, $config: ident, $($field: ident),+) => {
        $(
            if $args.$field.is_none() {
                $args.$field = $config.$field.clone();
            }
        )+
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "netprobe",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
)]
/// Network diagnostics: TCP port scanning, subnet host discovery and link
/// throughput measurement. Results are printed as JSON.
pub struct Opts {
    /// Whether to ignore the configuration file or not.
    #[arg(short, long, global = true)]
    pub no_config: bool,

    /// Custom path to config file
    #[arg(short, long, value_parser, global = true)]
    pub config_path: Option<PathBuf>,

    /// Log level: error, warn, info, debug or trace.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log format: text or json.
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Also append log records to this file. Parent directories are created.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Write the JSON report to this file instead of stdout.
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Scan TCP ports on one or more hosts.
    Scan(ScanArgs),
    /// Find reachable hosts in a subnet.
    Discover(DiscoverArgs),
    /// Measure latency, download and upload throughput against a peer.
    Bandwidth(BandwidthArgs),
    /// List local network interfaces.
    Interfaces,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ScanArgs {
    /// A comma-delimited list of CIDRs, IPs, or hosts to be scanned.
    #[arg(short, long, value_delimiter = ',', required = true)]
    pub addresses: Vec<String>,

    /// A list of ports and/or port ranges to be scanned. Examples: 80,443,8080 or 1-1000 or 1-1000,8080
    #[arg(short, long, alias = "range", value_parser = parse_ports_and_ranges)]
    pub ports: Option<Ports>,

    /// The timeout in milliseconds before a port is assumed to be closed.
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// How many ports of a host are probed at the same time.
    #[arg(short = 'b', long)]
    pub max_concurrent: Option<usize>,

    /// Name the service behind open ports from a table of well-known ports.
    #[arg(short = 's', long)]
    pub detect_service: bool,
}

impl ScanArgs {
    fn merge(&mut self, config: &ScanConfig) {
        merge_optional!(self, config, ports, timeout, max_concurrent);
        self.detect_service |= config.detect_service.unwrap_or(false);
    }

    pub fn options(&self) -> ScanOptions {
        ScanOptions {
            timeout: millis(self.timeout),
            concurrent: self.max_concurrent.unwrap_or_default(),
            detect_service: self.detect_service,
        }
    }

    pub fn ports(&self) -> Ports {
        self.ports
            .clone()
            .unwrap_or_else(|| DEFAULT_SCAN_PORTS.collect())
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct DiscoverArgs {
    /// The subnet to sweep, in CIDR notation. Example: 192.168.1.0/24
    pub subnet: String,

    /// The timeout in milliseconds for each reachability check and reverse lookup.
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// How many addresses are probed at the same time.
    #[arg(short = 'b', long)]
    pub max_concurrent: Option<usize>,

    /// A comma-delimited list or file of DNS resolvers used for reverse lookups.
    #[arg(long)]
    pub resolver: Option<String>,
}

impl DiscoverArgs {
    fn merge(&mut self, config: &DiscoveryConfig) {
        merge_optional!(self, config, timeout, max_concurrent, resolver);
    }

    pub fn options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            timeout: millis(self.timeout),
            concurrent: self.max_concurrent.unwrap_or_default(),
            resolver: self.resolver.clone(),
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct BandwidthArgs {
    /// The peer to measure against.
    pub host: String,

    /// The TCP port of the peer.
    #[arg(short, long)]
    pub port: u16,

    /// The connect timeout in milliseconds.
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// How long the download and the upload phase each last, in milliseconds.
    #[arg(short = 'd', long)]
    pub test_duration: Option<u64>,

    /// Size in bytes of the read and write buffer.
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Transport protocol. Only tcp is supported.
    #[arg(long)]
    pub protocol: Option<String>,

    /// Bound in milliseconds on each single read or write.
    #[arg(long)]
    pub io_timeout: Option<u64>,
}

impl BandwidthArgs {
    fn merge(&mut self, config: &BandwidthConfig) {
        merge_optional!(
            self,
            config,
            timeout,
            test_duration,
            buffer_size,
            protocol,
            io_timeout
        );
    }

    pub fn options(&self) -> ThroughputOptions {
        ThroughputOptions {
            timeout: millis(self.timeout),
            buffer_size: self.buffer_size.unwrap_or_default(),
            test_duration: millis(self.test_duration),
            protocol: self.protocol.clone().unwrap_or_default(),
            io_timeout: millis(self.io_timeout),
        }
    }
}

impl Opts {
    /// Merges values found within the user configuration file into the
    /// options of the selected command.
    pub fn merge(&mut self, config: &Config) {
        if self.no_config {
            return;
        }

        match &mut self.command {
            Command::Scan(args) => args.merge(&config.scan),
            Command::Discover(args) => args.merge(&config.discovery),
            Command::Bandwidth(args) => args.merge(&config.bandwidth),
            Command::Interfaces => {}
        }

        if self.log_level.is_none() {
            self.log_level.clone_from(&config.logging.level);
        }
        if self.log_format.is_none() {
            self.log_format.clone_from(&config.logging.format);
        }
        if self.log_file.is_none() {
            self.log_file.clone_from(&config.logging.file);
        }
    }

    pub fn log_level(&self) -> Result<log::LevelFilter, Error> {
        self.log_level.as_deref().map_or(Ok(log::LevelFilter::Info), |level| {
            level
                .parse()
                .map_err(|_| Error::Config(format!("invalid log level: {level}")))
        })
    }

    pub fn log_format(&self) -> Result<crate::logger::LogFormat, Error> {
        self.log_format
            .as_deref()
            .map_or(Ok(crate::logger::LogFormat::Text), |format| {
                format.parse().map_err(Error::Config)
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanConfig {
    pub timeout: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub detect_service: Option<bool>,
    pub ports: Option<Ports>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    pub timeout: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub resolver: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BandwidthConfig {
    pub timeout: Option<u64>,
    pub test_duration: Option<u64>,
    pub buffer_size: Option<usize>,
    pub protocol: Option<String>,
    pub io_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
    pub file: Option<PathBuf>,
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final options of each probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scan: ScanConfig,
    pub discovery: DiscoveryConfig,
    pub bandwidth: BandwidthConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct, then applies `NETPROBE_*` environment overrides.
    ///
    /// A missing file is not an error.
    ///
    /// # Format
    ///
    /// ```toml
    /// [scan]
    /// timeout = 5000        # milliseconds
    /// max_concurrent = 100
    /// detect_service = true
    ///
    /// [discovery]
    /// timeout = 2000
    /// max_concurrent = 10
    ///
    /// [bandwidth]
    /// timeout = 30000
    /// test_duration = 10000
    /// buffer_size = 65536
    /// protocol = "tcp"
    ///
    /// [logging]
    /// level = "info"
    /// format = "json"
    /// file = "/var/log/netprobe/netprobe.log"
    /// ```
    pub fn read(custom_config_path: Option<PathBuf>) -> Result<Self, Error> {
        let mut config = match custom_config_path.or_else(default_config_path) {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, Error> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Overrides file values with `NETPROBE_<SECTION>_<KEY>` variables, e.g.
    /// `NETPROBE_SCAN_TIMEOUT=500`. Unknown variables are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            match name.to_ascii_lowercase().as_str() {
                "scan_timeout" => self.scan.timeout = Some(parse_env(&key, &value)?),
                "scan_max_concurrent" => self.scan.max_concurrent = Some(parse_env(&key, &value)?),
                "scan_detect_service" => self.scan.detect_service = Some(parse_env(&key, &value)?),
                "scan_ports" => {
                    self.scan.ports = Some(
                        parse_ports_and_ranges(&value)
                            .map_err(|e| Error::Config(format!("{key}: {e}")))?,
                    );
                }
                "discovery_timeout" => self.discovery.timeout = Some(parse_env(&key, &value)?),
                "discovery_max_concurrent" => {
                    self.discovery.max_concurrent = Some(parse_env(&key, &value)?);
                }
                "discovery_resolver" => self.discovery.resolver = Some(value),
                "bandwidth_timeout" => self.bandwidth.timeout = Some(parse_env(&key, &value)?),
                "bandwidth_test_duration" => {
                    self.bandwidth.test_duration = Some(parse_env(&key, &value)?);
                }
                "bandwidth_buffer_size" => {
                    self.bandwidth.buffer_size = Some(parse_env(&key, &value)?);
                }
                "bandwidth_protocol" => self.bandwidth.protocol = Some(value),
                "bandwidth_io_timeout" => {
                    self.bandwidth.io_timeout = Some(parse_env(&key, &value)?);
                }
                "logging_level" | "log_level" => self.logging.level = Some(value),
                "logging_format" | "log_format" => self.logging.format = Some(value),
                "logging_file" | "log_file" => self.logging.file = Some(PathBuf::from(value)),
                _ => {}
            }
        }

        Ok(())
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{key}={value:?}: {e}")))
}

/// Constructs default path to config toml
pub fn default_config_path() -> Option<PathBuf> {
    let mut config_path = dirs::home_dir()?;
    config_path.push(".netprobe.toml");
    Some(config_path)
}
