use std::fmt::Debug;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use itertools::Itertools;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use netprobe::address::Subnet;
use netprobe::bandwidth::Tester;
use netprobe::discovery::{Discoverer, DiscoveryOptions};
use netprobe::input::{Command, Config, Opts};
use netprobe::logger::{self, LogLogger, Logger};
use netprobe::report::Reporter;
use netprobe::scanner::Scanner;
use netprobe::{Error, Partial};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut opts = Opts::parse();
    let config = if opts.no_config {
        Config::default()
    } else {
        Config::read(opts.config_path.clone())?
    };
    opts.merge(&config);

    logger::init(
        opts.log_level()?,
        opts.log_format()?,
        opts.log_file.as_deref(),
    )
    .context("setting up logging")?;
    let logger: Arc<dyn Logger> = Arc::new(LogLogger::default());

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone(), Arc::clone(&logger));

    let reporter = Reporter::new(Arc::clone(&logger));
    let (report, failure) = match &opts.command {
        Command::Scan(args) => {
            let hosts = expand_addresses(&args.addresses)?;
            let scanner = Scanner::new(args.options(), Arc::clone(&logger));
            render(&reporter, scanner.scan(&hosts, &args.ports(), &cancel).await)?
        }
        Command::Discover(args) => {
            let discoverer = Discoverer::with_system_ping(args.options(), Arc::clone(&logger));
            render(&reporter, discoverer.discover(&args.subnet, &cancel).await)?
        }
        Command::Bandwidth(args) => {
            let tester = Tester::new(args.options(), Arc::clone(&logger));
            render(&reporter, tester.test(&args.host, args.port, &cancel).await)?
        }
        Command::Interfaces => {
            let discoverer =
                Discoverer::with_system_ping(DiscoveryOptions::default(), Arc::clone(&logger));
            (reporter.to_json(&discoverer.interfaces())?, None)
        }
    };

    write_report(opts.output.as_deref(), &report)?;

    if let Some(error) = failure {
        logger.fatal("Probe did not complete", &[("error", &error)]);
        return Err(error.into());
    }
    Ok(())
}

/// Renders whatever the probe produced. Partial results are still reported;
/// input errors produce no report at all.
fn render<T>(
    reporter: &Reporter,
    outcome: Result<T, Partial<T>>,
) -> anyhow::Result<(Vec<u8>, Option<Error>)>
where
    T: Serialize + Debug,
{
    match outcome {
        Ok(result) => Ok((reporter.to_json(&result)?, None)),
        Err(partial) if partial.error.is_input() => Err(partial.error.into()),
        Err(partial) => {
            let (result, error) = partial.into_parts();
            Ok((reporter.to_json(&result)?, Some(error)))
        }
    }
}

/// Addresses written in CIDR notation stand for every address of the block.
/// Duplicates keep their first position.
fn expand_addresses(addresses: &[String]) -> Result<Vec<String>, Error> {
    let mut hosts = Vec::new();
    for address in addresses.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
        if address.contains('/') {
            hosts.extend(Subnet::parse(address)?.iter().map(|ip| ip.to_string()));
        } else {
            hosts.push(address.to_owned());
        }
    }
    Ok(hosts.into_iter().unique().collect())
}

fn write_report(output: Option<&Path>, report: &[u8]) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            let mut contents = report.to_vec();
            contents.push(b'\n');
            std::fs::write(path, contents)
                .with_context(|| format!("writing report to {}", path.display()))?;
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(report)?;
            stdout.write_all(b"\n")?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn cancel_on_ctrl_c(cancel: CancellationToken, logger: Arc<dyn Logger>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logger.warn("Interrupt received, cancelling", &[]);
            cancel.cancel();
        }
    });
}
