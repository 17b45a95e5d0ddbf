use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use netprobe::bandwidth::{Tester, ThroughputOptions};
use netprobe::discovery::{Discoverer, DiscoveryOptions, ReachabilityProbe};
use netprobe::error::Phase;
use netprobe::logger::NullLogger;
use netprobe::scanner::{ScanOptions, ScanResult, Scanner};
use netprobe::Error;

fn scanner(concurrent: usize) -> Scanner {
    Scanner::new(
        ScanOptions {
            timeout: Duration::from_millis(500),
            concurrent,
            detect_service: true,
        },
        Arc::new(NullLogger),
    )
}

/// Binds a listener that accepts and drops connections for as long as it lives.
async fn open_port() -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    (port, handle)
}

/// A peer that streams bytes to every connection and discards what it reads.
async fn throughput_peer() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let (mut reader, mut writer) = stream.into_split();
            tokio::spawn(async move {
                let chunk = vec![0x5a_u8; 64 * 1024];
                while writer.write_all(&chunk).await.is_ok() {}
            });
            tokio::spawn(async move {
                let mut sink = vec![0_u8; 64 * 1024];
                while matches!(reader.read(&mut sink).await, Ok(n) if n > 0) {}
            });
        }
    });
    port
}

fn assert_well_formed(results: &[ScanResult], hosts: &[String], ports: &[u16]) {
    let mut distinct: Vec<u16> = ports.to_vec();
    distinct.sort_unstable();
    distinct.dedup();

    assert_eq!(results.len(), hosts.len());
    for (result, host) in results.iter().zip(hosts) {
        assert_eq!(&result.host, host);
        let numbers: Vec<u16> = result.ports.iter().map(|p| p.number).collect();
        assert_eq!(numbers, distinct);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scan_results_are_sorted_and_complete() {
    let (open, _server) = open_port().await;
    let hosts = vec!["127.0.0.1".to_owned(), "localhost".to_owned()];
    let ports = vec![open, 1, open, 2, 3];

    let results = scanner(100)
        .scan(&hosts, &ports, &CancellationToken::new())
        .await
        .unwrap();

    assert_well_formed(&results, &hosts, &ports);
    let first = &results[0];
    assert!(first.ports.iter().any(|p| p.number == open && p.open));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scan_results_do_not_depend_on_concurrency() {
    let (open, _server) = open_port().await;
    let hosts = vec!["127.0.0.1".to_owned()];
    let ports: Vec<u16> = (1..=20).chain([open]).collect();

    let serial = scanner(1)
        .scan(&hosts, &ports, &CancellationToken::new())
        .await
        .unwrap();
    let parallel = scanner(100)
        .scan(&hosts, &ports, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(serial, parallel);
}

#[tokio::test]
async fn scan_cancelled_before_start_returns_nothing() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = scanner(10)
        .scan(&["127.0.0.1".to_owned()], &[80], &cancel)
        .await
        .unwrap_err();

    assert!(err.error.is_cancelled());
    assert!(err.partial.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scan_cancelled_mid_run_keeps_completed_hosts() {
    let cancel = CancellationToken::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        // The first connection cancels the scan; later ones are refused.
        if let Ok((stream, _)) = listener.accept().await {
            trigger.cancel();
            drop(stream);
        }
    });
    let hosts: Vec<String> = (0..200).map(|_| "127.0.0.1".to_owned()).collect();

    let err = scanner(10).scan(&hosts, &[port], &cancel).await.unwrap_err();

    assert!(err.error.is_cancelled());
    assert!(!err.partial.is_empty());
    assert!(err.partial.len() < hosts.len());
    // The first host was fully dispatched before anything could cancel.
    assert!(err.partial[0].ports[0].open);
    for result in &err.partial {
        assert_eq!(result.ports.len(), 1);
    }
}

#[tokio::test]
async fn scan_with_empty_input_is_input_error() {
    let err = scanner(10)
        .scan(&[], &[], &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.error.is_input());
}

struct Silent;

#[async_trait]
impl ReachabilityProbe for Silent {
    async fn is_reachable(&self, _addr: IpAddr, _timeout: Duration) -> bool {
        false
    }
}

struct Only(HashSet<IpAddr>);

#[async_trait]
impl ReachabilityProbe for Only {
    async fn is_reachable(&self, addr: IpAddr, _timeout: Duration) -> bool {
        self.0.contains(&addr)
    }
}

/// Answers for one address and cancels the sweep when it reaches another.
struct CancelAt {
    reachable: IpAddr,
    trigger: IpAddr,
    cancel: CancellationToken,
}

#[async_trait]
impl ReachabilityProbe for CancelAt {
    async fn is_reachable(&self, addr: IpAddr, _timeout: Duration) -> bool {
        if addr == self.trigger {
            self.cancel.cancel();
        }
        addr == self.reachable
    }
}

fn discovery_options() -> DiscoveryOptions {
    DiscoveryOptions {
        timeout: Duration::from_millis(200),
        concurrent: 8,
        resolver: Some("127.0.0.1".to_owned()),
    }
}

#[tokio::test]
async fn discovery_of_silent_subnet_is_empty() {
    let discoverer = Discoverer::new(discovery_options(), Arc::new(Silent), Arc::new(NullLogger));

    let hosts = discoverer
        .discover("203.0.113.0/31", &CancellationToken::new())
        .await
        .unwrap();

    assert!(hosts.is_empty());
}

#[tokio::test]
async fn discovery_reports_each_reachable_host_once() {
    let reachable: HashSet<IpAddr> = ["192.0.2.1", "192.0.2.6"]
        .iter()
        .map(|ip| ip.parse().unwrap())
        .collect();
    let discoverer = Discoverer::new(
        discovery_options(),
        Arc::new(Only(reachable.clone())),
        Arc::new(NullLogger),
    );

    let hosts = discoverer
        .discover("192.0.2.0/29", &CancellationToken::new())
        .await
        .unwrap();

    let found: HashSet<IpAddr> = hosts.iter().map(|h| h.ip.parse().unwrap()).collect();
    assert_eq!(hosts.len(), 2);
    assert_eq!(found, reachable);
}

#[tokio::test]
async fn discovery_cancelled_mid_run_keeps_hosts_found() {
    let cancel = CancellationToken::new();
    let probe = CancelAt {
        reachable: "10.0.0.1".parse().unwrap(),
        trigger: "10.0.0.3".parse().unwrap(),
        cancel: cancel.clone(),
    };
    let discoverer = Discoverer::new(
        DiscoveryOptions {
            concurrent: 1,
            ..discovery_options()
        },
        Arc::new(probe),
        Arc::new(NullLogger),
    );

    let err = discoverer.discover("10.0.0.0/24", &cancel).await.unwrap_err();

    assert!(err.error.is_cancelled());
    let ips: Vec<&str> = err.partial.iter().map(|h| h.ip.as_str()).collect();
    assert_eq!(ips, ["10.0.0.1"]);
}

#[tokio::test]
async fn discovery_rejects_malformed_subnet() {
    let discoverer = Discoverer::new(discovery_options(), Arc::new(Silent), Arc::new(NullLogger));

    let err = discoverer
        .discover("192.0.2.0/40", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err.error, Error::InvalidSubnet { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn throughput_against_loopback_peer() {
    let port = throughput_peer().await;
    let tester = Tester::new(
        ThroughputOptions {
            timeout: Duration::from_secs(2),
            test_duration: Duration::from_secs(1),
            io_timeout: Duration::from_secs(2),
            ..ThroughputOptions::default()
        },
        Arc::new(NullLogger),
    );

    let result = tester
        .test("127.0.0.1", port, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.latency > Duration::ZERO);
    assert!(result.download_speed >= 0.0);
    assert!(result.upload_speed >= 0.0);
    assert!(result.error.is_none());
}

/// A peer that sends 1 MB, closes its sending side and then never reads.
async fn one_way_peer() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if stream.write_all(&vec![0xa5_u8; 1024 * 1024]).await.is_ok() {
                    let _ = stream.shutdown().await;
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(stream);
            });
        }
    });
    port
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_failure_keeps_latency_and_download() {
    let port = one_way_peer().await;
    let tester = Tester::new(
        ThroughputOptions {
            timeout: Duration::from_secs(2),
            test_duration: Duration::from_secs(5),
            io_timeout: Duration::from_millis(300),
            ..ThroughputOptions::default()
        },
        Arc::new(NullLogger),
    );

    let started = Instant::now();
    let err = tester
        .test("127.0.0.1", port, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err.error,
        Error::Phase {
            phase: Phase::Upload,
            ..
        }
    ));
    assert!(err.error.is_timeout());
    assert!(err.partial.latency > Duration::ZERO);
    // Download stopped at end of stream instead of running the full duration.
    assert!(err.partial.download_speed > 0.0);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(err.partial.upload_speed, 0.0);
    assert_eq!(
        err.partial.error.as_deref(),
        Some("upload test failed: upload write operation timed out after 300ms")
    );
}

#[tokio::test]
async fn throughput_cancelled_before_start_has_no_latency() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let tester = Tester::new(ThroughputOptions::default(), Arc::new(NullLogger));

    let err = tester.test("127.0.0.1", 9, &cancel).await.unwrap_err();

    assert!(err.error.root().is_cancelled());
    assert_eq!(err.partial.latency, Duration::ZERO);
    assert!(err.partial.error.is_some());
}
