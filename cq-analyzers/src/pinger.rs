use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use cq_messages::types::reports::PingReport;
use cq_messages::types::Task;
use cq_messages::types::TaskKind;
use cq_messages::types::TaskResult;
use surge_ping::Client;
use surge_ping::Config;
use surge_ping::PingIdentifier;
use surge_ping::PingSequence;
use surge_ping::ICMP;
use tokio::task::JoinSet;
use tracing::debug;

use crate::analyzer::failure_result;
use crate::analyzer::Analyzer;

const PACKET_COUNT: u16 = 100;
const SEND_INTERVAL: Duration = Duration::from_millis(100);
const RUN_TIMEOUT: Duration = Duration::from_secs(11);
const PACKET_TIMEOUT: Duration = Duration::from_secs(2);
const PAYLOAD: [u8; 56] = [0; 56];

/// Handles `ping` tasks: the payload is a host name or address, the
/// report carries packet and round-trip-time statistics.
pub struct PingAnalyzer;

impl PingAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PingAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Analyzer for PingAnalyzer {
    fn kind(&self) -> TaskKind {
        TaskKind::Ping
    }

    async fn analyze(&self, task: &Task) -> anyhow::Result<TaskResult> {
        let host: String = match task.payload_as() {
            Ok(host) => host,
            Err(err) => {
                return Ok(failure_result(task, "failed to decode task payload", &err));
            },
        };

        let addr = match resolve(&host).await {
            Ok(addr) => addr,
            Err(err) => return Ok(failure_result(task, "failed to resolve host", &err)),
        };

        debug!("Pinging host. task_id: {} host: {} addr: {}", task.id, host, addr);

        let report = match ping_host(addr).await {
            Ok(report) => report,
            Err(err) => return Ok(failure_result(task, "failed to ping", &err)),
        };

        TaskResult::success(&task.id, &report)
    }
}

async fn resolve(host: &str) -> anyhow::Result<IpAddr> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr);
    }
    let mut addrs = tokio::net::lookup_host((host, 0u16))
        .await
        .context("resolve host")?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| anyhow::anyhow!("no address found for {host}"))
}

/// Sends [`PACKET_COUNT`] echoes at [`SEND_INTERVAL`] spacing. Replies
/// are awaited concurrently so a slow or lossy host does not stretch the
/// spacing; the whole run is bounded by [`RUN_TIMEOUT`].
async fn ping_host(addr: IpAddr) -> anyhow::Result<PingReport> {
    let config = match addr {
        IpAddr::V4(_) => Config::default(),
        IpAddr::V6(_) => Config::builder().kind(ICMP::V6).build(),
    };
    let client = Client::new(&config).context("create ICMP client")?;

    let deadline = tokio::time::Instant::now() + RUN_TIMEOUT;
    let mut interval = tokio::time::interval(SEND_INTERVAL);
    let mut echoes = JoinSet::new();
    let mut packets_sent = 0u64;

    for sequence in 0..PACKET_COUNT {
        interval.tick().await;
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        packets_sent += 1;
        let client = client.clone();
        echoes.spawn(async move {
            let mut pinger = client.pinger(addr, PingIdentifier(rand::random())).await;
            pinger.timeout(PACKET_TIMEOUT);
            pinger
                .ping(PingSequence(sequence), &PAYLOAD)
                .await
                .map(|(_, rtt)| rtt)
                .ok()
        });
    }

    let mut rtts = Vec::new();
    while let Ok(Some(echo)) = tokio::time::timeout_at(deadline, echoes.join_next()).await {
        if let Ok(Some(rtt)) = echo {
            rtts.push(rtt);
        }
    }
    echoes.abort_all();

    Ok(report_from_rtts(packets_sent, &rtts))
}

fn report_from_rtts(packets_sent: u64, rtts: &[Duration]) -> PingReport {
    let mut report = PingReport {
        packets_sent,
        packets_received: rtts.len() as u64,
        ..Default::default()
    };
    if rtts.is_empty() {
        return report;
    }

    let nanos: Vec<u64> = rtts.iter().map(|rtt| rtt.as_nanos() as u64).collect();
    report.min_rtt = nanos.iter().copied().min().unwrap_or_default();
    report.max_rtt = nanos.iter().copied().max().unwrap_or_default();

    let avg = nanos.iter().sum::<u64>() as f64 / nanos.len() as f64;
    report.avg_rtt = avg as u64;

    // Population standard deviation, matching common ping utilities.
    let variance = nanos
        .iter()
        .map(|&rtt| (rtt as f64 - avg).powi(2))
        .sum::<f64>()
        / nanos.len() as f64;
    report.std_dev_rtt = variance.sqrt() as u64;

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_from_no_replies_is_all_zero_but_sent() {
        let report = report_from_rtts(100, &[]);
        assert_eq!(report.packets_sent, 100);
        assert_eq!(report.packets_received, 0);
        assert_eq!(report.min_rtt, 0);
        assert_eq!(report.avg_rtt, 0);
    }

    #[test]
    fn report_statistics() {
        let rtts = [
            Duration::from_millis(1),
            Duration::from_millis(3),
            Duration::from_millis(2),
        ];
        let report = report_from_rtts(3, &rtts);
        assert_eq!(report.packets_received, 3);
        assert_eq!(report.min_rtt, 1_000_000);
        assert_eq!(report.max_rtt, 3_000_000);
        assert_eq!(report.avg_rtt, 2_000_000);
        // sqrt(((1-2)^2 + (3-2)^2 + (2-2)^2) / 3) ms
        assert_eq!(report.std_dev_rtt, 816_496);
    }

    #[tokio::test]
    async fn ping_analyzer_reports_bad_payload_as_failed_result() {
        let task = Task {
            id: "t1".to_owned(),
            kind: TaskKind::Ping,
            geo_location: "eu".to_owned(),
            payload: Some(serde_json::json!({"not": "a host"})),
            result: None,
            payloads: Vec::new(),
            results: Vec::new(),
        };
        let result = PingAnalyzer::new().analyze(&task).await.unwrap();
        assert!(!result.ok);
        assert!(result
            .payload
            .as_str()
            .unwrap()
            .starts_with("failed to decode task payload"));
    }
}
