//! Echo transport backed by the system `ping` binary (fallback).

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use super::{probe_all, ProbeOptions, ProbeTransport, TransportError};
use crate::models::ProbeSample;

/// Linux iputils numbers echoes from 1, BSD ping from 0.
const FIRST_SEQUENCE: usize = if cfg!(any(target_os = "macos", target_os = "freebsd")) {
    0
} else {
    1
};

/// Transport that shells out to `ping`.
///
/// Privilege mode is ignored; the binary carries its own capabilities.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandTransport;

#[async_trait]
impl ProbeTransport for CommandTransport {
    async fn probe(
        &self,
        addresses: &BTreeSet<Ipv4Addr>,
        options: &ProbeOptions,
    ) -> Result<HashMap<Ipv4Addr, ProbeSample>, TransportError> {
        probe_all(addresses, options.concurrency, |ip| {
            let options = options.clone();
            async move { run_ping_command(ip, &options).await }
        })
        .await
    }
}

async fn run_ping_command(
    ip: Ipv4Addr,
    options: &ProbeOptions,
) -> Result<ProbeSample, TransportError> {
    let count = options.count.max(1);
    let wait_secs = options.timeout.as_secs().max(1);
    let interval = format!("{:.3}", options.interval.as_secs_f64().max(0.2));

    // The binary should finish well inside this; it only guards a wedged child
    let deadline = (options.interval + options.timeout) * count + Duration::from_secs(5);

    let mut cmd = Command::new("ping");
    cmd.args([
        "-n",
        "-c",
        &count.to_string(),
        "-i",
        &interval,
        "-W",
        &wait_secs.to_string(),
        &ip.to_string(),
    ])
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let output = tokio::time::timeout(deadline, cmd.output())
        .await
        .map_err(|_| TransportError::Timeout(deadline))?
        .map_err(|e| TransportError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_ping_output(&stdout, count) {
        Some(sample) => Ok(sample),
        None => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(TransportError::Command(format!(
                "ping {} failed ({}): {}",
                ip,
                output.status,
                stderr.trim()
            )))
        }
    }
}

/// Parse ping output into a sample with one RTT slot per echo.
///
/// Returns `None` when the output has no statistics summary.
fn parse_ping_output(output: &str, count: u32) -> Option<ProbeSample> {
    // Per-packet response "icmp_seq=N ... time=X.XXX ms"
    static REPLY: OnceLock<Regex> = OnceLock::new();
    let reply = REPLY.get_or_init(|| {
        Regex::new(r"icmp_seq=(?P<seq>\d+).*?time[=<](?P<val>[0-9.]+)\s*ms").unwrap()
    });

    // Summary line "N packets transmitted"
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| Regex::new(r"(?P<sent>\d+) packets transmitted").unwrap());

    let sent: usize = summary
        .captures(output)
        .and_then(|caps| caps.name("sent"))
        .and_then(|m| m.as_str().parse().ok())?;
    let slots = sent.max(count as usize);
    let mut rtts: Vec<Option<f64>> = vec![None; slots];

    for caps in reply.captures_iter(output) {
        let seq: usize = match caps.name("seq").and_then(|m| m.as_str().parse().ok()) {
            Some(seq) => seq,
            None => continue,
        };
        let ms: f64 = match caps.name("val").and_then(|m| m.as_str().parse().ok()) {
            Some(ms) => ms,
            None => continue,
        };
        // Duplicate replies land in an already-filled slot and are dropped
        if let Some(slot) = seq.checked_sub(FIRST_SEQUENCE).and_then(|i| rtts.get_mut(i)) {
            slot.get_or_insert(ms);
        }
    }

    rtts.truncate(sent);
    Some(ProbeSample::from_rtts(rtts))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(n: usize) -> usize {
        n + FIRST_SEQUENCE
    }

    #[test]
    fn test_parse_ping_output_partial_loss() {
        let output = format!(
            r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq={} ttl=117 time=12.3 ms
64 bytes from 8.8.8.8: icmp_seq={} ttl=117 time=14.1 ms

--- 8.8.8.8 ping statistics ---
3 packets transmitted, 2 received, 33.3333% packet loss, time 2003ms
rtt min/avg/max/mdev = 12.300/13.200/14.100/0.900 ms"#,
            seq(0),
            seq(2)
        );
        let sample = parse_ping_output(&output, 3).unwrap();
        assert_eq!(sample.rtts, vec![Some(12.3), None, Some(14.1)]);
        assert_eq!(sample.packets_sent, 3);
        assert_eq!(sample.packets_received, 2);
    }

    #[test]
    fn test_parse_ping_output_total_loss() {
        let output = r#"PING 192.0.2.1 (192.0.2.1) 56(84) bytes of data.

--- 192.0.2.1 ping statistics ---
5 packets transmitted, 0 received, 100% packet loss, time 4100ms"#;
        let sample = parse_ping_output(output, 5).unwrap();
        assert_eq!(sample.packets_sent, 5);
        assert_eq!(sample.packets_received, 0);
    }

    #[test]
    fn test_parse_ping_output_macos_sub_millisecond() {
        let output = format!(
            r#"PING 127.0.0.1 (127.0.0.1): 56 data bytes
64 bytes from 127.0.0.1: icmp_seq={} ttl=64 time<1 ms

--- 127.0.0.1 ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss"#,
            seq(0)
        );
        let sample = parse_ping_output(&output, 1).unwrap();
        assert_eq!(sample.rtts, vec![Some(1.0)]);
    }

    #[test]
    fn test_parse_ping_output_without_summary() {
        assert!(parse_ping_output("ping: unknown host", 5).is_none());
    }
}
