//! Probe module for address resolution and ICMP echo transports.
//!
//! Supports native ICMP sockets and a `ping` command fallback.

mod command;
mod icmp;
mod resolve;

pub use command::*;
pub use icmp::*;
pub use resolve::*;

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::ProbeSample;

/// Transport error types.
///
/// A lost echo is never an error; these fail the whole probe call.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Socket(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("probe task failed: {0}")]
    Task(String),
    #[error("probing timed out after {0:?}")]
    Timeout(Duration),
}

/// Echo parameters shared by every address in one probe call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOptions {
    /// Echo requests per address.
    pub count: u32,
    /// Delay between consecutive echoes to one address.
    pub interval: Duration,
    /// Time to wait for each reply.
    pub timeout: Duration,
    /// RAW sockets when true, unprivileged DGRAM sockets otherwise.
    pub privileged: bool,
    /// Max addresses probed at once.
    pub concurrency: usize,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            count: 5,
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(2),
            privileged: false,
            concurrency: 50,
        }
    }
}

/// Sends echo probes to a set of addresses in parallel.
///
/// Every input address gets a sample (possibly all-loss), or the call fails.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn probe(
        &self,
        addresses: &BTreeSet<Ipv4Addr>,
        options: &ProbeOptions,
    ) -> Result<HashMap<Ipv4Addr, ProbeSample>, TransportError>;
}

/// Which transport to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Native ICMP if sockets can be opened, else the `ping` command.
    #[default]
    Auto,
    Icmp,
    Command,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "icmp" | "native" => Ok(Self::Icmp),
            "command" | "ping" => Ok(Self::Command),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

/// Build the transport for the given kind and privilege mode.
pub fn build_transport(kind: TransportKind, privileged: bool) -> Arc<dyn ProbeTransport> {
    match kind {
        TransportKind::Icmp => Arc::new(IcmpTransport),
        TransportKind::Command => Arc::new(CommandTransport),
        TransportKind::Auto => {
            if icmp_available(privileged) {
                tracing::info!(privileged, "Probe transport: native ICMP");
                Arc::new(IcmpTransport)
            } else {
                tracing::info!(
                    privileged,
                    "Probe transport: native ICMP unavailable, using ping command"
                );
                Arc::new(CommandTransport)
            }
        }
    }
}

/// Spread probe work across addresses, at most `limit` at a time.
///
/// Any task error fails the whole call.
async fn probe_all<F, Fut>(
    addresses: &BTreeSet<Ipv4Addr>,
    limit: usize,
    probe_one: F,
) -> Result<HashMap<Ipv4Addr, ProbeSample>, TransportError>
where
    F: Fn(Ipv4Addr) -> Fut,
    Fut: std::future::Future<Output = Result<ProbeSample, TransportError>> + Send + 'static,
{
    let semaphore = Arc::new(tokio::sync::Semaphore::new(limit.max(1)));
    let mut tasks = tokio::task::JoinSet::new();

    for &ip in addresses {
        let semaphore = semaphore.clone();
        let fut = probe_one(ip);
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| TransportError::Task(e.to_string()))?;
            fut.await.map(|sample| (ip, sample))
        });
    }

    let mut samples = HashMap::with_capacity(addresses.len());
    while let Some(joined) = tasks.join_next().await {
        let (ip, sample) = joined.map_err(|e| TransportError::Task(e.to_string()))??;
        samples.insert(ip, sample);
    }

    Ok(samples)
}
