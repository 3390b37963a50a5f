//! Measurement model types.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use std::net::Ipv4Addr;

/// A named hostname to be probed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub hostname: String,
}

impl Target {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
        }
    }
}

/// Raw echo results for one address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeSample {
    /// Round-trip time per echo in milliseconds, `None` for a lost probe.
    pub rtts: Vec<Option<f64>>,
    pub packets_sent: u32,
    pub packets_received: u32,
}

impl ProbeSample {
    /// Build a sample whose counts are derived from the RTT slots.
    pub fn from_rtts(rtts: Vec<Option<f64>>) -> Self {
        let packets_sent = rtts.len() as u32;
        let packets_received = rtts.iter().filter(|r| r.is_some()).count() as u32;
        Self {
            rtts,
            packets_sent,
            packets_received,
        }
    }

    /// RTTs of the probes that got a reply, in send order.
    pub fn replies(&self) -> impl Iterator<Item = f64> + '_ {
        self.rtts.iter().filter_map(|r| *r)
    }
}

/// Summary statistics for one probed address.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressStat {
    pub address: Ipv4Addr,
    pub min_rtt: f64,
    pub mean_rtt: f64,
    pub max_rtt: f64,
    pub median_rtt: f64,
    pub packets_sent: u32,
    pub packets_received: u32,
    /// Fraction of probes without a reply, 0.0 to 1.0.
    pub packet_loss: f64,
}

/// Final measurement for one target.
///
/// Field order is part of the output contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetRecord {
    pub probe_id: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub target_name: String,
    pub hostname: String,
    /// Mean of the per-address median RTTs, in milliseconds.
    pub average_latency: f64,
    /// Mean of the per-address loss ratios.
    pub total_loss: f64,
}

impl TargetRecord {
    /// Timestamp as ISO-8601 text with an explicit `Z` marker.
    pub fn timestamp_string(&self) -> String {
        format_timestamp(&self.timestamp)
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_timestamp(ts))
}

/// Records from one collection run, in target order.
///
/// Targets that failed are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CollectionResult {
    records: Vec<TargetRecord>,
}

impl CollectionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: TargetRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TargetRecord> {
        self.records.iter()
    }

    pub fn records(&self) -> &[TargetRecord] {
        &self.records
    }
}

impl<'a> IntoIterator for &'a CollectionResult {
    type Item = &'a TargetRecord;
    type IntoIter = std::slice::Iter<'a, TargetRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
