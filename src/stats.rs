//! Per-address and per-target statistic reduction.

use std::net::Ipv4Addr;
use thiserror::Error;

use crate::models::{AddressStat, ProbeSample};

/// Aggregation error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    #[error("no probes were sent to {address}")]
    NoProbesSent { address: Ipv4Addr },
    #[error("no replies received from {address}")]
    NoReplies { address: Ipv4Addr },
    #[error("{address} reports {received} replies for {sent} probes")]
    InconsistentCounts {
        address: Ipv4Addr,
        sent: u32,
        received: u32,
    },
    #[error("no address produced usable statistics")]
    NoUsableAddresses,
}

/// Target-level reduction of address statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetSummary {
    pub average_latency: f64,
    pub total_loss: f64,
}

/// Reduce one address's raw sample to min/mean/max/median and loss.
pub fn summarize(
    address: Ipv4Addr,
    sample: &ProbeSample,
) -> Result<AddressStat, AggregationError> {
    let sent = sample.packets_sent;
    let received = sample.packets_received;

    if sent == 0 {
        return Err(AggregationError::NoProbesSent { address });
    }
    if received > sent {
        return Err(AggregationError::InconsistentCounts {
            address,
            sent,
            received,
        });
    }

    let mut values: Vec<f64> = sample.replies().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return Err(AggregationError::NoReplies { address });
    }
    values.sort_by(f64::total_cmp);

    let min = values[0];
    let max = values[values.len() - 1];
    let mean = values.iter().sum::<f64>() / values.len() as f64;

    Ok(AddressStat {
        address,
        min_rtt: min,
        mean_rtt: mean,
        max_rtt: max,
        median_rtt: median_sorted(&values),
        packets_sent: sent,
        packets_received: received,
        packet_loss: 1.0 - f64::from(received) / f64::from(sent),
    })
}

/// Mean of the address medians and mean of the address loss ratios.
pub fn reduce(stats: &[AddressStat]) -> Result<TargetSummary, AggregationError> {
    if stats.is_empty() {
        return Err(AggregationError::NoUsableAddresses);
    }

    let n = stats.len() as f64;
    let average_latency = stats.iter().map(|s| s.median_rtt).sum::<f64>() / n;
    let total_loss = stats.iter().map(|s| s.packet_loss).sum::<f64>() / n;

    Ok(TargetSummary {
        average_latency,
        total_loss,
    })
}

// Even-length input takes the mean of the two middle values.
fn median_sorted(values: &[f64]) -> f64 {
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
