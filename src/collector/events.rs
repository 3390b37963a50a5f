//! Collection lifecycle events and the observers that report them.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use super::TargetError;
use crate::models::{AddressStat, Target, TargetRecord};
use crate::stats::AggregationError;

/// Pipeline stage of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStage {
    Pending,
    Resolving,
    Probing,
    Aggregating,
    Done,
    Failed,
}

impl fmt::Display for TargetStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Probing => "probing",
            Self::Aggregating => "aggregating",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Something that happened during a collection run.
#[derive(Debug)]
pub enum CollectionEvent<'a> {
    StageEntered {
        target: &'a Target,
        stage: TargetStage,
    },
    Resolved {
        target: &'a Target,
        addresses: &'a BTreeSet<Ipv4Addr>,
    },
    /// Per-address breakdown that feeds the target's aggregate.
    AddressMeasured {
        target: &'a Target,
        stat: &'a AddressStat,
    },
    /// An address was left out of the target's aggregate.
    AddressExcluded {
        target: &'a Target,
        address: Ipv4Addr,
        reason: &'a AggregationError,
    },
    TargetCompleted {
        target: &'a Target,
        record: &'a TargetRecord,
    },
    TargetFailed {
        target: &'a Target,
        /// Stage the target was in when it failed.
        stage: TargetStage,
        error: &'a TargetError,
    },
    RunFinished {
        succeeded: usize,
        failed: usize,
    },
}

/// Receives collection events. Collection never depends on what it does.
pub trait CollectionObserver: Send + Sync {
    fn on_event(&self, event: &CollectionEvent<'_>);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl CollectionObserver for NoopObserver {
    fn on_event(&self, _event: &CollectionEvent<'_>) {}
}

/// Reports events as structured `tracing` logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl CollectionObserver for TracingObserver {
    fn on_event(&self, event: &CollectionEvent<'_>) {
        match event {
            CollectionEvent::StageEntered { target, stage } => {
                tracing::debug!(
                    target_name = %target.name,
                    hostname = %target.hostname,
                    %stage,
                    "Target stage"
                );
            }
            CollectionEvent::Resolved { target, addresses } => {
                tracing::info!(
                    target_name = %target.name,
                    hostname = %target.hostname,
                    addresses = ?addresses,
                    "Found IP addresses"
                );
            }
            CollectionEvent::AddressMeasured { target, stat } => {
                tracing::debug!(
                    target_name = %target.name,
                    address = %stat.address,
                    min_rtt = stat.min_rtt,
                    mean_rtt = stat.mean_rtt,
                    max_rtt = stat.max_rtt,
                    median_rtt = stat.median_rtt,
                    packets_sent = stat.packets_sent,
                    packets_received = stat.packets_received,
                    packet_loss = stat.packet_loss,
                    "Address measured"
                );
            }
            CollectionEvent::AddressExcluded {
                target,
                address,
                reason,
            } => {
                tracing::warn!(
                    target_name = %target.name,
                    %address,
                    reason = %reason,
                    "Excluding address from aggregate"
                );
            }
            CollectionEvent::TargetCompleted { target, record } => {
                tracing::info!(
                    target_name = %target.name,
                    hostname = %target.hostname,
                    probe_id = %record.probe_id,
                    timestamp = %record.timestamp_string(),
                    average_latency = record.average_latency,
                    total_loss = record.total_loss,
                    "Target measured"
                );
            }
            CollectionEvent::TargetFailed {
                target,
                stage,
                error,
            } => {
                tracing::warn!(
                    target_name = %target.name,
                    hostname = %target.hostname,
                    %stage,
                    error = %error,
                    "Error processing target"
                );
            }
            CollectionEvent::RunFinished { succeeded, failed } => {
                tracing::info!(succeeded, failed, "Collection finished");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display() {
        assert_eq!(TargetStage::Aggregating.to_string(), "aggregating");
        assert_eq!(TargetStage::Failed.to_string(), "failed");
    }

    #[test]
    fn test_observers_accept_events() {
        let target = Target::new("cdn_a", "example.cdn.net");
        let event = CollectionEvent::StageEntered {
            target: &target,
            stage: TargetStage::Resolving,
        };
        NoopObserver.on_event(&event);
        TracingObserver.on_event(&event);
        TracingObserver.on_event(&CollectionEvent::RunFinished {
            succeeded: 1,
            failed: 0,
        });
    }
}
