//! Collector module that drives resolution, probing and aggregation per target.

mod events;

pub use events::*;

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

use crate::models::{CollectionResult, ProbeSample, Target, TargetRecord};
use crate::probe::{ProbeOptions, ProbeTransport, ResolutionError, Resolver, TransportError};
use crate::stats::{self, AggregationError};

/// Why a single target produced no record.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

impl TargetError {
    /// Stage in which this error is raised.
    pub fn stage(&self) -> TargetStage {
        match self {
            Self::Resolution(_) => TargetStage::Resolving,
            Self::Transport(_) => TargetStage::Probing,
            Self::Aggregation(_) => TargetStage::Aggregating,
        }
    }
}

/// Orchestrates one collection pass over a set of targets.
///
/// Targets run one after another in input order; the addresses of a
/// single target are probed concurrently by the transport.
pub struct Collector {
    resolver: Arc<dyn Resolver>,
    transport: Arc<dyn ProbeTransport>,
    options: ProbeOptions,
    target_timeout: Option<Duration>,
    observer: Arc<dyn CollectionObserver>,
}

impl Collector {
    /// Create a collector that reports through `tracing`.
    pub fn new(
        resolver: Arc<dyn Resolver>,
        transport: Arc<dyn ProbeTransport>,
        options: ProbeOptions,
    ) -> Self {
        Self {
            resolver,
            transport,
            options,
            target_timeout: None,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CollectionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Bound the probing stage of each target.
    ///
    /// On expiry the target fails with `TransportError::Timeout`. In-flight
    /// `ping` children are killed; native echo loops stop before their next echo.
    pub fn with_target_timeout(mut self, timeout: Duration) -> Self {
        self.target_timeout = Some(timeout);
        self
    }

    /// Collect one record per target that succeeds.
    ///
    /// Per-target failures are reported and skipped; an empty result is a
    /// valid outcome.
    pub async fn collect(&self, targets: &[Target], probe_id: &str) -> CollectionResult {
        let mut result = CollectionResult::new();
        let mut failed = 0;

        for target in targets {
            self.enter(target, TargetStage::Pending);

            match self.collect_target(target, probe_id).await {
                Ok(record) => {
                    self.enter(target, TargetStage::Done);
                    self.observer.on_event(&CollectionEvent::TargetCompleted {
                        target,
                        record: &record,
                    });
                    result.push(record);
                }
                Err(error) => {
                    failed += 1;
                    self.observer.on_event(&CollectionEvent::TargetFailed {
                        target,
                        stage: error.stage(),
                        error: &error,
                    });
                    self.enter(target, TargetStage::Failed);
                }
            }
        }

        self.observer.on_event(&CollectionEvent::RunFinished {
            succeeded: result.len(),
            failed,
        });
        result
    }

    /// Run the full pipeline for one target.
    pub async fn collect_target(
        &self,
        target: &Target,
        probe_id: &str,
    ) -> Result<TargetRecord, TargetError> {
        self.enter(target, TargetStage::Resolving);
        let addresses = self.resolver.resolve(&target.hostname).await?;
        self.observer.on_event(&CollectionEvent::Resolved {
            target,
            addresses: &addresses,
        });

        self.enter(target, TargetStage::Probing);
        let timestamp = Utc::now();
        let samples = self.probe(&addresses).await?;

        self.enter(target, TargetStage::Aggregating);
        let mut address_stats = Vec::with_capacity(addresses.len());
        for &address in &addresses {
            let outcome = match samples.get(&address) {
                Some(sample) => stats::summarize(address, sample),
                None => Err(AggregationError::NoProbesSent { address }),
            };
            match outcome {
                Ok(stat) => {
                    self.observer
                        .on_event(&CollectionEvent::AddressMeasured { target, stat: &stat });
                    address_stats.push(stat);
                }
                Err(reason) => self.observer.on_event(&CollectionEvent::AddressExcluded {
                    target,
                    address,
                    reason: &reason,
                }),
            }
        }
        let summary = stats::reduce(&address_stats)?;

        Ok(TargetRecord {
            probe_id: probe_id.to_string(),
            timestamp,
            target_name: target.name.clone(),
            hostname: target.hostname.clone(),
            average_latency: summary.average_latency,
            total_loss: summary.total_loss,
        })
    }

    async fn probe(
        &self,
        addresses: &BTreeSet<Ipv4Addr>,
    ) -> Result<HashMap<Ipv4Addr, ProbeSample>, TransportError> {
        let call = self.transport.probe(addresses, &self.options);
        match self.target_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| TransportError::Timeout(limit))?,
            None => call.await,
        }
    }

    fn enter(&self, target: &Target, stage: TargetStage) {
        self.observer
            .on_event(&CollectionEvent::StageEntered { target, stage });
    }
}
