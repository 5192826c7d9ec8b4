//! Recovery Worker
//!
//! Background worker that reclaims lapsed locks and resumes instances that
//! never reached a terminal state (e.g. after a crash).

use super::engine::OrchestrationEngine;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Outcome of one recovery scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reclaimed_locks: usize,
    pub resumed_instances: usize,
}

pub struct RecoveryWorker {
    engine: Arc<OrchestrationEngine>,
    scan_interval: Duration,
}

impl RecoveryWorker {
    pub fn new(engine: Arc<OrchestrationEngine>, scan_interval: Duration) -> Self {
        Self {
            engine,
            scan_interval,
        }
    }

    /// Uses the engine's configured recovery interval.
    pub fn with_defaults(engine: Arc<OrchestrationEngine>) -> Self {
        let scan_interval = engine.config().recovery_interval();
        Self::new(engine, scan_interval)
    }

    /// Run the recovery worker loop
    ///
    /// This method runs forever, periodically reclaiming and resuming.
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_ms = self.scan_interval.as_millis() as u64,
            "Starting recovery worker"
        );

        loop {
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }

            tokio::time::sleep(self.scan_interval).await;
        }
    }

    /// Run a single scan and recovery cycle
    pub async fn scan_and_recover(&self) -> Result<RecoveryReport> {
        let reclaimed_locks = self.engine.locks().reclaim_expired().await?;
        let resumed_instances = self.engine.resume_unfinished().await?;

        let report = RecoveryReport {
            reclaimed_locks,
            resumed_instances,
        };
        if report == RecoveryReport::default() {
            debug!("Nothing to recover");
        } else {
            info!(
                reclaimed_locks = report.reclaimed_locks,
                resumed_instances = report.resumed_instances,
                "Recovery scan finished"
            );
        }
        Ok(report)
    }
}
