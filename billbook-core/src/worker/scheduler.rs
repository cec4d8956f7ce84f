use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::invoices::InvoiceStore;

/// Totals of one scheduler pass over every owner with open invoices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub owners: usize,
    pub transitioned: usize,
    pub failed: usize,
}

/// Job scheduler driving the overdue sweep.
///
/// The engine itself has no timers; this is the external trigger that polls
/// at a fixed interval and sweeps every owner holding sent invoices.
pub struct JobScheduler {
    invoices: InvoiceStore,

    /// Time between passes
    poll_interval: Duration,

    token: CancellationToken,
}

impl JobScheduler {
    /// Creates a new job scheduler.
    ///
    /// # Arguments
    ///
    /// * `invoices` - Invoice store to sweep
    /// * `poll_interval` - How often to run a pass
    pub fn new(invoices: InvoiceStore, poll_interval: Duration) -> Self {
        Self {
            invoices,
            poll_interval,
            token: CancellationToken::new(),
        }
    }

    /// Starts the scheduler loop.
    ///
    /// Runs a pass immediately and then once per interval until stopped. A
    /// failed pass is logged and the loop keeps going.
    pub async fn start(&self) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "JobScheduler started"
        );

        loop {
            match self.run_once().await {
                Ok(summary) if summary.transitioned > 0 || summary.failed > 0 => {
                    info!(
                        owners = summary.owners,
                        transitioned = summary.transitioned,
                        failed = summary.failed,
                        "Overdue pass finished"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Overdue pass failed"),
            }

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("JobScheduler stopped");
    }

    /// Stops the scheduler loop; an in-flight pass finishes first.
    pub fn stop(&self) {
        info!("Stopping JobScheduler...");
        self.token.cancel();
    }

    /// Sweeps every owner with open invoices once.
    ///
    /// # Errors
    ///
    /// Returns an error only if the owner list cannot be loaded. Per-owner
    /// failures are logged and counted.
    pub async fn run_once(&self) -> Result<PassSummary> {
        let owners = self.invoices.owners_with_open_invoices().await?;
        let mut summary = PassSummary {
            owners: owners.len(),
            ..PassSummary::default()
        };

        for owner in owners {
            match self.invoices.sweep_overdue(&owner).await {
                Ok(report) => {
                    summary.transitioned += report.transitioned.len();
                    summary.failed += report.failed.len();
                }
                Err(e) => {
                    warn!(owner = %owner, error = %e, "Overdue sweep failed for owner");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}
