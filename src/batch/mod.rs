//! Checkpointed batch over a domain list.
//!
//! Domains are processed strictly in list order, one at a time. After each
//! domain its rows are written (and flushed) before the checkpoint advances,
//! so an interrupted run resumes at the first domain whose rows may be
//! missing. A completed run resets the checkpoint to 0.
//!
//! | Failure | Effect |
//! |---------|--------|
//! | domain cannot be visited | logged, counted, checkpoint still advances |
//! | checkpoint cannot be saved | logged, run continues |
//! | a row cannot be written | run stops with the error |

pub mod checkpoint;
pub mod io;

pub use checkpoint::{Checkpoint, FileCheckpoint, MemoryCheckpoint};
pub use io::{read_domains, CsvReport, MemorySink, ResultSink};

use crate::base::error::AuditError;
use crate::runner::DomainRunner;
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Totals for one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    /// Domains attempted in this run.
    pub processed: usize,
    /// Domains that errored or whose session did not reach `Done`.
    pub failed: usize,
    pub rows_written: usize,
    /// Checkpoint index the run started from.
    pub resumed_from: usize,
}

pub struct BatchOrchestrator<R, C, S> {
    runner: R,
    checkpoint: C,
    sink: S,
}

impl<R, C, S> BatchOrchestrator<R, C, S>
where
    R: DomainRunner,
    C: Checkpoint,
    S: ResultSink,
{
    pub fn new(runner: R, checkpoint: C, sink: S) -> Self {
        Self {
            runner,
            checkpoint,
            sink,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn into_parts(self) -> (R, C, S) {
        (self.runner, self.checkpoint, self.sink)
    }

    /// Process every domain from the checkpoint onwards.
    ///
    /// Only sink failures are returned; everything else is absorbed per
    /// domain.
    pub async fn run(&mut self, domains: &[String]) -> Result<BatchSummary, AuditError> {
        let start = self.checkpoint.load();
        let mut summary = BatchSummary {
            resumed_from: start,
            ..BatchSummary::default()
        };
        if start > 0 {
            info!(start, total = domains.len(), "resuming from checkpoint");
        }

        for (index, domain) in domains.iter().enumerate().skip(start) {
            summary.processed += 1;
            match self.runner.run_domain(domain).await {
                Ok(outcome) => {
                    if outcome.is_failed() {
                        summary.failed += 1;
                    }
                    let rows = outcome.results(OffsetDateTime::now_utc());
                    for row in &rows {
                        self.sink.write_result(row)?;
                    }
                    summary.rows_written += rows.len();
                    info!(index, domain = %domain, rows = rows.len(), "domain complete");
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(index, domain = %domain, error = %e, "domain failed");
                }
            }
            self.save_checkpoint(index + 1);
        }

        self.save_checkpoint(0);
        info!(
            processed = summary.processed,
            failed = summary.failed,
            rows = summary.rows_written,
            "batch complete"
        );
        Ok(summary)
    }

    fn save_checkpoint(&mut self, next_index: usize) {
        if let Err(e) = self.checkpoint.save(next_index) {
            error!(next_index, error = %e, "checkpoint not saved");
        }
    }
}
