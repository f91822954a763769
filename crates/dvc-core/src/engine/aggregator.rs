use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use crate::consts::AGGREGATOR_POLL_INTERVAL_MS;
use crate::error::{DvcError, Result};

use super::types::{Completion, ProgressReporter, RunStats};

/// Consume completions until `total` subvolumes are done.
///
/// Cancellation is checked before every receive; a receive times out after
/// `AGGREGATOR_POLL_INTERVAL_MS` so a stalled batch cannot hide a cancel
/// request. The first worker failure is returned as is.
pub(super) fn aggregate(
    done: &Receiver<Completion>,
    total: usize,
    reporter: &dyn ProgressReporter,
    stats: &mut RunStats,
) -> Result<()> {
    let poll = Duration::from_millis(AGGREGATOR_POLL_INTERVAL_MS);
    let mut completed = 0usize;

    while completed < total {
        reporter.throw_if_cancelled()?;
        match done.recv_timeout(poll) {
            Ok(Completion::Completed { batch, tally }) => {
                completed += tally.count;
                stats.absorb(&tally);
                debug!(batch, completed, total, "Batch complete");
                reporter.set_progress((completed as f64 / total as f64).min(1.0));
            }
            Ok(Completion::Failed(e)) => {
                warn!(error = %e, completed, total, "Worker failed");
                return Err(e);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!(completed, total, "All workers exited early");
                return Err(DvcError::WorkersExited { completed, total });
            }
        }
    }
    Ok(())
}
