//! Pipeline run status as a function of its block run statuses.

use pipegrid_state::{BlockRunStatus, PipelineRunStatus};

/// Terminal run status implied by the block statuses, or `None` while any
/// block can still change.
///
/// A run completes only if every block completed. Otherwise it is
/// cancelled when cancellation was requested and failed in every other case.
pub fn derive_run_status<I>(statuses: I, cancel_requested: bool) -> Option<PipelineRunStatus>
where
    I: IntoIterator<Item = BlockRunStatus>,
{
    let mut all_completed = true;
    for status in statuses {
        if !status.is_terminal() {
            return None;
        }
        all_completed &= status == BlockRunStatus::Completed;
    }
    Some(if all_completed {
        PipelineRunStatus::Completed
    } else if cancel_requested {
        PipelineRunStatus::Cancelled
    } else {
        PipelineRunStatus::Failed
    })
}
