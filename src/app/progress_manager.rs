//! Progress UI for a running job: polls the scheduler snapshot.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use scriptorium_core::{JobManager, JobSnapshot, JobStatus};
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(150);

fn progress_bar(show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg} [{bar:30}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Follows `job_id` until it is terminal or paused and returns its last snapshot.
///
/// The first Ctrl-C requests cancellation; the job then winds down on its own.
pub(crate) async fn follow_job(jobs: &JobManager, job_id: &str, label: &str, show: bool) -> Option<JobSnapshot> {
    let bar = progress_bar(show);
    let mut interrupted = false;

    loop {
        let Some(snapshot) = jobs.get_job(job_id) else {
            bar.finish_and_clear();
            return None;
        };
        bar.set_length(u64::from(snapshot.total));
        bar.set_position(u64::from(snapshot.current));
        bar.set_message(format!("{label} ({})", snapshot.status));

        if snapshot.status.is_terminal() || snapshot.status == JobStatus::Paused {
            bar.finish_and_clear();
            return Some(snapshot);
        }

        tokio::select! {
            () = tokio::time::sleep(POLL_INTERVAL) => {}
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if signal.is_ok() {
                    warn!(job_id, "interrupt received, cancelling job");
                    jobs.request_cancel(job_id).await;
                }
            }
        }
    }
}
