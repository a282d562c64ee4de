//! Exit code logic for the scriptorium process.
//!
//! Single responsibility: map a finished job to the process exit outcome.

use scriptorium_core::{JobSnapshot, JobStatus};

use crate::ProcessExit;

/// Outcome from a job's final snapshot; a completed job carrying a note
/// (some pages failed) is partial.
pub(crate) fn exit_for_job(snapshot: Option<&JobSnapshot>) -> ProcessExit {
    match snapshot {
        Some(s) if s.status == JobStatus::Completed && s.error.is_none() => ProcessExit::Success,
        Some(s) if s.status == JobStatus::Completed || s.status == JobStatus::Paused => ProcessExit::Partial,
        _ => ProcessExit::Failure,
    }
}
