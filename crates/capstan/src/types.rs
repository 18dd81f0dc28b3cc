//! Typed results for the scripted operations.

use std::fmt;

/// The five places a job id can live. A job is in exactly one lane at any
/// observable moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Wait,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl Lane {
    /// Wire name used by the remove scripts and stored in `state`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Wait => "wait",
            Lane::Delayed => "delayed",
            Lane::Active => "active",
            Lane::Completed => "completed",
            Lane::Failed => "failed",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful reservation: the job tuple returned by the reserve script.
#[derive(Debug, Clone)]
pub struct ReservedJob {
    pub job_id: String,
    /// Raw payload text exactly as stored.
    pub payload: String,
    pub lock_until_ms: i64,
    /// Attempt number of this reservation, 1-based.
    pub attempt: u32,
    /// Group id, empty when the job is ungrouped.
    pub gid: String,
    pub lease_token: String,
}

/// Outcome of a reserve call.
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    /// Nothing runnable right now.
    Empty,
    /// The queue is paused; back off harder than on empty.
    Paused,
    Job(ReservedJob),
}

/// Outcome of ack_fail: the job either gets another attempt or is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckFailOutcome {
    /// Rescheduled into the delayed set, due at `due_ms`.
    Retry { due_ms: i64 },
    /// Retry budget exhausted; job is in the failed lane.
    Failed,
}

/// Per-job result inside a batch reply.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub job_id: String,
    pub ok: bool,
    /// Reason string when `ok` is false.
    pub reason: Option<String>,
}
