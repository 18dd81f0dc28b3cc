//! Structured error types for the queue façade.
//!
//! Scripts report failures as `("ERR", reason)` tuples and never mutate
//! state on that path; the façade maps each reason onto a variant here so
//! callers can pattern-match instead of string-sniffing. `anyhow::Error`
//! stays inside job handlers - it never crosses the queue API boundary.

use thiserror::Error;

/// Maximum number of ids accepted by a batch operation.
pub const BATCH_MAX: usize = 100;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Job is not in the active set (never was, or already finished/reaped).
    #[error("job {job_id} is not active")]
    NotActive { job_id: String },

    /// Another reservation holds the lease.
    #[error("lease token mismatch for job {job_id}")]
    TokenMismatch { job_id: String },

    /// Removal named a lane the job is not in.
    #[error("job {job_id} is not in lane {lane}")]
    WrongLane { job_id: String, lane: String },

    /// Retry targeted a job that is not in the failed lane.
    #[error("job {job_id} is not failed")]
    NotFailed { job_id: String },

    /// No record exists for the job id.
    #[error("job {job_id} not found")]
    NotFound { job_id: String },

    /// Lane name is not one of wait/delayed/active/completed/failed.
    #[error("unknown lane {0:?}")]
    BadLane(String),

    /// Payload was not a JSON object or array.
    #[error("payload must be a JSON object or array")]
    InvalidPayload,

    /// Child-counter key failed validation.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Batch operation exceeded [`BATCH_MAX`] ids.
    #[error("batch of {len} ids exceeds the maximum of {max}")]
    BatchTooLarge { len: usize, max: usize },

    /// A script returned a tuple the façade does not understand.
    #[error("unexpected {op} reply: {detail}")]
    UnexpectedReply { op: &'static str, detail: String },

    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

impl QueueError {
    /// Map a script `ERR` reason onto a typed variant.
    pub(crate) fn from_reason(op: &'static str, reason: &str, job_id: &str, lane: &str) -> Self {
        match reason {
            "NOT_ACTIVE" => QueueError::NotActive {
                job_id: job_id.to_string(),
            },
            "TOKEN_MISMATCH" => QueueError::TokenMismatch {
                job_id: job_id.to_string(),
            },
            "WRONG_LANE" => QueueError::WrongLane {
                job_id: job_id.to_string(),
                lane: lane.to_string(),
            },
            "NOT_FAILED" => QueueError::NotFailed {
                job_id: job_id.to_string(),
            },
            "NOT_FOUND" => QueueError::NotFound {
                job_id: job_id.to_string(),
            },
            "BAD_LANE" => QueueError::BadLane(lane.to_string()),
            other => QueueError::UnexpectedReply {
                op,
                detail: format!("ERR {other}"),
            },
        }
    }

    /// True when the error means another consumer owns the job now.
    ///
    /// The heartbeat task uses this to stop renewing and to tell the main
    /// loop that any ack would be wrong.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            QueueError::NotActive { .. } | QueueError::TokenMismatch { .. }
        )
    }
}
