//! The view of a reserved job handed to handlers, plus the action handle
//! for publishing follow-ups and driving queue state from inside a job.

use crate::client::{PublishOptions, QueueClient};
use crate::error::QueueError;
use crate::types::ReservedJob;

/// Read-only view of the job a handler is running, with [`JobContext::actions`]
/// as the escape hatch for follow-up work.
#[derive(Clone)]
pub struct JobContext {
    queue: String,
    job_id: String,
    payload_raw: String,
    payload: serde_json::Value,
    attempt: u32,
    lock_until_ms: i64,
    lease_token: String,
    gid: String,
    actions: JobActions,
}

impl JobContext {
    pub(crate) fn new(client: QueueClient, queue: &str, job: &ReservedJob) -> Self {
        // Payloads are JSON at publish time, but a hand-edited record should
        // not kill the handler: fall back to the raw text as a JSON string.
        let payload = serde_json::from_str(&job.payload)
            .unwrap_or_else(|_| serde_json::Value::String(job.payload.clone()));
        Self {
            queue: queue.to_string(),
            job_id: job.job_id.clone(),
            payload_raw: job.payload.clone(),
            payload,
            attempt: job.attempt,
            lock_until_ms: job.lock_until_ms,
            lease_token: job.lease_token.clone(),
            gid: job.gid.clone(),
            actions: JobActions {
                client,
                default_child_id: job.job_id.clone(),
            },
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Decoded payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Payload text exactly as stored.
    pub fn payload_raw(&self) -> &str {
        &self.payload_raw
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_str(&self.payload_raw).map_err(|_| QueueError::InvalidPayload)
    }

    /// 1-based attempt number of this reservation.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn lock_until_ms(&self) -> i64 {
        self.lock_until_ms
    }

    pub fn lease_token(&self) -> &str {
        &self.lease_token
    }

    /// Concurrency group id; empty when ungrouped.
    pub fn gid(&self) -> &str {
        &self.gid
    }

    pub fn actions(&self) -> &JobActions {
        &self.actions
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("queue", &self.queue)
            .field("job_id", &self.job_id)
            .field("attempt", &self.attempt)
            .field("gid", &self.gid)
            .finish_non_exhaustive()
    }
}

/// Actions a handler may take mid-job. Shares the consumer's client.
#[derive(Clone)]
pub struct JobActions {
    client: QueueClient,
    default_child_id: String,
}

impl JobActions {
    /// Publish a follow-up job.
    pub async fn publish(
        &self,
        queue: &str,
        payload: &serde_json::Value,
        opts: PublishOptions,
    ) -> Result<String, QueueError> {
        self.client.publish(queue, payload, opts).await
    }

    pub async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        self.client.pause(queue).await
    }

    pub async fn resume(&self, queue: &str) -> Result<bool, QueueError> {
        self.client.resume(queue).await
    }

    pub async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        self.client.is_paused(queue).await
    }

    /// Arm a child-completion counter before fanning out.
    pub async fn childs_init(&self, key: &str, expected: u32) -> Result<(), QueueError> {
        self.client.childs_init(key, expected).await
    }

    /// Acknowledge a child. `child_id` defaults to the current job's id,
    /// which is the common case for fan-out children.
    pub async fn child_ack(&self, key: &str, child_id: Option<&str>) -> Result<i64, QueueError> {
        let cid = child_id.unwrap_or(&self.default_child_id);
        self.client.child_ack(key, cid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReservedJob;

    fn reserved(payload: &str) -> ReservedJob {
        ReservedJob {
            job_id: "job-1".into(),
            payload: payload.into(),
            lock_until_ms: 1_730_000_030_000,
            attempt: 2,
            gid: "grp".into(),
            lease_token: "tok".into(),
        }
    }

    // JobContext construction needs a client; decoding is the part worth
    // pinning down, so exercise the same fallback directly.
    fn decode(raw: &str) -> serde_json::Value {
        serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
    }

    #[test]
    fn payload_decodes_structured_json() {
        let value = decode(r#"{"page":3}"#);
        assert_eq!(value["page"], 3);
    }

    #[test]
    fn malformed_payload_falls_back_to_raw_string() {
        let value = decode("not json {");
        assert_eq!(value, serde_json::Value::String("not json {".into()));
    }

    #[test]
    fn reserved_job_fields_carry_through() {
        let job = reserved(r#"{"k":1}"#);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.gid, "grp");
    }
}
