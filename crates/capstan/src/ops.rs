//! Typed wrappers over the atomic scripts.
//!
//! Each wrapper resolves the routing anchor, injects `now_ms` from the
//! clock, invokes the script, and turns the status tuple into a typed
//! value or a [`QueueError`]. Nothing here mutates state outside a script.

use redis::aio::ConnectionManager;
use redis::Value;

use crate::clock::Clock;
use crate::error::{QueueError, BATCH_MAX};
use crate::ids;
use crate::keys::{childs_anchor, job_key, paused_key, queue_anchor, queue_base};
use crate::scripts::scripts;
use crate::types::{AckFailOutcome, BatchItem, Lane, ReserveOutcome, ReservedJob};

/// Default job timeout used when a record no longer carries one.
pub const DEFAULT_TIMEOUT_MS: i64 = 60_000;

/// Arguments for [`Ops::enqueue`]. The client layer fills these from
/// `PublishOptions`; admin tooling can drive them directly.
#[derive(Debug, Clone)]
pub struct EnqueueArgs<'a> {
    pub job_id: &'a str,
    /// Serialized payload text, already validated as object/array JSON.
    pub payload: &'a str,
    pub max_attempts: u32,
    pub timeout_ms: i64,
    pub backoff_ms: i64,
    pub due_ms: i64,
    pub gid: &'a str,
    pub group_limit: u32,
}

/// The operations façade: one method per script.
#[derive(Clone)]
pub struct Ops {
    conn: ConnectionManager,
    clock: Clock,
}

impl Ops {
    pub fn new(conn: ConnectionManager, clock: Clock) -> Self {
        Self { conn, clock }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// A clone of the underlying connection, for monitors and harnesses.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub async fn enqueue(&self, queue: &str, args: EnqueueArgs<'_>) -> Result<String, QueueError> {
        let anchor = queue_anchor(queue);
        let now = self.now_ms();
        let mut conn = self.conn.clone();

        let reply: Value = scripts()
            .enqueue
            .key(&anchor)
            .arg(args.job_id)
            .arg(args.payload)
            .arg(args.max_attempts)
            .arg(args.timeout_ms)
            .arg(args.backoff_ms)
            .arg(now)
            .arg(args.due_ms)
            .arg(args.gid)
            .arg(args.group_limit)
            .invoke_async(&mut conn)
            .await?;

        let items = expect_tuple("enqueue", &reply)?;
        match status_of(&items) {
            Some("OK") if items.len() >= 2 => {
                value_str(&items[1]).ok_or_else(|| unexpected("enqueue", &reply))
            }
            _ => Err(unexpected("enqueue", &reply)),
        }
    }

    pub async fn reserve(&self, queue: &str) -> Result<ReserveOutcome, QueueError> {
        let anchor = queue_anchor(queue);
        let now = self.now_ms();
        let token = ids::new_lease_token();
        let mut conn = self.conn.clone();

        let reply: Value = scripts()
            .reserve
            .key(&anchor)
            .arg(now)
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;

        parse_reserve(&reply)
    }

    pub async fn heartbeat(
        &self,
        queue: &str,
        job_id: &str,
        lease_token: &str,
    ) -> Result<i64, QueueError> {
        let anchor = queue_anchor(queue);
        let now = self.now_ms();
        let mut conn = self.conn.clone();

        let reply: Value = scripts()
            .heartbeat
            .key(&anchor)
            .arg(job_id)
            .arg(now)
            .arg(lease_token)
            .invoke_async(&mut conn)
            .await?;

        let items = expect_tuple("heartbeat", &reply)?;
        match status_of(&items) {
            Some("OK") if items.len() >= 2 => {
                value_i64(&items[1]).ok_or_else(|| unexpected("heartbeat", &reply))
            }
            Some("ERR") => Err(err_of("heartbeat", &items, job_id, "")),
            _ => Err(unexpected("heartbeat", &reply)),
        }
    }

    pub async fn ack_success(
        &self,
        queue: &str,
        job_id: &str,
        lease_token: &str,
    ) -> Result<(), QueueError> {
        let anchor = queue_anchor(queue);
        let now = self.now_ms();
        let mut conn = self.conn.clone();

        let reply: Value = scripts()
            .ack_success
            .key(&anchor)
            .arg(job_id)
            .arg(now)
            .arg(lease_token)
            .invoke_async(&mut conn)
            .await?;

        let items = expect_tuple("ack_success", &reply)?;
        match status_of(&items) {
            Some("OK") => Ok(()),
            Some("ERR") => Err(err_of("ack_success", &items, job_id, "")),
            _ => Err(unexpected("ack_success", &reply)),
        }
    }

    pub async fn ack_fail(
        &self,
        queue: &str,
        job_id: &str,
        lease_token: &str,
        error: Option<&str>,
    ) -> Result<AckFailOutcome, QueueError> {
        let anchor = queue_anchor(queue);
        let now = self.now_ms();
        let mut conn = self.conn.clone();

        let reply: Value = scripts()
            .ack_fail
            .key(&anchor)
            .arg(job_id)
            .arg(now)
            .arg(lease_token)
            .arg(error.unwrap_or(""))
            .invoke_async(&mut conn)
            .await?;

        parse_ack_fail(&reply, job_id)
    }

    pub async fn promote_delayed(&self, queue: &str, max_promote: u32) -> Result<u64, QueueError> {
        self.maintenance(&scripts().promote_delayed, "promote_delayed", queue, max_promote)
            .await
    }

    pub async fn reap_expired(&self, queue: &str, max_reap: u32) -> Result<u64, QueueError> {
        self.maintenance(&scripts().reap_expired, "reap_expired", queue, max_reap)
            .await
    }

    async fn maintenance(
        &self,
        script: &redis::Script,
        op: &'static str,
        queue: &str,
        max: u32,
    ) -> Result<u64, QueueError> {
        let anchor = queue_anchor(queue);
        let now = self.now_ms();
        let mut conn = self.conn.clone();

        let reply: Value = script
            .key(&anchor)
            .arg(now)
            .arg(max)
            .invoke_async(&mut conn)
            .await?;

        let items = expect_tuple(op, &reply)?;
        match status_of(&items) {
            Some("OK") if items.len() >= 2 => {
                value_i64(&items[1]).map(|n| n.max(0) as u64).ok_or_else(|| unexpected(op, &reply))
            }
            _ => Err(unexpected(op, &reply)),
        }
    }

    pub async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        let anchor = queue_anchor(queue);
        let mut conn = self.conn.clone();
        let _: Value = scripts().pause.key(&anchor).invoke_async(&mut conn).await?;
        Ok(())
    }

    /// Returns true when the queue had been paused.
    pub async fn resume(&self, queue: &str) -> Result<bool, QueueError> {
        let anchor = queue_anchor(queue);
        let mut conn = self.conn.clone();
        let deleted: i64 = scripts().resume.key(&anchor).invoke_async(&mut conn).await?;
        Ok(deleted == 1)
    }

    pub async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        let base = queue_base(queue);
        let mut conn = self.conn.clone();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(paused_key(&base))
            .query_async(&mut conn)
            .await?;
        Ok(exists == 1)
    }

    /// The job's own `timeout_ms`, falling back to `default_ms` when the
    /// record is gone or carries no value. Used to derive the heartbeat
    /// cadence.
    pub async fn job_timeout_ms(
        &self,
        queue: &str,
        job_id: &str,
        default_ms: i64,
    ) -> Result<i64, QueueError> {
        let base = queue_base(queue);
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(job_key(&base, job_id))
            .arg("timeout_ms")
            .query_async(&mut conn)
            .await?;
        let n = raw.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);
        Ok(if n > 0 { n } else { default_ms })
    }

    pub async fn retry_failed(&self, queue: &str, job_id: &str) -> Result<(), QueueError> {
        let anchor = queue_anchor(queue);
        let now = self.now_ms();
        let mut conn = self.conn.clone();

        let reply: Value = scripts()
            .retry_failed
            .key(&anchor)
            .arg(job_id)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        let items = expect_tuple("retry_failed", &reply)?;
        match status_of(&items) {
            Some("OK") => Ok(()),
            Some("ERR") => Err(err_of("retry_failed", &items, job_id, "")),
            _ => Err(unexpected("retry_failed", &reply)),
        }
    }

    pub async fn retry_failed_batch(
        &self,
        queue: &str,
        job_ids: &[String],
    ) -> Result<Vec<BatchItem>, QueueError> {
        check_batch(job_ids)?;
        let anchor = queue_anchor(queue);
        let now = self.now_ms();
        let mut conn = self.conn.clone();

        let mut invocation = scripts().retry_failed_batch.key(&anchor);
        invocation.arg(now).arg(job_ids.len());
        for id in job_ids {
            invocation.arg(id);
        }
        let reply: Value = invocation.invoke_async(&mut conn).await?;

        parse_batch("retry_failed_batch", &reply)
    }

    pub async fn remove_job(&self, queue: &str, job_id: &str, lane: Lane) -> Result<(), QueueError> {
        let anchor = queue_anchor(queue);
        let mut conn = self.conn.clone();

        let reply: Value = scripts()
            .remove_job
            .key(&anchor)
            .arg(job_id)
            .arg(lane.as_str())
            .invoke_async(&mut conn)
            .await?;

        let items = expect_tuple("remove_job", &reply)?;
        match status_of(&items) {
            Some("OK") => Ok(()),
            Some("ERR") => Err(err_of("remove_job", &items, job_id, lane.as_str())),
            _ => Err(unexpected("remove_job", &reply)),
        }
    }

    pub async fn remove_jobs_batch(
        &self,
        queue: &str,
        lane: Lane,
        job_ids: &[String],
    ) -> Result<Vec<BatchItem>, QueueError> {
        check_batch(job_ids)?;
        let anchor = queue_anchor(queue);
        let mut conn = self.conn.clone();

        let mut invocation = scripts().remove_jobs_batch.key(&anchor);
        invocation.arg(lane.as_str()).arg(job_ids.len());
        for id in job_ids {
            invocation.arg(id);
        }
        let reply: Value = invocation.invoke_async(&mut conn).await?;

        parse_batch("remove_jobs_batch", &reply)
    }

    pub async fn childs_init(&self, key: &str, expected: u32) -> Result<(), QueueError> {
        let anchor = childs_anchor(key)?;
        let mut conn = self.conn.clone();

        let reply: Value = scripts()
            .childs_init
            .key(&anchor)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;

        let items = expect_tuple("childs_init", &reply)?;
        match status_of(&items) {
            Some("OK") => Ok(()),
            _ => Err(unexpected("childs_init", &reply)),
        }
    }

    /// Remaining count after this ack, or -1 when the counter was never
    /// initialized. Idempotent per `child_id`.
    pub async fn child_ack(&self, key: &str, child_id: &str) -> Result<i64, QueueError> {
        let cid = child_id.trim();
        if cid.is_empty() {
            return Err(QueueError::InvalidKey("child id is empty".into()));
        }
        let anchor = childs_anchor(key)?;
        let mut conn = self.conn.clone();

        let reply: Value = scripts()
            .child_ack
            .key(&anchor)
            .arg(cid)
            .invoke_async(&mut conn)
            .await?;

        let items = expect_tuple("child_ack", &reply)?;
        match status_of(&items) {
            Some("OK") if items.len() >= 2 => {
                value_i64(&items[1]).ok_or_else(|| unexpected("child_ack", &reply))
            }
            _ => Err(unexpected("child_ack", &reply)),
        }
    }
}

fn check_batch(job_ids: &[String]) -> Result<(), QueueError> {
    if job_ids.len() > BATCH_MAX {
        return Err(QueueError::BatchTooLarge {
            len: job_ids.len(),
            max: BATCH_MAX,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reply parsing. Scripts answer with status tuples; these helpers keep the
// Value plumbing in one place so the wrappers above stay declarative.
// ---------------------------------------------------------------------------

fn value_str(v: &Value) -> Option<String> {
    match v {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Okay => Some("OK".to_string()),
        Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Int(n) => Some(*n),
        Value::BulkString(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
        _ => None,
    }
}

fn expect_tuple<'a>(op: &'static str, reply: &'a Value) -> Result<&'a [Value], QueueError> {
    match reply {
        Value::Array(items) if !items.is_empty() => Ok(items),
        other => Err(unexpected(op, other)),
    }
}

fn status_of(items: &[Value]) -> Option<&str> {
    match items.first() {
        Some(Value::BulkString(bytes)) => std::str::from_utf8(bytes).ok(),
        Some(Value::SimpleString(s)) => Some(s.as_str()),
        Some(Value::Okay) => Some("OK"),
        _ => None,
    }
}

fn unexpected(op: &'static str, reply: &Value) -> QueueError {
    QueueError::UnexpectedReply {
        op,
        detail: format!("{reply:?}"),
    }
}

fn err_of(op: &'static str, items: &[Value], job_id: &str, lane: &str) -> QueueError {
    let reason = items.get(1).and_then(value_str).unwrap_or_default();
    QueueError::from_reason(op, &reason, job_id, lane)
}

fn parse_reserve(reply: &Value) -> Result<ReserveOutcome, QueueError> {
    let items = expect_tuple("reserve", reply)?;
    match status_of(&items) {
        Some("EMPTY") => Ok(ReserveOutcome::Empty),
        Some("PAUSED") => Ok(ReserveOutcome::Paused),
        Some("JOB") if items.len() >= 7 => {
            let job = ReservedJob {
                job_id: value_str(&items[1]).ok_or_else(|| unexpected("reserve", reply))?,
                payload: value_str(&items[2]).unwrap_or_default(),
                lock_until_ms: value_i64(&items[3]).ok_or_else(|| unexpected("reserve", reply))?,
                attempt: value_i64(&items[4]).ok_or_else(|| unexpected("reserve", reply))? as u32,
                gid: value_str(&items[5]).unwrap_or_default(),
                lease_token: value_str(&items[6]).unwrap_or_default(),
            };
            if job.lease_token.is_empty() {
                return Err(unexpected("reserve", reply));
            }
            Ok(ReserveOutcome::Job(job))
        }
        _ => Err(unexpected("reserve", reply)),
    }
}

fn parse_ack_fail(reply: &Value, job_id: &str) -> Result<AckFailOutcome, QueueError> {
    let items = expect_tuple("ack_fail", reply)?;
    match status_of(&items) {
        Some("RETRY") if items.len() >= 2 => {
            let due_ms = value_i64(&items[1]).ok_or_else(|| unexpected("ack_fail", reply))?;
            Ok(AckFailOutcome::Retry { due_ms })
        }
        Some("FAILED") => Ok(AckFailOutcome::Failed),
        Some("ERR") => Err(err_of("ack_fail", &items, job_id, "")),
        _ => Err(unexpected("ack_fail", reply)),
    }
}

/// Batch replies are flat arrays: `jid, "OK"` pairs interleaved with
/// `jid, "ERR", reason` triples. A whole-call failure is a two-element
/// `ERR` tuple instead.
fn parse_batch(op: &'static str, reply: &Value) -> Result<Vec<BatchItem>, QueueError> {
    let items = match reply {
        Value::Array(items) => items,
        other => return Err(unexpected(op, other)),
    };

    if items.len() >= 2 {
        if let (Some("ERR"), Some(reason)) = (status_of(items), value_str(&items[1])) {
            return Err(QueueError::from_reason(op, &reason, "", ""));
        }
    }

    let mut out = Vec::new();
    let mut i = 0;
    while i < items.len() {
        let job_id = value_str(&items[i]).ok_or_else(|| unexpected(op, reply))?;
        let status = items
            .get(i + 1)
            .and_then(value_str)
            .ok_or_else(|| unexpected(op, reply))?;
        if status == "ERR" {
            let reason = items.get(i + 2).and_then(value_str);
            out.push(BatchItem {
                job_id,
                ok: false,
                reason,
            });
            i += 3;
        } else {
            out.push(BatchItem {
                job_id,
                ok: true,
                reason: None,
            });
            i += 2;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn reserve_parses_empty_and_paused() {
        assert!(matches!(
            parse_reserve(&Value::Array(vec![bulk("EMPTY")])).unwrap(),
            ReserveOutcome::Empty
        ));
        assert!(matches!(
            parse_reserve(&Value::Array(vec![bulk("PAUSED")])).unwrap(),
            ReserveOutcome::Paused
        ));
    }

    #[test]
    fn reserve_parses_a_job_tuple() {
        let reply = Value::Array(vec![
            bulk("JOB"),
            bulk("job-1"),
            bulk(r#"{"hello":"world"}"#),
            Value::Int(1_730_000_030_000),
            Value::Int(1),
            bulk(""),
            bulk("tok-abc"),
        ]);
        match parse_reserve(&reply).unwrap() {
            ReserveOutcome::Job(job) => {
                assert_eq!(job.job_id, "job-1");
                assert_eq!(job.payload, r#"{"hello":"world"}"#);
                assert_eq!(job.lock_until_ms, 1_730_000_030_000);
                assert_eq!(job.attempt, 1);
                assert_eq!(job.gid, "");
                assert_eq!(job.lease_token, "tok-abc");
            }
            other => panic!("wrong outcome: {other:?}"),
        }
    }

    #[test]
    fn reserve_rejects_a_tokenless_job() {
        let reply = Value::Array(vec![
            bulk("JOB"),
            bulk("job-1"),
            bulk("{}"),
            Value::Int(10),
            Value::Int(1),
            bulk(""),
            bulk(""),
        ]);
        assert!(matches!(
            parse_reserve(&reply),
            Err(QueueError::UnexpectedReply { op: "reserve", .. })
        ));
    }

    #[test]
    fn reserve_rejects_short_tuples() {
        let reply = Value::Array(vec![bulk("JOB"), bulk("job-1")]);
        assert!(parse_reserve(&reply).is_err());
        assert!(parse_reserve(&Value::Nil).is_err());
    }

    #[test]
    fn ack_fail_parses_retry_and_failed() {
        let retry = Value::Array(vec![bulk("RETRY"), Value::Int(1_730_000_000_100)]);
        assert_eq!(
            parse_ack_fail(&retry, "j1").unwrap(),
            AckFailOutcome::Retry {
                due_ms: 1_730_000_000_100
            }
        );

        let failed = Value::Array(vec![bulk("FAILED")]);
        assert_eq!(parse_ack_fail(&failed, "j1").unwrap(), AckFailOutcome::Failed);
    }

    #[test]
    fn ack_fail_maps_err_reasons() {
        let reply = Value::Array(vec![bulk("ERR"), bulk("TOKEN_MISMATCH")]);
        assert!(matches!(
            parse_ack_fail(&reply, "j1"),
            Err(QueueError::TokenMismatch { .. })
        ));
    }

    #[test]
    fn batch_parses_mixed_pairs_and_triples() {
        let reply = Value::Array(vec![
            bulk("a"),
            bulk("OK"),
            bulk("b"),
            bulk("ERR"),
            bulk("NOT_FAILED"),
            bulk("c"),
            bulk("OK"),
        ]);
        let out = parse_batch("retry_failed_batch", &reply).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out[0].ok && out[2].ok);
        assert!(!out[1].ok);
        assert_eq!(out[1].reason.as_deref(), Some("NOT_FAILED"));
    }

    #[test]
    fn batch_whole_call_error_is_typed() {
        let reply = Value::Array(vec![bulk("ERR"), bulk("BAD_LANE")]);
        assert!(matches!(
            parse_batch("remove_jobs_batch", &reply),
            Err(QueueError::BadLane(_))
        ));
    }

    #[test]
    fn empty_batch_reply_is_fine() {
        let out = parse_batch("remove_jobs_batch", &Value::Array(vec![])).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn batch_cap_is_enforced_client_side() {
        let ids: Vec<String> = (0..BATCH_MAX + 1).map(|i| format!("j{i}")).collect();
        assert!(matches!(
            check_batch(&ids),
            Err(QueueError::BatchTooLarge { len, max }) if len == BATCH_MAX + 1 && max == BATCH_MAX
        ));
        assert!(check_batch(&ids[..BATCH_MAX]).is_ok());
    }

    #[test]
    fn value_helpers_accept_the_common_shapes() {
        assert_eq!(value_str(&bulk("x")).as_deref(), Some("x"));
        assert_eq!(
            value_str(&Value::SimpleString("OK".into())).as_deref(),
            Some("OK")
        );
        assert_eq!(value_str(&Value::Okay).as_deref(), Some("OK"));
        assert_eq!(value_i64(&Value::Int(7)), Some(7));
        assert_eq!(value_i64(&bulk("42")), Some(42));
        assert_eq!(value_i64(&bulk("nope")), None);
        assert_eq!(value_i64(&Value::Nil), None);
    }
}
