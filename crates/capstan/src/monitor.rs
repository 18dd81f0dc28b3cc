//! Read-only monitoring views: counts, group status, lane samples, and
//! single-job inspection.
//!
//! Pure observers over side keys - nothing here participates in the state
//! machine, and a snapshot may be stale by the time it is read. Missing
//! fields degrade to zero/empty rather than erroring, so dashboards keep
//! rendering while jobs churn underneath them.

use redis::aio::ConnectionManager;

use crate::error::QueueError;
use crate::keys::{
    active_key, completed_key, delayed_key, failed_key, group_inflight_key, group_limit_key,
    groups_ready_key, job_key, paused_key, queue_base, wait_key,
};

/// Upper bound on `groups_ready` listings.
pub const GROUPS_READY_MAX: usize = 2000;
/// Upper bound on lane samples.
pub const SAMPLE_MAX: usize = 500;

/// Per-lane totals for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounts {
    pub paused: bool,
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStatus {
    pub gid: String,
    pub inflight: u64,
    pub limit: u64,
}

#[derive(Debug, Clone)]
pub struct ActiveSample {
    pub job_id: String,
    pub gid: String,
    pub lock_until_ms: i64,
    pub attempt: u32,
}

#[derive(Debug, Clone)]
pub struct DelayedSample {
    pub job_id: String,
    pub gid: String,
    pub due_ms: i64,
    pub attempt: u32,
}

#[derive(Debug, Clone)]
pub struct FailedSample {
    pub job_id: String,
    pub gid: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub failed_at_ms: i64,
    pub last_error: String,
}

/// Everything the store holds about one job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub job_id: String,
    pub state: String,
    pub gid: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout_ms: i64,
    pub backoff_ms: i64,
    pub lease_token: String,
    pub lock_until_ms: i64,
    pub due_ms: i64,
    pub payload: String,
    pub last_error: String,
    pub updated_ms: i64,
}

/// Read-only views over a queue's side keys.
#[derive(Clone)]
pub struct QueueMonitor {
    conn: ConnectionManager,
}

impl QueueMonitor {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        let base = queue_base(queue);
        let mut conn = self.conn.clone();

        let paused: i64 = redis::cmd("EXISTS")
            .arg(paused_key(&base))
            .query_async(&mut conn)
            .await?;
        let waiting: u64 = redis::cmd("LLEN")
            .arg(wait_key(&base))
            .query_async(&mut conn)
            .await?;
        let active: u64 = redis::cmd("ZCARD")
            .arg(active_key(&base))
            .query_async(&mut conn)
            .await?;
        let delayed: u64 = redis::cmd("ZCARD")
            .arg(delayed_key(&base))
            .query_async(&mut conn)
            .await?;
        let completed: u64 = redis::cmd("LLEN")
            .arg(completed_key(&base))
            .query_async(&mut conn)
            .await?;
        let failed: u64 = redis::cmd("LLEN")
            .arg(failed_key(&base))
            .query_async(&mut conn)
            .await?;

        Ok(QueueCounts {
            paused: paused == 1,
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }

    /// Group ids currently marked ready, soonest-scheduled first.
    pub async fn groups_ready(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<String>, QueueError> {
        let base = queue_base(queue);
        let limit = limit.clamp(1, GROUPS_READY_MAX);
        let mut conn = self.conn.clone();

        let gids: Vec<String> = redis::cmd("ZRANGE")
            .arg(groups_ready_key(&base))
            .arg(0)
            .arg((limit - 1) as i64)
            .query_async(&mut conn)
            .await?;
        Ok(gids.into_iter().filter(|g| !g.is_empty()).collect())
    }

    /// Inflight/limit per group. Groups without a stored cap report
    /// `default_limit`.
    pub async fn group_status(
        &self,
        queue: &str,
        gids: &[String],
        default_limit: u64,
    ) -> Result<Vec<GroupStatus>, QueueError> {
        let base = queue_base(queue);
        let mut conn = self.conn.clone();

        let mut out = Vec::with_capacity(gids.len());
        for gid in gids {
            let inflight: Option<String> = redis::cmd("GET")
                .arg(group_inflight_key(&base, gid))
                .query_async(&mut conn)
                .await?;
            let limit: Option<String> = redis::cmd("GET")
                .arg(group_limit_key(&base, gid))
                .query_async(&mut conn)
                .await?;

            let inflight = parse_u64(inflight);
            let stored_limit = parse_u64(limit);
            out.push(GroupStatus {
                gid: gid.clone(),
                inflight,
                limit: if stored_limit > 0 {
                    stored_limit
                } else {
                    default_limit
                },
            });
        }
        Ok(out)
    }

    /// Leased jobs ordered by soonest lease expiry.
    pub async fn sample_active(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<ActiveSample>, QueueError> {
        let base = queue_base(queue);
        let entries = self
            .zrange_with_scores(&active_key(&base), limit.clamp(1, SAMPLE_MAX))
            .await?;

        let mut out = Vec::with_capacity(entries.len());
        for (job_id, score) in entries {
            let (gid, attempt) = self.gid_and_attempt(&base, &job_id).await?;
            out.push(ActiveSample {
                job_id,
                gid,
                lock_until_ms: score,
                attempt,
            });
        }
        Ok(out)
    }

    /// Scheduled jobs ordered by due time.
    pub async fn sample_delayed(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DelayedSample>, QueueError> {
        let base = queue_base(queue);
        let entries = self
            .zrange_with_scores(&delayed_key(&base), limit.clamp(1, SAMPLE_MAX))
            .await?;

        let mut out = Vec::with_capacity(entries.len());
        for (job_id, score) in entries {
            let (gid, attempt) = self.gid_and_attempt(&base, &job_id).await?;
            out.push(DelayedSample {
                job_id,
                gid,
                due_ms: score,
                attempt,
            });
        }
        Ok(out)
    }

    /// Most recently failed jobs first.
    pub async fn sample_failed(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<FailedSample>, QueueError> {
        let base = queue_base(queue);
        let limit = limit.clamp(1, SAMPLE_MAX);
        let mut conn = self.conn.clone();

        let job_ids: Vec<String> = redis::cmd("LRANGE")
            .arg(failed_key(&base))
            .arg(0)
            .arg((limit - 1) as i64)
            .query_async(&mut conn)
            .await?;

        let mut out = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            let fields: Vec<Option<String>> = redis::cmd("HMGET")
                .arg(job_key(&base, &job_id))
                .arg("gid")
                .arg("attempt")
                .arg("max_attempts")
                .arg("last_error")
                .arg("last_error_ms")
                .arg("updated_ms")
                .query_async(&mut conn)
                .await?;

            let field = |i: usize| fields.get(i).cloned().flatten();
            let last_error_ms = parse_i64(field(4));
            let failed_at_ms = if last_error_ms > 0 {
                last_error_ms
            } else {
                parse_i64(field(5))
            };

            out.push(FailedSample {
                job_id,
                gid: field(0).unwrap_or_default(),
                attempt: parse_u64(field(1)) as u32,
                max_attempts: parse_u64(field(2)) as u32,
                failed_at_ms,
                last_error: field(3).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    /// Full record for one job, `None` when it does not exist.
    pub async fn get_job(&self, queue: &str, job_id: &str) -> Result<Option<JobInfo>, QueueError> {
        let base = queue_base(queue);
        let key = job_key(&base, job_id);
        let mut conn = self.conn.clone();

        let exists: i64 = redis::cmd("EXISTS").arg(&key).query_async(&mut conn).await?;
        if exists != 1 {
            return Ok(None);
        }

        let fields: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&key)
            .arg("state")
            .arg("gid")
            .arg("attempt")
            .arg("max_attempts")
            .arg("timeout_ms")
            .arg("backoff_ms")
            .arg("lease_token")
            .arg("lock_until_ms")
            .arg("due_ms")
            .arg("payload")
            .arg("last_error")
            .arg("updated_ms")
            .query_async(&mut conn)
            .await?;

        let field = |i: usize| fields.get(i).cloned().flatten();
        Ok(Some(JobInfo {
            job_id: job_id.to_string(),
            state: field(0).unwrap_or_default(),
            gid: field(1).unwrap_or_default(),
            attempt: parse_u64(field(2)) as u32,
            max_attempts: parse_u64(field(3)) as u32,
            timeout_ms: parse_i64(field(4)),
            backoff_ms: parse_i64(field(5)),
            lease_token: field(6).unwrap_or_default(),
            lock_until_ms: parse_i64(field(7)),
            due_ms: parse_i64(field(8)),
            payload: field(9).unwrap_or_default(),
            last_error: field(10).unwrap_or_default(),
            updated_ms: parse_i64(field(11)),
        }))
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, QueueError> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg((limit - 1) as i64)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(entries
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn gid_and_attempt(&self, base: &str, job_id: &str) -> Result<(String, u32), QueueError> {
        let mut conn = self.conn.clone();
        let fields: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(job_key(base, job_id))
            .arg("gid")
            .arg("attempt")
            .query_async(&mut conn)
            .await?;
        let gid = fields.first().cloned().flatten().unwrap_or_default();
        let attempt = parse_u64(fields.get(1).cloned().flatten()) as u32;
        Ok((gid, attempt))
    }
}

fn parse_u64(raw: Option<String>) -> u64 {
    raw.and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn parse_i64(raw: Option<String>) -> i64 {
    raw.and_then(|s| s.parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_fields_degrade_to_zero() {
        assert_eq!(parse_u64(None), 0);
        assert_eq!(parse_u64(Some("".into())), 0);
        assert_eq!(parse_u64(Some("17".into())), 17);
        assert_eq!(parse_i64(Some("-3".into())), -3);
        assert_eq!(parse_i64(Some("junk".into())), 0);
    }

    #[test]
    fn sample_limits_clamp_into_range() {
        assert_eq!(0usize.clamp(1, SAMPLE_MAX), 1);
        assert_eq!(10_000usize.clamp(1, SAMPLE_MAX), SAMPLE_MAX);
        assert_eq!(5_000usize.clamp(1, GROUPS_READY_MAX), GROUPS_READY_MAX);
    }
}
