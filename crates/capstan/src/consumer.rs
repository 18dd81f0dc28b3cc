//! The consumer loop: reserve, heartbeat, run the handler, ack.
//!
//! One consumer binds one queue to one handler and processes a single job
//! at a time; horizontal scale comes from running more consumer processes,
//! which coordinate only through the store. Between reservations the loop
//! drives the two maintenance scripts (promote-delayed, reap-expired) on a
//! best-effort cadence.
//!
//! ```text
//! run()
//!   ├─► promote_delayed / reap_expired   (periodic, errors swallowed)
//!   ├─► reserve ──► EMPTY  → sleep(poll_interval)
//!   │          ──► PAUSED → sleep(paused backoff)
//!   │          ──► JOB ───┐
//!   │                     ├─► spawn heartbeat task (lease renewal)
//!   │                     ├─► handler.handle(ctx)
//!   │                     ├─► ack_success / ack_fail  (unless lease lost)
//!   │                     └─► stop heartbeat, bounded settle wait
//!   └─► stop requested → drain current job, exit
//! ```
//!
//! Stop is cooperative: SIGTERM (and the first interrupt, when draining)
//! raises a flag the loop checks between jobs. A running handler is never
//! interrupted; a second interrupt forces the process down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::QueueClient;
use crate::context::JobContext;
use crate::error::QueueError;
use crate::ops::DEFAULT_TIMEOUT_MS;
use crate::types::{AckFailOutcome, ReserveOutcome, ReservedJob};

/// Backoff after a failed reserve call.
const RESERVE_RETRY: Duration = Duration::from_millis(200);

/// A unit of work. Return `Ok(())` to ack success; any error becomes the
/// job's recorded failure and triggers the retry/backoff policy.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()>;
}

/// Async closures work as handlers directly.
#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// Loop configuration. The defaults suit short jobs on a local store.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub poll_interval: Duration,
    pub promote_interval: Duration,
    pub promote_batch: u32,
    pub reap_interval: Duration,
    pub reap_batch: u32,
    /// Explicit heartbeat cadence; derived from the job's timeout when
    /// unset (half the timeout, clamped to 1-10s).
    pub heartbeat_interval: Option<Duration>,
    /// Finish the in-hand job before exiting on stop. When off, a pending
    /// stop right after reserve abandons the job to the reaper.
    pub drain: bool,
    /// Install SIGTERM/interrupt handlers. Turn off when the hosting
    /// process owns signal dispatch.
    pub handle_signals: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            promote_interval: Duration::from_secs(1),
            promote_batch: 1000,
            reap_interval: Duration::from_secs(1),
            reap_batch: 1000,
            heartbeat_interval: None,
            drain: true,
            handle_signals: true,
        }
    }
}

/// Backoff while the queue is paused: harder than the empty-queue poll so
/// a paused fleet stops hammering the store.
pub(crate) fn paused_backoff(poll_interval: Duration) -> Duration {
    std::cmp::max(Duration::from_millis(250), poll_interval.saturating_mul(10))
}

/// Half the job timeout, clamped to 1-10s.
pub(crate) fn derive_heartbeat_interval(timeout_ms: i64) -> Duration {
    let half_s = (timeout_ms as f64 / 1000.0) / 2.0;
    Duration::from_secs_f64(half_s.clamp(1.0, 10.0))
}

/// How long to wait for the heartbeat task to notice the stop signal.
pub(crate) fn settle_timeout(heartbeat_interval: Duration) -> Duration {
    heartbeat_interval
        .mul_f64(1.5)
        .clamp(Duration::from_millis(200), Duration::from_secs(2))
}

/// One queue, one handler, one job at a time.
pub struct Consumer {
    client: QueueClient,
    queue: String,
    handler: Arc<dyn JobHandler>,
    config: ConsumerConfig,
    stop: CancellationToken,
}

impl Consumer {
    pub fn new<H: JobHandler + 'static>(client: QueueClient, queue: &str, handler: H) -> Self {
        Self::with_config(client, queue, handler, ConsumerConfig::default())
    }

    pub fn with_config<H: JobHandler + 'static>(
        client: QueueClient,
        queue: &str,
        handler: H,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            client,
            queue: queue.to_string(),
            handler: Arc::new(handler),
            config,
            stop: CancellationToken::new(),
        }
    }

    /// Token that stops the loop after the current job; usable from other
    /// tasks (tests, embedding processes).
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run until a stop is requested. Transient store errors are retried
    /// in-loop; this only returns after a graceful stop.
    pub async fn run(&self) -> Result<(), QueueError> {
        let signal_task = if self.config.handle_signals {
            Some(spawn_signal_listener(self.stop.clone(), self.config.drain))
        } else {
            None
        };

        info!(queue = %self.queue, drain = self.config.drain, "consumer starting");

        // Fire maintenance on the first pass, then on their intervals.
        let mut last_promote: Option<Instant> = None;
        let mut last_reap: Option<Instant> = None;

        loop {
            if self.stop.is_cancelled() {
                info!(queue = %self.queue, "stop requested; exiting (idle)");
                break;
            }

            if last_promote.map_or(true, |t| t.elapsed() >= self.config.promote_interval) {
                // best-effort; self-healing on the next tick
                if let Err(err) = self
                    .client
                    .promote_delayed(&self.queue, self.config.promote_batch)
                    .await
                {
                    debug!(queue = %self.queue, error = %err, "promote_delayed failed");
                }
                last_promote = Some(Instant::now());
            }

            if last_reap.map_or(true, |t| t.elapsed() >= self.config.reap_interval) {
                if let Err(err) = self
                    .client
                    .reap_expired(&self.queue, self.config.reap_batch)
                    .await
                {
                    debug!(queue = %self.queue, error = %err, "reap_expired failed");
                }
                last_reap = Some(Instant::now());
            }

            let job = match self.client.reserve(&self.queue).await {
                Ok(ReserveOutcome::Job(job)) => job,
                Ok(ReserveOutcome::Empty) => {
                    self.sleep_or_stop(self.config.poll_interval).await;
                    continue;
                }
                Ok(ReserveOutcome::Paused) => {
                    self.sleep_or_stop(paused_backoff(self.config.poll_interval))
                        .await;
                    continue;
                }
                Err(err) => {
                    warn!(queue = %self.queue, error = %err, "reserve failed");
                    self.sleep_or_stop(RESERVE_RETRY).await;
                    continue;
                }
            };

            if self.stop.is_cancelled() && !self.config.drain {
                // The lease is never acked; reap_expired hands the job to
                // another consumer once it lapses.
                info!(queue = %self.queue, job_id = %job.job_id, "stop requested; leaving job to the reaper");
                break;
            }

            self.process(job).await;

            if self.stop.is_cancelled() && self.config.drain {
                info!(queue = %self.queue, "stop requested; exiting after drain");
                break;
            }
        }

        if let Some(task) = signal_task {
            task.abort();
        }
        info!(queue = %self.queue, "consumer stopped");
        Ok(())
    }

    async fn process(&self, job: ReservedJob) {
        let ctx = JobContext::new(self.client.clone(), &self.queue, &job);
        debug!(
            queue = %self.queue,
            job_id = %job.job_id,
            attempt = job.attempt,
            gid = %job.gid,
            "job reserved"
        );

        let hb_interval = match self.config.heartbeat_interval {
            Some(interval) => interval,
            None => {
                let timeout_ms = self
                    .client
                    .ops()
                    .job_timeout_ms(&self.queue, &job.job_id, DEFAULT_TIMEOUT_MS)
                    .await
                    .unwrap_or(DEFAULT_TIMEOUT_MS);
                derive_heartbeat_interval(timeout_ms)
            }
        };

        let heartbeat = HeartbeatGuard::spawn(
            self.client.clone(),
            self.queue.clone(),
            job.job_id.clone(),
            job.lease_token.clone(),
            hb_interval,
        );

        let outcome = self.handler.handle(ctx).await;

        if heartbeat.lease_lost() {
            // Another consumer owns the job now; any ack would be wrong.
            warn!(queue = %self.queue, job_id = %job.job_id, "lease lost; skipping ack");
        } else {
            match outcome {
                Ok(()) => {
                    match self
                        .client
                        .ack_success(&self.queue, &job.job_id, &job.lease_token)
                        .await
                    {
                        Ok(()) => debug!(queue = %self.queue, job_id = %job.job_id, "job completed"),
                        Err(err) => {
                            warn!(queue = %self.queue, job_id = %job.job_id, error = %err, "ack_success failed")
                        }
                    }
                }
                Err(handler_err) => {
                    let message = format!("{handler_err:#}");
                    match self
                        .client
                        .ack_fail(&self.queue, &job.job_id, &job.lease_token, Some(&message))
                        .await
                    {
                        Ok(AckFailOutcome::Retry { due_ms }) => {
                            warn!(
                                queue = %self.queue,
                                job_id = %job.job_id,
                                attempt = job.attempt,
                                due_ms,
                                error = %message,
                                "job failed; retry scheduled"
                            );
                        }
                        Ok(AckFailOutcome::Failed) => {
                            warn!(
                                queue = %self.queue,
                                job_id = %job.job_id,
                                attempt = job.attempt,
                                error = %message,
                                "job failed permanently"
                            );
                        }
                        Err(err) => {
                            warn!(queue = %self.queue, job_id = %job.job_id, error = %err, "ack_fail failed")
                        }
                    }
                }
            }
        }

        heartbeat.settle(settle_timeout(hb_interval)).await;
    }

    async fn sleep_or_stop(&self, duration: Duration) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat task
// ---------------------------------------------------------------------------

/// Keeps one job's lease alive while the handler runs. Beats immediately,
/// then on the interval; exits on stop or when the lease is observed lost.
struct HeartbeatGuard {
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatGuard {
    fn spawn(
        client: QueueClient,
        queue: String,
        job_id: String,
        lease_token: String,
        interval: Duration,
    ) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();

        let task = tokio::spawn({
            let lost = lost.clone();
            let stop = stop.clone();
            async move {
                let retry = std::cmp::min(Duration::from_millis(200), interval);
                loop {
                    match client.heartbeat(&queue, &job_id, &lease_token).await {
                        Ok(lock_until_ms) => {
                            debug!(queue = %queue, job_id = %job_id, lock_until_ms, "lease extended");
                        }
                        Err(err) if err.is_lease_lost() => {
                            warn!(queue = %queue, job_id = %job_id, error = %err, "lease lost");
                            lost.store(true, Ordering::SeqCst);
                            return;
                        }
                        Err(err) => {
                            if stop.is_cancelled() {
                                return;
                            }
                            debug!(queue = %queue, job_id = %job_id, error = %err, "heartbeat error; retrying");
                            tokio::select! {
                                _ = stop.cancelled() => return,
                                _ = tokio::time::sleep(retry) => {}
                            }
                            continue;
                        }
                    }
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        });

        Self { lost, stop, task }
    }

    fn lease_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Signal the task and wait briefly for it to wind down. A task that
    /// misses the window is detached; it observes the token on its next
    /// poll and exits.
    async fn settle(self, timeout: Duration) {
        self.stop.cancel();
        let _ = tokio::time::timeout(timeout, self.task).await;
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[cfg(unix)]
async fn wait_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_sigterm() {
    std::future::pending::<()>().await;
}

fn spawn_signal_listener(stop: CancellationToken, drain: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interrupts: u32 = 0;
        loop {
            tokio::select! {
                _ = wait_sigterm() => {
                    info!("SIGTERM received; stopping");
                    stop.cancel();
                }
                result = tokio::signal::ctrl_c(), if drain => {
                    if result.is_err() {
                        return;
                    }
                    interrupts += 1;
                    if interrupts >= 2 {
                        info!("second interrupt; exiting now");
                        std::process::exit(130);
                    }
                    info!("interrupt received; draining current job then exiting");
                    stop.cancel();
                }
            }
        }
    })
}
