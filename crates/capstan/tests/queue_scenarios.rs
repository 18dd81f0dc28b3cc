//! End-to-end scenarios against a live Redis.
//!
//! These exercise the whole engine through the public API: scripts,
//! façade, consumer loop, and monitor. They are ignored by default so the
//! unit suite stays hermetic; run them with a store available:
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1:6379/0 cargo test -p capstan-core -- --ignored
//! ```

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capstan_core::{
    AckFailOutcome, Consumer, ConsumerConfig, JobContext, Lane, PublishOptions, QueueClient,
    QueueError, ReserveOutcome,
};
use capstan_testing::{wait_until, TestQueue};

fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        handle_signals: false,
        ..ConsumerConfig::default()
    }
}

async fn reserve_job(client: &QueueClient, queue: &str) -> capstan_core::ReservedJob {
    match client.reserve(queue).await.expect("reserve") {
        ReserveOutcome::Job(job) => job,
        other => panic!("expected a job, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at REDIS_URL"]
async fn basic_publish_consume() {
    let harness = TestQueue::connect("basic").await.unwrap();
    let client = harness.client().clone();
    let queue = harness.queue().to_string();

    client
        .publish(
            &queue,
            &serde_json::json!({"hello": "world"}),
            PublishOptions {
                timeout_ms: 30_000,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let runs = Arc::new(AtomicU32::new(0));
    let handler = {
        let runs = runs.clone();
        move |ctx: JobContext| {
            let runs = runs.clone();
            async move {
                assert_eq!(ctx.payload()["hello"], "world");
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(())
            }
        }
    };

    let consumer = Consumer::with_config(client.clone(), &queue, handler, test_config());
    let stop = consumer.stop_token();
    let loop_task = tokio::spawn(async move { consumer.run().await });

    let monitor = client.monitor();
    let done = wait_until(Duration::from_secs(10), || {
        let monitor = monitor.clone();
        let queue = queue.clone();
        async move {
            monitor
                .counts(&queue)
                .await
                .map(|c| c.completed == 1)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(done, "job never completed");

    stop.cancel();
    loop_task.await.unwrap().unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1, "handler ran more than once");
    let counts = client.monitor().counts(harness.queue()).await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.waiting, 0);
    assert_eq!(counts.active, 0);

    harness.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at REDIS_URL"]
async fn retry_then_success() {
    let harness = TestQueue::connect("retry").await.unwrap();
    let client = harness.client().clone();
    let queue = harness.queue().to_string();

    let job_id = client
        .publish(
            &queue,
            &serde_json::json!({"step": "flaky"}),
            PublishOptions {
                max_attempts: 3,
                backoff_ms: 100,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let handler = move |ctx: JobContext| async move {
        if ctx.attempt() < 3 {
            anyhow::bail!("transient failure on attempt {}", ctx.attempt());
        }
        Ok(())
    };

    let consumer = Consumer::with_config(client.clone(), &queue, handler, test_config());
    let stop = consumer.stop_token();
    let loop_task = tokio::spawn(async move { consumer.run().await });

    let monitor = client.monitor();
    let done = wait_until(Duration::from_secs(10), || {
        let monitor = monitor.clone();
        let queue = queue.clone();
        async move {
            monitor
                .counts(&queue)
                .await
                .map(|c| c.completed == 1)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(done, "job never completed after retries");

    stop.cancel();
    loop_task.await.unwrap().unwrap();

    let info = client
        .monitor()
        .get_job(harness.queue(), &job_id)
        .await
        .unwrap()
        .expect("job record");
    assert_eq!(info.state, "completed");
    assert_eq!(info.attempt, 3);

    harness.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at REDIS_URL"]
async fn lease_expiry_recovery() {
    let harness = TestQueue::connect("lease").await.unwrap();
    let client = harness.client();
    let queue = harness.queue();

    client
        .publish(
            queue,
            &serde_json::json!({"work": 1}),
            PublishOptions {
                timeout_ms: 500,
                backoff_ms: 0,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Consumer A reserves and then "crashes": no heartbeat, no ack.
    let first = reserve_job(client, queue).await;
    assert_eq!(first.attempt, 1);

    tokio::time::sleep(Duration::from_millis(700)).await;

    let reaped = client.reap_expired(queue, 100).await.unwrap();
    assert_eq!(reaped, 1);
    let promoted = client.promote_delayed(queue, 100).await.unwrap();
    assert_eq!(promoted, 1);

    // Consumer B picks the job up with a fresh lease.
    let second = reserve_job(client, queue).await;
    assert_eq!(second.job_id, first.job_id);
    assert_eq!(second.attempt, 2);
    assert_ne!(second.lease_token, first.lease_token);

    // A's stale ack must bounce.
    let stale = client
        .ack_success(queue, &first.job_id, &first.lease_token)
        .await;
    assert!(matches!(stale, Err(QueueError::TokenMismatch { .. })));

    // B's ack goes through.
    client
        .ack_success(queue, &second.job_id, &second.lease_token)
        .await
        .unwrap();

    harness.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at REDIS_URL"]
async fn pause_excludes_new_work() {
    let harness = TestQueue::connect("pause").await.unwrap();
    let client = harness.client();
    let queue = harness.queue();

    for i in 0..2 {
        client
            .publish(queue, &serde_json::json!({"i": i}), PublishOptions::default())
            .await
            .unwrap();
    }

    let inflight = reserve_job(client, queue).await;

    client.pause(queue).await.unwrap();
    assert!(client.is_paused(queue).await.unwrap());
    assert!(matches!(
        client.reserve(queue).await.unwrap(),
        ReserveOutcome::Paused
    ));

    // The in-flight job is untouched: its lease still acks cleanly.
    client
        .ack_success(queue, &inflight.job_id, &inflight.lease_token)
        .await
        .unwrap();

    assert!(client.resume(queue).await.unwrap());
    assert!(!client.resume(queue).await.unwrap());
    assert!(!client.is_paused(queue).await.unwrap());

    let next = reserve_job(client, queue).await;
    assert_ne!(next.job_id, inflight.job_id);

    harness.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at REDIS_URL"]
async fn child_fanout_counter() {
    let harness = TestQueue::connect("childs").await.unwrap();
    let client = harness.client();
    let key = capstan_testing::unique_queue("document");

    client.childs_init(&key, 5).await.unwrap();

    let mut seen = Vec::new();
    for page in 1..=5 {
        let remaining = client
            .child_ack(&key, &format!("page-{page}"))
            .await
            .unwrap();
        seen.push(remaining);
    }
    assert_eq!(seen, vec![4, 3, 2, 1, 0]);

    // Repeated ack of a known child: idempotent, same remaining.
    assert_eq!(client.child_ack(&key, "page-3").await.unwrap(), 0);
    // A surplus child cannot push the counter below zero.
    assert_eq!(client.child_ack(&key, "page-6").await.unwrap(), 0);
    // An uninitialized counter reports -1.
    assert_eq!(
        client.child_ack("no-such-counter-xyz", "c1").await.unwrap(),
        -1
    );

    // Re-arming resets both the counter and the acked set.
    client.childs_init(&key, 2).await.unwrap();
    assert_eq!(client.child_ack(&key, "page-1").await.unwrap(), 1);

    // Counter keys live outside the queue's hash tag; drop them by hand.
    let mut conn = client.ops().connection();
    let _: i64 = redis::cmd("DEL")
        .arg(format!("{{cc:{key}}}:remaining"))
        .arg(format!("{{cc:{key}}}:acked"))
        .query_async(&mut conn)
        .await
        .unwrap();

    harness.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at REDIS_URL"]
async fn group_concurrency_cap() {
    let harness = TestQueue::connect("group").await.unwrap();
    let client = harness.client().clone();
    let queue = harness.queue().to_string();

    for i in 0..3 {
        client
            .publish(
                &queue,
                &serde_json::json!({"idx": i}),
                PublishOptions {
                    gid: Some("G".into()),
                    group_limit: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let ready = client.monitor().groups_ready(&queue, 10).await.unwrap();
    assert!(ready.contains(&"G".to_string()));
    let status = client
        .monitor()
        .group_status(&queue, &["G".to_string()], 1)
        .await
        .unwrap();
    assert_eq!(status[0].inflight, 0);
    assert_eq!(status[0].limit, 1);

    let inflight = Arc::new(AtomicI64::new(0));
    let peak = Arc::new(AtomicI64::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let make_handler = || {
        let inflight = inflight.clone();
        let peak = peak.clone();
        let order = order.clone();
        move |ctx: JobContext| {
            let inflight = inflight.clone();
            let peak = peak.clone();
            let order = order.clone();
            async move {
                let current = inflight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                order
                    .lock()
                    .unwrap()
                    .push(ctx.payload()["idx"].as_i64().unwrap());
                tokio::time::sleep(Duration::from_millis(200)).await;
                inflight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }
    };

    // Two consumers racing over one group with limit 1.
    let consumer_a = Consumer::with_config(client.clone(), &queue, make_handler(), test_config());
    let consumer_b = Consumer::with_config(client.clone(), &queue, make_handler(), test_config());
    let stop_a = consumer_a.stop_token();
    let stop_b = consumer_b.stop_token();
    let task_a = tokio::spawn(async move { consumer_a.run().await });
    let task_b = tokio::spawn(async move { consumer_b.run().await });

    let monitor = client.monitor();
    let done = wait_until(Duration::from_secs(15), || {
        let monitor = monitor.clone();
        let queue = queue.clone();
        async move {
            monitor
                .counts(&queue)
                .await
                .map(|c| c.completed == 3)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(done, "group jobs never all completed");

    stop_a.cancel();
    stop_b.cancel();
    task_a.await.unwrap().unwrap();
    task_b.await.unwrap().unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 1, "group cap was breached");
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2], "group order not FIFO");

    harness.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at REDIS_URL"]
async fn admin_retry_remove_and_monitor_views() {
    let harness = TestQueue::connect("admin").await.unwrap();
    let client = harness.client();
    let queue = harness.queue();

    // Drive a job into the failed lane by hand.
    let job_id = client
        .publish(
            queue,
            &serde_json::json!({"doomed": true}),
            PublishOptions {
                max_attempts: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = reserve_job(client, queue).await;
    let outcome = client
        .ack_fail(queue, &job.job_id, &job.lease_token, Some("boom: it broke"))
        .await
        .unwrap();
    assert_eq!(outcome, AckFailOutcome::Failed);

    let counts = client.monitor().counts(queue).await.unwrap();
    assert_eq!(counts.failed, 1);

    let failed = client.monitor().sample_failed(queue, 10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].job_id, job_id);
    assert_eq!(failed[0].last_error, "boom: it broke");
    assert!(failed[0].failed_at_ms > 0);

    // Retrying resets the attempt budget.
    client.retry_failed(queue, &job_id).await.unwrap();
    let retried = reserve_job(client, queue).await;
    assert_eq!(retried.attempt, 1);
    client
        .ack_success(queue, &retried.job_id, &retried.lease_token)
        .await
        .unwrap();

    // Batch retry reports per-id outcomes.
    let report = client
        .retry_failed_batch(queue, &[job_id.clone(), "missing-id".to_string()])
        .await
        .unwrap();
    assert_eq!(report.len(), 2);
    assert!(!report[0].ok, "completed job is not retryable");
    assert_eq!(report[1].reason.as_deref(), Some("NOT_FAILED"));

    // Lane-checked removal.
    let wrong = client.remove_job(queue, &job_id, Lane::Failed).await;
    assert!(matches!(wrong, Err(QueueError::WrongLane { .. })));
    client
        .remove_job(queue, &job_id, Lane::Completed)
        .await
        .unwrap();
    assert!(client
        .monitor()
        .get_job(queue, &job_id)
        .await
        .unwrap()
        .is_none());
    let gone = client.remove_job(queue, &job_id, Lane::Completed).await;
    assert!(matches!(gone, Err(QueueError::NotFound { .. })));

    harness.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at REDIS_URL"]
async fn delayed_jobs_promote_in_due_order() {
    let harness = TestQueue::connect("delayed").await.unwrap();
    let client = harness.client();
    let queue = harness.queue();

    let now_ms = chrono_now_ms();
    let late = client
        .publish(
            queue,
            &serde_json::json!({"slot": "late"}),
            PublishOptions {
                due_ms: now_ms + 400,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let early = client
        .publish(
            queue,
            &serde_json::json!({"slot": "early"}),
            PublishOptions {
                due_ms: now_ms + 200,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let counts = client.monitor().counts(queue).await.unwrap();
    assert_eq!(counts.delayed, 2);
    assert_eq!(counts.waiting, 0);

    let samples = client.monitor().sample_delayed(queue, 10).await.unwrap();
    assert_eq!(samples[0].job_id, early, "delayed set must order by due time");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.promote_delayed(queue, 100).await.unwrap(), 2);

    // Earliest due first, even though it was published second.
    assert_eq!(reserve_job(client, queue).await.job_id, early);
    assert_eq!(reserve_job(client, queue).await.job_id, late);

    harness.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at REDIS_URL"]
async fn publish_is_idempotent_and_heartbeat_guards_hold() {
    let harness = TestQueue::connect("lease-guards").await.unwrap();
    let client = harness.client();
    let queue = harness.queue();

    let id_a = client
        .publish(
            queue,
            &serde_json::json!({"v": 1}),
            PublishOptions {
                job_id: Some("fixed-id".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let id_b = client
        .publish(
            queue,
            &serde_json::json!({"v": 2}),
            PublishOptions {
                job_id: Some("fixed-id".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(id_a, id_b);
    assert_eq!(client.monitor().counts(queue).await.unwrap().waiting, 1);

    let job = reserve_job(client, queue).await;
    let extended = client
        .heartbeat(queue, &job.job_id, &job.lease_token)
        .await
        .unwrap();
    assert!(extended >= job.lock_until_ms);

    let wrong_token = client.heartbeat(queue, &job.job_id, "bogus-token").await;
    assert!(matches!(wrong_token, Err(QueueError::TokenMismatch { .. })));

    let not_active = client.heartbeat(queue, "never-reserved", "token").await;
    assert!(matches!(not_active, Err(QueueError::NotActive { .. })));

    client
        .ack_success(queue, &job.job_id, &job.lease_token)
        .await
        .unwrap();

    harness.flush().await.unwrap();
}

fn chrono_now_ms() -> i64 {
    capstan_core::Clock::system().now_ms()
}
