//! Test harness for queue integration tests and demos.
//!
//! Gives each test its own uniquely named queue on the store at
//! `REDIS_URL` (default `redis://127.0.0.1:6379/0`) and cleans the
//! queue's keys up afterwards, so suites can run back to back against one
//! shared Redis.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use capstan_core::{queue_base, QueueClient};

/// Store URL for tests: `REDIS_URL` or a local default.
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string())
}

/// A uniquely named queue on the test store.
pub struct TestQueue {
    client: QueueClient,
    queue: String,
}

impl TestQueue {
    /// Connect and mint a fresh queue name under `prefix`.
    pub async fn connect(prefix: &str) -> Result<Self> {
        let client = QueueClient::connect(&redis_url()).await?;
        let queue = unique_queue(prefix);
        Ok(Self { client, queue })
    }

    pub fn client(&self) -> &QueueClient {
        &self.client
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Delete every key belonging to this queue (lanes, flags, job
    /// records, group counters). All of them share the queue's hash tag,
    /// so one MATCH pattern covers the lot.
    pub async fn flush(&self) -> Result<()> {
        let pattern = format!("{}:*", queue_base(&self.queue));
        let mut conn = self.client.ops().connection();

        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let mut del = redis::cmd("DEL");
                for key in &keys {
                    del.arg(key);
                }
                let _: i64 = del.query_async(&mut conn).await?;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(())
    }
}

/// A queue name that will not collide across concurrently running tests.
pub fn unique_queue(prefix: &str) -> String {
    format!("{prefix}-{:08x}{:08x}", fastrand::u32(..), fastrand::u32(..))
}

/// Poll `condition` every 25ms until it holds or `timeout` elapses.
/// Returns whether the condition was observed.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
