//! # Simple Demo
//!
//! Publish a few jobs, then consume them with a handler that pretends to
//! work for two seconds. Point `REDIS_URL` at a store and run it.

use std::time::Duration;

use anyhow::Result;
use capstan_core::{Consumer, ConsumerConfig, JobContext, PublishOptions, QueueClient};
use tracing::info;

const QUEUE: &str = "demo";

async fn my_actions(ctx: JobContext) -> Result<()> {
    info!(
        job_id = %ctx.job_id(),
        attempt = ctx.attempt(),
        payload = %ctx.payload(),
        "working"
    );
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!(job_id = %ctx.job_id(), "done");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,capstan_core=debug")),
        )
        .init();

    let url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
    let client = QueueClient::connect(&url).await?;

    // Publish a handful of jobs up front.
    for i in 0..3 {
        let job_id = client
            .publish(
                QUEUE,
                &serde_json::json!({"hello": "world", "i": i}),
                PublishOptions::default(),
            )
            .await?;
        info!(%job_id, "published");
    }

    // Consume until every published job is done, then stop the loop.
    let consumer = Consumer::with_config(
        client.clone(),
        QUEUE,
        my_actions,
        ConsumerConfig::default(),
    );
    let stop = consumer.stop_token();

    let monitor = client.monitor();
    let watcher = tokio::spawn(async move {
        loop {
            match monitor.counts(QUEUE).await {
                Ok(counts) if counts.completed >= 3 => {
                    info!(completed = counts.completed, "all jobs done; stopping");
                    stop.cancel();
                    return;
                }
                _ => tokio::time::sleep(Duration::from_millis(250)).await,
            }
        }
    });

    consumer.run().await?;
    watcher.await?;
    Ok(())
}
