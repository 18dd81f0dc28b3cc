//! # Child Fan-Out Demo
//!
//! A document job fans out into one job per page and uses the
//! child-completion counter to detect when the last page finishes:
//!
//! - the `documents` handler arms the counter and publishes the page jobs
//! - each `pages` handler acknowledges its page; the one that sees the
//!   counter hit zero publishes the assembled result
//!
//! The counter is a join primitive, not a dependency graph - deciding what
//! "all pages done" means is this demo's job, not the queue's.

use std::time::Duration;

use anyhow::Result;
use capstan_core::{Consumer, ConsumerConfig, JobContext, PublishOptions, QueueClient};
use tracing::info;

const DOCUMENTS: &str = "documents";
const PAGES: &str = "pages";
const ASSEMBLED: &str = "assembled";
const PAGE_COUNT: u32 = 5;

async fn document_worker(ctx: JobContext) -> Result<()> {
    let document_id = ctx.payload()["document_id"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();
    let pages = ctx.payload()["pages"].as_u64().unwrap_or(0) as u32;
    let completion_key = format!("document:{document_id}");

    info!(%document_id, pages, "arming completion counter");
    ctx.actions().childs_init(&completion_key, pages).await?;

    for page in 1..=pages {
        ctx.actions()
            .publish(
                PAGES,
                &serde_json::json!({
                    "document_id": document_id,
                    "page": page,
                    "completion_key": completion_key,
                }),
                PublishOptions::default(),
            )
            .await?;
    }
    info!(%document_id, "all page jobs published");
    Ok(())
}

async fn page_worker(ctx: JobContext) -> Result<()> {
    let page = ctx.payload()["page"].as_u64().unwrap_or(0);
    let completion_key = ctx.payload()["completion_key"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    info!(page, "rendering page");
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Our own job id identifies this child; repeats after a retry are
    // absorbed by the counter's idempotence.
    let remaining = ctx.actions().child_ack(&completion_key, None).await?;
    info!(page, remaining, "page done");

    if remaining == 0 {
        ctx.actions()
            .publish(
                ASSEMBLED,
                &serde_json::json!({
                    "document_id": ctx.payload()["document_id"],
                    "pages": PAGE_COUNT,
                }),
                PublishOptions::default(),
            )
            .await?;
        info!("last page finished; assembled job published");
    }
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

    let job_id = client
        .publish(
            DOCUMENTS,
            &serde_json::json!({"document_id": "doc-123", "pages": PAGE_COUNT}),
            PublishOptions::default(),
        )
        .await?;
    info!(%job_id, "document job published");

    let doc_consumer = Consumer::with_config(
        client.clone(),
        DOCUMENTS,
        document_worker,
        ConsumerConfig {
            handle_signals: false,
            ..Default::default()
        },
    );
    let page_consumer = Consumer::with_config(
        client.clone(),
        PAGES,
        page_worker,
        ConsumerConfig {
            handle_signals: false,
            ..Default::default()
        },
    );

    let stop_docs = doc_consumer.stop_token();
    let stop_pages = page_consumer.stop_token();
    let docs_task = tokio::spawn(async move { doc_consumer.run().await });
    let pages_task = tokio::spawn(async move { page_consumer.run().await });

    // Wait for the fan-in job to land, then wind the consumers down.
    let monitor = client.monitor();
    loop {
        let counts = monitor.counts(ASSEMBLED).await?;
        if counts.waiting > 0 {
            info!("assembled job observed; shutting down");
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    stop_docs.cancel();
    stop_pages.cancel();
    docs_task.await??;
    pages_task.await??;
    Ok(())
}
