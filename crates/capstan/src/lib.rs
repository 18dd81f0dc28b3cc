//! # Capstan
//!
//! A durable, distributed job queue coordinated entirely through Redis.
//! Producers publish structured jobs onto named queues; consumer processes
//! reserve jobs under a lease, run a handler, heartbeat while it runs, and
//! acknowledge the outcome. The store is the broker - every state
//! transition happens inside a server-side Lua script, and processes share
//! nothing else.
//!
//! ## Architecture
//!
//! ```text
//! publisher                      consumer process
//!     │                              │
//!     ▼ publish()                    ▼ run()
//! ┌─────────┐   reserve/ack    ┌───────────┐
//! │  atomic │◄─────────────────│ consumer  │──► handler(ctx)
//! │ scripts │                  │   loop    │        │
//! │ (Redis) │◄─────────────────│           │        ▼
//! └─────────┘   heartbeat      └───────────┘   ctx.actions()
//!     ▲                              │         publish / pause /
//!     │ promote_delayed              │         child counters
//!     │ reap_expired  (maintenance, between reservations)
//! ```
//!
//! Per queue, jobs move through five lanes - wait, delayed, active,
//! completed, failed - and every key for queue `Q` shares the `{Q}` hash
//! tag, so each script touches a single cluster slot and runs atomically.
//!
//! ## Key invariants
//!
//! 1. **One lane per job** - a job id is in exactly one lane at any moment,
//!    and the record's `state` field matches the lane.
//! 2. **Leases gate mutation** - an active job is only moved by a script
//!    holding its current lease token, or by the reaper after the lease
//!    expires.
//! 3. **At-least-once** - a crashed consumer loses its lease and the job
//!    runs again with a visible attempt counter; `attempt` never exceeds
//!    `max_attempts`.
//! 4. **Groups cap concurrency** - at most `group_limit` jobs of one group
//!    are active at a time; FIFO order holds within a group.
//! 5. **Bounded history** - completed/failed lists are trimmed at
//!    insertion and rolled-out jobs are deleted with them.
//!
//! ## Example
//!
//! ```ignore
//! use capstan_core::{ConsumerConfig, JobContext, PublishOptions, QueueClient};
//!
//! let client = QueueClient::connect("redis://127.0.0.1:6379/0").await?;
//!
//! let job_id = client
//!     .publish(
//!         "emails",
//!         &serde_json::json!({"to": "user@example.com"}),
//!         PublishOptions::default(),
//!     )
//!     .await?;
//!
//! client
//!     .consume(
//!         "emails",
//!         |ctx: JobContext| async move {
//!             send_email(ctx.payload()).await?;
//!             Ok(())
//!         },
//!         ConsumerConfig::default(),
//!     )
//!     .await?;
//! ```
//!
//! ## What this is not
//!
//! - Not exactly-once: the contract is at-least-once with retry counters.
//! - Not a task graph: the child-completion counter is a join primitive;
//!   the parent decides what "all children done" means.
//! - Not push-based: consumers poll, and pause simply stops hand-out.

// Core modules
mod clock;
mod ids;
mod keys;
mod scripts;

mod client;
mod consumer;
mod context;
mod error;
mod monitor;
mod ops;
mod types;

// Re-export the clock (tests pin it; embedders rarely touch it)
pub use clock::Clock;

// Re-export id helpers
pub use ids::{new_job_id, new_lease_token};

// Re-export key derivation (admin tooling builds on these)
pub use keys::{childs_anchor, queue_anchor, queue_base};

// Re-export error types
pub use error::{QueueError, BATCH_MAX};

// Re-export core result types
pub use types::{AckFailOutcome, BatchItem, Lane, ReserveOutcome, ReservedJob};

// Re-export the operations façade
pub use ops::{EnqueueArgs, Ops, DEFAULT_TIMEOUT_MS};

// Re-export the client (primary entry point)
pub use client::{ConnOpts, PublishOptions, QueueClient};

// Re-export the consumer loop
pub use consumer::{Consumer, ConsumerConfig, JobHandler};

// Re-export the handler-facing context
pub use context::{JobActions, JobContext};

// Re-export monitoring views
pub use monitor::{
    ActiveSample, DelayedSample, FailedSample, GroupStatus, JobInfo, QueueCounts, QueueMonitor,
    GROUPS_READY_MAX, SAMPLE_MAX,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
