//! Redis key derivation for queues and child-completion counters.
//!
//! Every key belonging to queue `Q` shares the hash tag `{Q}`, so the whole
//! queue lives in one cluster slot and a script anchored on `{Q}:meta` may
//! derive and touch any sibling key. Scripts receive only the anchor; the
//! other names are rebuilt inside Lua by stripping the `:meta` suffix.

use crate::error::QueueError;

/// Maximum length of a child-completion counter key.
pub const CHILDS_KEY_MAX: usize = 128;

/// Hash-tagged base for a queue, e.g. `demo` -> `{demo}`.
///
/// A name that already carries braces is taken verbatim, which lets callers
/// pin several queues into one slot on purpose.
pub fn queue_base(queue: &str) -> String {
    if queue.contains('{') && queue.contains('}') {
        queue.to_string()
    } else {
        format!("{{{queue}}}")
    }
}

/// The routing anchor `{Q}:meta` - the single KEYS[1] of every queue script.
pub fn queue_anchor(queue: &str) -> String {
    format!("{}:meta", queue_base(queue))
}

/// Anchor for a child-completion counter, e.g. `doc-1` -> `{cc:doc-1}:meta`.
///
/// The key is user-supplied, so it is validated: non-empty, at most
/// [`CHILDS_KEY_MAX`] chars, and brace-free (braces would break the hash tag).
pub fn childs_anchor(key: &str) -> Result<String, QueueError> {
    let k = key.trim();
    if k.is_empty() {
        return Err(QueueError::InvalidKey("child counter key is empty".into()));
    }
    if k.contains('{') || k.contains('}') {
        return Err(QueueError::InvalidKey(
            "child counter key must not contain '{' or '}'".into(),
        ));
    }
    if k.len() > CHILDS_KEY_MAX {
        return Err(QueueError::InvalidKey(format!(
            "child counter key too long (max {CHILDS_KEY_MAX} chars)"
        )));
    }
    Ok(format!("{{cc:{k}}}:meta"))
}

/// Key of the per-job hash.
pub fn job_key(base: &str, job_id: &str) -> String {
    format!("{base}:job:{job_id}")
}

pub fn wait_key(base: &str) -> String {
    format!("{base}:wait")
}

pub fn delayed_key(base: &str) -> String {
    format!("{base}:delayed")
}

pub fn active_key(base: &str) -> String {
    format!("{base}:active")
}

pub fn completed_key(base: &str) -> String {
    format!("{base}:completed")
}

pub fn failed_key(base: &str) -> String {
    format!("{base}:failed")
}

pub fn paused_key(base: &str) -> String {
    format!("{base}:paused")
}

pub fn groups_ready_key(base: &str) -> String {
    format!("{base}:groups:ready")
}

pub fn group_inflight_key(base: &str, gid: &str) -> String {
    format!("{base}:g:{gid}:inflight")
}

pub fn group_limit_key(base: &str, gid: &str) -> String {
    format!("{base}:g:{gid}:limit")
}
