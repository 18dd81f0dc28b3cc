//! The atomic scripts, shipped as Lua sources and wrapped in
//! [`redis::Script`].
//!
//! `Script` hashes the source at construction and invokes it by SHA; when a
//! store node replies NOSCRIPT (fresh node, restarted node, flushed script
//! cache) it re-sends the source and retries, so callers never see the
//! cache miss. The set is built once per process.

use std::sync::OnceLock;

use redis::Script;

/// One `Script` per scripted operation.
pub(crate) struct ScriptSet {
    pub enqueue: Script,
    pub reserve: Script,
    pub heartbeat: Script,
    pub ack_success: Script,
    pub ack_fail: Script,
    pub promote_delayed: Script,
    pub reap_expired: Script,
    pub pause: Script,
    pub resume: Script,
    pub retry_failed: Script,
    pub retry_failed_batch: Script,
    pub remove_job: Script,
    pub remove_jobs_batch: Script,
    pub childs_init: Script,
    pub child_ack: Script,
}

impl ScriptSet {
    fn load() -> Self {
        ScriptSet {
            enqueue: Script::new(include_str!("../lua/enqueue.lua")),
            reserve: Script::new(include_str!("../lua/reserve.lua")),
            heartbeat: Script::new(include_str!("../lua/heartbeat.lua")),
            ack_success: Script::new(include_str!("../lua/ack_success.lua")),
            ack_fail: Script::new(include_str!("../lua/ack_fail.lua")),
            promote_delayed: Script::new(include_str!("../lua/promote_delayed.lua")),
            reap_expired: Script::new(include_str!("../lua/reap_expired.lua")),
            pause: Script::new(include_str!("../lua/pause.lua")),
            resume: Script::new(include_str!("../lua/resume.lua")),
            retry_failed: Script::new(include_str!("../lua/retry_failed.lua")),
            retry_failed_batch: Script::new(include_str!("../lua/retry_failed_batch.lua")),
            remove_job: Script::new(include_str!("../lua/remove_job.lua")),
            remove_jobs_batch: Script::new(include_str!("../lua/remove_jobs_batch.lua")),
            childs_init: Script::new(include_str!("../lua/childs_init.lua")),
            child_ack: Script::new(include_str!("../lua/child_ack.lua")),
        }
    }
}

/// Process-wide script set.
pub(crate) fn scripts() -> &'static ScriptSet {
    static SCRIPTS: OnceLock<ScriptSet> = OnceLock::new();
    SCRIPTS.get_or_init(ScriptSet::load)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources() -> Vec<(&'static str, &'static str)> {
        vec![
            ("enqueue", include_str!("../lua/enqueue.lua")),
            ("reserve", include_str!("../lua/reserve.lua")),
            ("heartbeat", include_str!("../lua/heartbeat.lua")),
            ("ack_success", include_str!("../lua/ack_success.lua")),
            ("ack_fail", include_str!("../lua/ack_fail.lua")),
            ("promote_delayed", include_str!("../lua/promote_delayed.lua")),
            ("reap_expired", include_str!("../lua/reap_expired.lua")),
            ("pause", include_str!("../lua/pause.lua")),
            ("resume", include_str!("../lua/resume.lua")),
            ("retry_failed", include_str!("../lua/retry_failed.lua")),
            ("retry_failed_batch", include_str!("../lua/retry_failed_batch.lua")),
            ("remove_job", include_str!("../lua/remove_job.lua")),
            ("remove_jobs_batch", include_str!("../lua/remove_jobs_batch.lua")),
            ("childs_init", include_str!("../lua/childs_init.lua")),
            ("child_ack", include_str!("../lua/child_ack.lua")),
        ]
    }

    #[test]
    fn every_script_is_present_and_distinct() {
        let sources = sources();
        assert_eq!(sources.len(), 15);
        for (name, src) in &sources {
            assert!(!src.trim().is_empty(), "{name} is empty");
        }
        for (i, (_, a)) in sources.iter().enumerate() {
            for (_, b) in sources.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn scripts_only_declare_the_anchor() {
        // Routing discipline: KEYS[1] is the sole declared key; everything
        // else is derived from it inside the script.
        for (name, src) in sources() {
            assert!(src.contains("KEYS[1]"), "{name} must use the anchor");
            assert!(!src.contains("KEYS[2]"), "{name} declares extra keys");
        }
    }

    #[test]
    fn set_loads_once() {
        let a = scripts() as *const ScriptSet;
        let b = scripts() as *const ScriptSet;
        assert_eq!(a, b);
    }
}
