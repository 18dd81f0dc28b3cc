//! Identifier generation.
//!
//! Job ids are UUID v7 so ids sort by creation time, which keeps lane
//! listings readable in monitoring tools. Lease tokens are opaque v4 -
//! nothing may be inferable from them.

use uuid::Uuid;

/// Time-sortable job id.
pub fn new_job_id() -> String {
    Uuid::now_v7().to_string()
}

/// Opaque lease token, fresh per reservation.
pub fn new_lease_token() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::{NoContext, Timestamp};

    #[test]
    fn job_ids_sort_by_creation_time() {
        // Build v7 ids from explicit timestamps so the ordering check is
        // deterministic rather than racing the wall clock.
        let early = Uuid::new_v7(Timestamp::from_unix(NoContext, 1_700_000_000, 0)).to_string();
        let late = Uuid::new_v7(Timestamp::from_unix(NoContext, 1_700_000_060, 0)).to_string();
        assert!(early < late);
    }

    #[test]
    fn lease_tokens_are_unique() {
        assert_ne!(new_lease_token(), new_lease_token());
    }
}
