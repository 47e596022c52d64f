//! Consensus Gate: N ≥ 3 independent pure predicates that must unanimously
//! agree a file can be deleted. Any disagreement is fatal to the whole
//! process (see [`crate::error::SweepError::ConsensusFailed`]).

use std::time::SystemTime;

use crate::walker::FileAttrs;

/// A pure, side-effect-free predicate over a file's attributes and the
/// configured thresholds.
pub type Predicate = fn(&FileAttrs, &ConsensusContext) -> bool;

/// The values every predicate is allowed to depend on, besides the file's
/// own attributes. Deliberately carries no filesystem handle: a predicate
/// that needs to ask the disk something isn't independent of the walk that
/// produced `attrs` in the first place. The "did a writer touch this file
/// since we decided to delete it" check belongs to the sweep's lock step
/// instead (see `sweeper::handle_outside`), not to the gate.
#[derive(Debug, Clone, Copy)]
pub struct ConsensusContext {
    pub threshold_days: u32,
    pub now: SystemTime,
}

fn age(attrs: &FileAttrs, now: SystemTime) -> std::time::Duration {
    now.duration_since(attrs.mtime).unwrap_or_default()
}

/// `age(file) >= deletion.threshold`.
pub fn age_exceeds_threshold(attrs: &FileAttrs, ctx: &ConsensusContext) -> bool {
    age(attrs, ctx.now) >= std::time::Duration::from_secs(u64::from(ctx.threshold_days) * 86400)
}

/// `file.size_bytes >= 0` is structural in `u64`; this predicate's real
/// content is that the size must still fit the `BIGINT` (`i64`) column the
/// persistence layer stores it in, catching a corrupt or overflowed stat
/// reading reaching the gate.
pub fn size_is_nonnegative_and_sane(attrs: &FileAttrs, _ctx: &ConsensusContext) -> bool {
    attrs.size_bytes <= i64::MAX as u64
}

/// The observed mtime cannot postdate the sweep clock; a future mtime means
/// clock skew or a corrupted stat and must not be trusted as grounds for
/// deletion.
pub fn mtime_not_in_the_future(attrs: &FileAttrs, ctx: &ConsensusContext) -> bool {
    attrs.mtime <= ctx.now
}

/// The gate itself: holds the shipped predicates (at least 3, per §4.8) and
/// requires unanimous agreement.
pub struct ConsensusGate {
    predicates: Vec<Predicate>,
}

impl Default for ConsensusGate {
    fn default() -> Self {
        Self {
            predicates: vec![age_exceeds_threshold, size_is_nonnegative_and_sane, mtime_not_in_the_future],
        }
    }
}

impl ConsensusGate {
    pub fn new(predicates: Vec<Predicate>) -> Self {
        assert!(predicates.len() >= 3, "consensus gate requires at least 3 independent predicates");
        Self { predicates }
    }

    /// Runs every predicate, returning the unanimous decision and the raw
    /// vote vector (for the `ConsensusFailed` error's diagnostic payload).
    pub fn decide(&self, attrs: &FileAttrs, ctx: &ConsensusContext) -> (bool, Vec<bool>) {
        let votes: Vec<bool> = self.predicates.iter().map(|p| p(attrs, ctx)).collect();
        (votes.iter().all(|&v| v), votes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn attrs(mtime: SystemTime, size: u64) -> FileAttrs {
        FileAttrs {
            path: PathBuf::from("/nonexistent/path/for/test"),
            device: 1,
            inode: 1,
            owner_uid: 1000,
            group_gid: 1000,
            size_bytes: size,
            mtime,
            nlink: 2,
        }
    }

    #[test]
    fn unanimous_true_when_all_predicates_agree() {
        let now = SystemTime::now();
        let old_mtime = now - std::time::Duration::from_secs(200 * 86400);
        let gate = ConsensusGate::new(vec![
            |_attrs, _ctx| true,
            |_attrs, _ctx| true,
            |_attrs, _ctx| true,
        ]);
        let ctx = ConsensusContext { threshold_days: 90, now };
        let (decision, votes) = gate.decide(&attrs(old_mtime, 10), &ctx);
        assert!(decision);
        assert_eq!(votes, vec![true, true, true]);
    }

    #[test]
    fn any_disagreement_fails_the_vote() {
        let now = SystemTime::now();
        let old_mtime = now - std::time::Duration::from_secs(200 * 86400);
        let gate = ConsensusGate::new(vec![
            |_attrs, _ctx| true,
            |_attrs, _ctx| false,
            |_attrs, _ctx| true,
        ]);
        let ctx = ConsensusContext { threshold_days: 90, now };
        let (decision, _) = gate.decide(&attrs(old_mtime, 10), &ctx);
        assert!(!decision);
    }

    #[test]
    fn size_over_i64_max_fails_the_sanity_predicate() {
        let now = SystemTime::now();
        let ctx = ConsensusContext { threshold_days: 90, now };
        let huge = attrs(now, (i64::MAX as u64) + 1);
        assert!(!size_is_nonnegative_and_sane(&huge, &ctx));
    }

    #[test]
    fn mtime_not_in_the_future_rejects_a_clock_skewed_stat() {
        let now = SystemTime::now();
        let future_mtime = now + std::time::Duration::from_secs(3600);
        let ctx = ConsensusContext { threshold_days: 90, now };
        assert!(!mtime_not_in_the_future(&attrs(future_mtime, 10), &ctx));
    }
}
