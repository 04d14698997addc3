// Converts per-log truncation requests into a single safe
// device-truncation point across all tenants sharing one journal.

use tracing::warn;

use crate::types::{JournalKey, SequenceNumber, TruncationBarrier, TruncationBoundary};

/// Owns the ordered list of truncation barriers and the current safe
/// boundary for one log. All mutation here is expected to happen under
/// the journal's flush lock (truncate, rollback) or from the single
/// batch-completion path — see the crate-level concurrency notes.
pub struct TruncationTracker {
    barriers: Vec<TruncationBarrier>,
    boundary: TruncationBoundary,
}

impl TruncationTracker {
    pub fn new(start_lsn: SequenceNumber) -> Self {
        Self {
            barriers: Vec::new(),
            boundary: TruncationBoundary::new(start_lsn),
        }
    }

    pub fn boundary(&self) -> TruncationBoundary {
        self.boundary
    }

    pub fn barriers(&self) -> &[TruncationBarrier] {
        &self.barriers
    }

    /// Pre-allocates barrier storage, mirroring the original's
    /// up-front `reserve` against a long-running log's expected churn.
    pub fn reserve(&mut self, additional: usize) {
        self.barriers.reserve(additional);
    }

    /// Appends or supersedes the trailing barrier for a just-completed
    /// flush batch. If the last barrier already covers at least
    /// `flush_batch_max_lsn`, a later batch strictly supersedes it in
    /// place; otherwise a new barrier is appended.
    pub fn record_batch_completion(&mut self, flush_batch_max_lsn: SequenceNumber, flush_batch_ld_key: JournalKey) {
        if let Some(last) = self.barriers.last_mut() {
            if last.seq_num >= flush_batch_max_lsn {
                last.ld_key = flush_batch_ld_key;
                return;
            }
        }
        self.barriers.push(TruncationBarrier { seq_num: flush_batch_max_lsn, ld_key: flush_batch_ld_key });
    }

    /// Largest index `i` with `barriers[i].seq_num <= input_lsn`, or `-1`
    /// if none qualify. Binary search; a tie on equality returns that index.
    pub fn search_max_le(&self, input_lsn: SequenceNumber) -> i64 {
        let mut start: i64 = -1;
        let mut end: i64 = self.barriers.len() as i64;
        while end - start > 1 {
            let mid = start + (end - start) / 2;
            let mid_seq = self.barriers[mid as usize].seq_num;
            if mid_seq == input_lsn {
                return mid;
            } else if mid_seq > input_lsn {
                end = mid;
            } else {
                start = mid;
            }
        }
        end - 1
    }

    /// Updates `boundary.seq_num` to the requested truncation point and,
    /// if a barrier covers it, advances `boundary.ld_key` and drops the
    /// barriers it subsumes. Returns `true` if a barrier qualified (the
    /// device-safe point advanced), `false` if this was a metadata-only
    /// update.
    pub fn apply_local_truncate(&mut self, upto_lsn: SequenceNumber) -> bool {
        self.boundary.seq_num = upto_lsn;
        let ind = self.search_max_le(upto_lsn);
        if ind < 0 {
            return false;
        }
        let ind = ind as usize;
        self.boundary.ld_key = self.barriers[ind].ld_key;
        self.boundary.pending_dev_truncation = true;
        self.barriers.drain(0..=ind);
        true
    }

    /// Removes barriers with `seq_num > to_lsn`, used by rollback.
    pub fn erase_barriers_after(&mut self, to_lsn: SequenceNumber) {
        self.barriers.retain(|b| b.seq_num <= to_lsn);
    }

    /// Called before a family-wide device truncation pass. Records
    /// whether this log still has unconsumed barriers (meaning writes
    /// landed after the safe point was computed) and returns the
    /// current boundary for the family to fold into its minimum.
    pub fn pre_device_truncation(&mut self) -> TruncationBoundary {
        self.boundary.active_writes_not_part_of_truncation = !self.barriers.is_empty();
        self.boundary
    }

    /// Called after the family has physically truncated the device at
    /// `new_ld_key`. Hard error if `new_ld_key.idx < boundary.ld_key.idx`:
    /// this method must only be called on logs whose own boundary equals
    /// the chosen minimum.
    pub fn post_device_truncation(&mut self, new_ld_key: JournalKey) {
        if new_ld_key.idx < self.boundary.ld_key.idx {
            warn!(
                new_idx = new_ld_key.idx,
                boundary_idx = self.boundary.ld_key.idx,
                "post_device_truncation called below this log's own safe boundary"
            );
            panic!(
                "post_device_truncation called with idx {} below this log's safe boundary idx {}",
                new_ld_key.idx, self.boundary.ld_key.idx
            );
        }
        self.boundary.pending_dev_truncation = false;
        self.boundary.ld_key = new_ld_key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(idx: i64) -> JournalKey {
        JournalKey { idx, dev_offset: 0 }
    }

    #[test]
    fn search_max_le_binary_search() {
        let mut t = TruncationTracker::new(0);
        t.record_batch_completion(5, key(100));
        t.record_batch_completion(10, key(200));
        t.record_batch_completion(15, key(300));
        assert_eq!(t.search_max_le(-1), -1);
        assert_eq!(t.search_max_le(4), -1);
        assert_eq!(t.search_max_le(5), 0);
        assert_eq!(t.search_max_le(9), 0);
        assert_eq!(t.search_max_le(10), 1);
        assert_eq!(t.search_max_le(999), 2);
    }

    #[test]
    fn truncate_without_matching_barrier_is_metadata_only() {
        let mut t = TruncationTracker::new(0);
        let advanced = t.apply_local_truncate(0);
        assert!(!advanced);
        assert_eq!(t.boundary().ld_key, JournalKey::INVALID);
        assert_eq!(t.boundary().seq_num, 0);
    }

    #[test]
    fn truncate_consumes_qualifying_barriers() {
        let mut t = TruncationTracker::new(0);
        t.record_batch_completion(5, key(100));
        t.record_batch_completion(10, key(200));
        let advanced = t.apply_local_truncate(7);
        assert!(advanced);
        assert_eq!(t.boundary().ld_key, key(100));
        assert_eq!(t.barriers().len(), 1);
        assert_eq!(t.barriers()[0].seq_num, 10);
    }

    #[test]
    fn batch_completion_supersedes_last_barrier_when_later() {
        let mut t = TruncationTracker::new(0);
        t.record_batch_completion(5, key(100));
        t.record_batch_completion(5, key(150));
        assert_eq!(t.barriers().len(), 1);
        assert_eq!(t.barriers()[0].ld_key, key(150));
    }

    #[test]
    #[should_panic]
    fn post_device_truncation_rejects_regression() {
        let mut t = TruncationTracker::new(0);
        t.record_batch_completion(5, key(100));
        t.apply_local_truncate(5);
        t.post_device_truncation(key(50));
    }

    #[test]
    fn cross_tenant_min_selection_rejects_higher_boundary() {
        // log A settles at idx=100, log B at idx=70; family picks 70.
        let mut a = TruncationTracker::new(0);
        a.record_batch_completion(5, key(100));
        a.apply_local_truncate(5);
        a.pre_device_truncation();

        let mut b = TruncationTracker::new(0);
        b.record_batch_completion(3, key(70));
        b.apply_local_truncate(3);
        b.pre_device_truncation();

        let min_key = a.boundary().ld_key.min(b.boundary().ld_key);
        assert_eq!(min_key, key(70));

        b.post_device_truncation(min_key);
        assert_eq!(b.boundary().ld_key, key(70));
    }
}
