// Per-log sparse map from sequence number to record state.
//
// Backed by a `BTreeMap` for the sparse entries plus two frontier
// counters (issued, completed) that only ever advance on insertion and
// only ever retreat on `rollback`/`truncate`. The frontiers give O(1)
// contiguity queries without rescanning the map on every append.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{LogStoreError, Result};
use crate::types::{JournalKey, RecordState, RecordStatus, SequenceNumber};

struct Inner {
    /// Entries with `lsn <= base_lsn` are logically truncated and gone.
    base_lsn: SequenceNumber,
    entries: BTreeMap<SequenceNumber, RecordState>,
    /// Highest `L` such that every slot in `(base_lsn, L]` is at least `Issued`.
    issued_frontier: SequenceNumber,
    /// Highest `L` such that every slot in `(base_lsn, L]` is `Completed`.
    completed_frontier: SequenceNumber,
}

impl Inner {
    fn advance_issued_frontier(&mut self) {
        loop {
            let next = self.issued_frontier + 1;
            match self.entries.get(&next) {
                Some(RecordState::Issued) | Some(RecordState::Completed(_)) => {
                    self.issued_frontier = next;
                }
                _ => break,
            }
        }
    }

    fn advance_completed_frontier(&mut self) {
        loop {
            let next = self.completed_frontier + 1;
            match self.entries.get(&next) {
                Some(RecordState::Completed(_)) => {
                    self.completed_frontier = next;
                }
                _ => break,
            }
        }
    }
}

/// Per-log record index: tracks issued/completed/truncated ranges for a
/// single `LogStore`. Safe for concurrent `create`/`update` on distinct
/// sequence numbers; concurrent operations on the *same* lsn are
/// undefined by design (the caller's sequence-number discipline
/// prevents them).
pub struct RecordIndex {
    inner: Mutex<Inner>,
}

impl RecordIndex {
    pub fn new(base_lsn: SequenceNumber) -> Self {
        Self {
            inner: Mutex::new(Inner {
                base_lsn,
                entries: BTreeMap::new(),
                issued_frontier: base_lsn,
                completed_frontier: base_lsn,
            }),
        }
    }

    pub fn base_lsn(&self) -> SequenceNumber {
        self.inner.lock().base_lsn
    }

    /// Inserts an `Issued` entry. Fails if `lsn <= base_lsn` or already present.
    pub fn create(&self, lsn: SequenceNumber) -> Result<()> {
        let mut inner = self.inner.lock();
        if lsn <= inner.base_lsn {
            return Err(LogStoreError::OutOfRange(lsn));
        }
        if inner.entries.contains_key(&lsn) {
            return Err(LogStoreError::AlreadyExists(lsn));
        }
        inner.entries.insert(lsn, RecordState::Issued);
        inner.advance_issued_frontier();
        trace!(lsn, "record created");
        Ok(())
    }

    /// Transitions `Issued -> Completed(key)`. Idempotent once completed.
    pub fn update(&self, lsn: SequenceNumber, key: JournalKey) -> Result<()> {
        let mut inner = self.inner.lock();
        if lsn <= inner.base_lsn {
            return Err(LogStoreError::OutOfRange(lsn));
        }
        match inner.entries.get(&lsn) {
            Some(RecordState::Completed(_)) => return Ok(()),
            Some(RecordState::Issued) => {
                inner.entries.insert(lsn, RecordState::Completed(key));
            }
            _ => return Err(LogStoreError::OutOfRange(lsn)),
        }
        inner.advance_completed_frontier();
        trace!(lsn, idx = key.idx, dev_offset = key.dev_offset, "record completed");
        Ok(())
    }

    /// Unwinds a `create(lsn)` whose journal append was rejected
    /// synchronously (no completion will ever arrive for it). A no-op if
    /// the slot already completed or was never issued. Retreats the
    /// issued frontier back to the highest contiguous entry still present.
    pub fn fail_create(&self, lsn: SequenceNumber) {
        let mut inner = self.inner.lock();
        if matches!(inner.entries.get(&lsn), Some(RecordState::Issued)) {
            inner.entries.remove(&lsn);
        }
        while inner.issued_frontier > inner.base_lsn && !inner.entries.contains_key(&inner.issued_frontier) {
            inner.issued_frontier -= 1;
        }
        trace!(lsn, "record creation unwound after synchronous append failure");
    }

    /// Direct insert of a `Completed` entry, used during journal recovery
    /// replay and for `fill_gap` (with an empty `JournalKey`).
    pub fn create_and_complete(&self, lsn: SequenceNumber, key: JournalKey) -> Result<()> {
        let mut inner = self.inner.lock();
        if lsn <= inner.base_lsn {
            return Err(LogStoreError::OutOfRange(lsn));
        }
        inner.entries.insert(lsn, RecordState::Completed(key));
        inner.advance_issued_frontier();
        inner.advance_completed_frontier();
        Ok(())
    }

    pub fn status(&self, lsn: SequenceNumber) -> RecordStatus {
        let inner = self.inner.lock();
        if lsn <= inner.base_lsn {
            return RecordStatus { is_out_of_range: true, ..Default::default() };
        }
        match inner.entries.get(&lsn) {
            None => RecordStatus { is_hole: true, ..Default::default() },
            Some(state) => RecordStatus {
                is_hole: false,
                is_out_of_range: false,
                is_completed: state.is_completed(),
            },
        }
    }

    /// Returns the full record. Fails with `OutOfRange` if truncated or
    /// never created.
    pub fn at(&self, lsn: SequenceNumber) -> Result<RecordState> {
        let inner = self.inner.lock();
        if lsn <= inner.base_lsn {
            return Err(LogStoreError::OutOfRange(lsn));
        }
        inner
            .entries
            .get(&lsn)
            .cloned()
            .ok_or(LogStoreError::OutOfRange(lsn))
    }

    /// Highest `L <= lsn_ceiling` such that every slot in `(base_lsn, L]`
    /// is at least `Issued`. `None` ceiling means "no cap".
    pub fn active_upto(&self, lsn_ceiling: Option<SequenceNumber>) -> SequenceNumber {
        let inner = self.inner.lock();
        match lsn_ceiling {
            Some(c) => inner.issued_frontier.min(c),
            None => inner.issued_frontier,
        }
    }

    /// Same as `active_upto` but restricted to `Completed` entries.
    pub fn completed_upto(&self, lsn_ceiling: Option<SequenceNumber>) -> SequenceNumber {
        let inner = self.inner.lock();
        match lsn_ceiling {
            Some(c) => inner.completed_frontier.min(c),
            None => inner.completed_frontier,
        }
    }

    /// Visits completed entries in order starting at `start`; stops when
    /// `f` returns `false` or the completed frontier is reached.
    pub fn foreach_completed<F>(&self, start: SequenceNumber, mut f: F)
    where
        F: FnMut(SequenceNumber, SequenceNumber, &RecordState) -> bool,
    {
        let inner = self.inner.lock();
        let max_idx = inner.completed_frontier;
        for (&lsn, state) in inner.entries.range(start..) {
            if lsn > max_idx {
                break;
            }
            if !state.is_completed() {
                continue;
            }
            if !f(lsn, max_idx, state) {
                break;
            }
        }
    }

    /// Raises `base_lsn` to `upto_lsn`, discarding older entries.
    pub fn truncate(&self, upto_lsn: SequenceNumber) {
        let mut inner = self.inner.lock();
        if upto_lsn <= inner.base_lsn {
            return;
        }
        inner.base_lsn = upto_lsn;
        inner.entries.retain(|&lsn, _| lsn > upto_lsn);
        inner.issued_frontier = inner.issued_frontier.max(upto_lsn);
        inner.completed_frontier = inner.completed_frontier.max(upto_lsn);
    }

    /// Removes all entries with `lsn > to_lsn`. Caller must ensure no
    /// `Issued` entries remain in that suffix.
    pub fn rollback(&self, to_lsn: SequenceNumber) {
        let mut inner = self.inner.lock();
        inner.entries.retain(|&lsn, _| lsn <= to_lsn);
        inner.issued_frontier = inner.issued_frontier.min(to_lsn);
        inner.completed_frontier = inner.completed_frontier.min(to_lsn);
    }
}
