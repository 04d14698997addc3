// Per-tenant façade over the shared journal: sequence-number assignment,
// append/read, sync-flush rendezvous, truncation and rollback.
//
// A `LogStore` is always held behind `Arc` by its owning `LogStoreFamily`
// so that the flush-lock continuations passed to `JournalPort` can be
// `'static` without a raw self-reference — see the crate-level design
// notes on shared ownership.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use base64::Engine as _;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{LogStoreError, Result};
use crate::journal::{Cookie, JournalPort};
use crate::record_index::RecordIndex;
use crate::truncation::TruncationTracker;
use crate::types::{
    DumpVerbosity, FlushLockOutcome, JournalKey, LogDumpRequest, LogDumpResponse, LogRecordDump,
    LogStoreStatus, LogStoreSuperblock, SequenceNumber, NONE_LSN,
};

/// Default page size for `LogStore::dump` when the caller doesn't ask for one.
pub const DEFAULT_DUMP_BATCH_SIZE: usize = 100;

/// Invoked once per completed append: `(lsn, payload, ld_key, cookie)`.
pub type WriteCompletionCb = Box<dyn FnOnce(SequenceNumber, &[u8], JournalKey, Cookie) + Send>;

/// Invoked during recovery replay for each surviving, non-truncated record.
pub type LogFoundCb = Arc<dyn Fn(SequenceNumber, &[u8]) + Send + Sync>;

/// Invoked once a rollback's flush-lock continuation has run.
pub type RollbackCb = Box<dyn FnOnce(SequenceNumber) + Send>;

/// What a `LogStore` asks its owning family to do after a non-in-memory
/// local truncate: run a device-wide truncation pass. Kept as a trait
/// (rather than a direct `Arc<LogStoreFamily>` reference) so this module
/// doesn't need to know about its owner's internals.
pub trait TruncationCoordinator: Send + Sync {
    fn request_device_truncate(&self);
}

struct PendingWrite {
    payload: Arc<[u8]>,
    cb: Option<WriteCompletionCb>,
    cookie: Cookie,
}

/// Per-log state machine: sequence numbers, the record index, truncation
/// barriers, and the sync-flush/rollback rendezvous machinery.
pub struct LogStore {
    store_id: u32,
    append_mode: bool,
    journal: Arc<dyn JournalPort>,
    coordinator: Option<Weak<dyn TruncationCoordinator>>,
    on_found: Option<LogFoundCb>,

    records: RecordIndex,
    trunc: Mutex<TruncationTracker>,

    next_lsn: AtomicI64,
    flush_batch_max_lsn: Mutex<SequenceNumber>,

    sync_flush_waiter_lsn: AtomicI64,
    sync_flush_lock: Mutex<()>,
    sync_flush_cv: Condvar,

    pending_writes: Mutex<HashMap<SequenceNumber, PendingWrite>>,
}

impl LogStore {
    pub fn new(
        store_id: u32,
        append_mode: bool,
        start_lsn: SequenceNumber,
        journal: Arc<dyn JournalPort>,
        coordinator: Option<Weak<dyn TruncationCoordinator>>,
        on_found: Option<LogFoundCb>,
    ) -> Self {
        Self {
            store_id,
            append_mode,
            journal,
            coordinator,
            on_found,
            records: RecordIndex::new(start_lsn - 1),
            trunc: Mutex::new(TruncationTracker::new(start_lsn)),
            next_lsn: AtomicI64::new(start_lsn),
            flush_batch_max_lsn: Mutex::new(NONE_LSN),
            sync_flush_waiter_lsn: AtomicI64::new(NONE_LSN),
            sync_flush_lock: Mutex::new(()),
            sync_flush_cv: Condvar::new(),
            pending_writes: Mutex::new(HashMap::new()),
        }
    }

    pub fn store_id(&self) -> u32 {
        self.store_id
    }

    /// Pre-allocates truncation barrier storage. A cheap hint, not a
    /// correctness requirement — called once by the owning family right
    /// after construction when a capacity hint is configured.
    pub fn reserve_barrier_capacity(&self, n: usize) {
        self.trunc.lock().reserve(n);
    }

    pub fn append_mode(&self) -> bool {
        self.append_mode
    }

    // ---- appending ---------------------------------------------------

    /// Caller-assigned sequence number. Used by reserved-log recovery and
    /// tests; fails a debug assertion if `lsn` falls inside the truncated
    /// range.
    pub fn write_async(&self, lsn: SequenceNumber, payload: Vec<u8>, cookie: Cookie, cb: WriteCompletionCb) -> Result<()> {
        let truncated_upto = self.trunc.lock().boundary().seq_num;
        debug_assert!(lsn > truncated_upto, "append at lsn {lsn} is at or below truncated_upto_lsn {truncated_upto}");

        self.records.create(lsn)?;
        let payload: Arc<[u8]> = Arc::from(payload.into_boxed_slice());
        self.pending_writes.lock().insert(lsn, PendingWrite { payload: payload.clone(), cb: Some(cb), cookie });

        if let Err(e) = self.journal.append_async(self.store_id, lsn, payload.to_vec(), cookie) {
            self.pending_writes.lock().remove(&lsn);
            self.records.fail_create(lsn);
            return Err(e);
        }
        Ok(())
    }

    /// Auto-assigned sequence number. Valid only in append mode.
    pub fn append_async(&self, payload: Vec<u8>, cookie: Cookie, cb: WriteCompletionCb) -> Result<SequenceNumber> {
        if !self.append_mode {
            return Err(LogStoreError::InvalidState("append_async requires a log store opened in append mode".into()));
        }
        let lsn = self.next_lsn.fetch_add(1, Ordering::AcqRel);
        self.write_async(lsn, payload, cookie, cb)?;
        Ok(lsn)
    }

    /// Blocking wrapper around `write_async`. Refuses to run on the
    /// journal's flush thread to avoid self-deadlock.
    pub fn write_sync(&self, lsn: SequenceNumber, payload: Vec<u8>) -> Result<JournalKey> {
        if self.journal.is_flush_thread() {
            return Err(LogStoreError::InvalidState("write_sync must not be called from the journal's flush thread".into()));
        }
        let cell = Arc::new((Mutex::new(None::<JournalKey>), Condvar::new()));
        let cell2 = cell.clone();
        self.write_async(
            lsn,
            payload,
            0,
            Box::new(move |_lsn, _payload, ld_key, _cookie| {
                let (lock, cv) = &*cell2;
                *lock.lock() = Some(ld_key);
                cv.notify_all();
            }),
        )?;
        let (lock, cv) = &*cell;
        let mut result = lock.lock();
        while result.is_none() {
            cv.wait(&mut result);
        }
        Ok(result.unwrap())
    }

    /// Blocking wrapper around `append_async`.
    pub fn append_sync(&self, payload: Vec<u8>) -> Result<(SequenceNumber, JournalKey)> {
        if !self.append_mode {
            return Err(LogStoreError::InvalidState("append_sync requires a log store opened in append mode".into()));
        }
        let lsn = self.next_lsn.fetch_add(1, Ordering::AcqRel);
        let key = self.write_sync(lsn, payload)?;
        Ok((lsn, key))
    }

    /// Routed here by the owning family once the journal reports a
    /// completion for `lsn`.
    pub(crate) fn on_write_completion(&self, lsn: SequenceNumber, ld_key: JournalKey) {
        if let Err(e) = self.records.update(lsn, ld_key) {
            warn!(store_id = self.store_id, lsn, error = %e, "completion for unknown or already-completed record");
            return;
        }
        {
            let mut max = self.flush_batch_max_lsn.lock();
            *max = (*max).max(lsn);
        }
        trace!(store_id = self.store_id, lsn, idx = ld_key.idx, dev_offset = ld_key.dev_offset, "write completed");

        // Take the removal as its own statement so the `pending_writes`
        // guard drops before the user callback runs below — a callback
        // that chains another `write_async` must not reach back into a
        // still-held `pending_writes` lock.
        let removed = self.pending_writes.lock().remove(&lsn);
        if let Some(pw) = removed {
            if let Some(cb) = pw.cb {
                cb(lsn, &pw.payload, ld_key, pw.cookie);
            }
        }

        // Signaled whenever the completed frontier reaches the waiter's
        // target, not only on completion of that exact lsn — the
        // completion that closes the contiguity gap may be a different
        // lsn than the one `flush_sync` is waiting on.
        let waiter = self.sync_flush_waiter_lsn.load(Ordering::Acquire);
        if waiter != NONE_LSN && self.records.completed_upto(None) >= waiter {
            let _guard = self.sync_flush_lock.lock();
            self.sync_flush_cv.notify_all();
        }
    }

    // ---- reading -------------------------------------------------------

    /// Highest `lsn` such that every slot from the truncation floor up to
    /// it is at least `Issued`.
    pub fn active_upto(&self) -> SequenceNumber {
        self.records.active_upto(None)
    }

    /// Same as `active_upto`, restricted to `Completed` entries.
    pub fn completed_upto(&self) -> SequenceNumber {
        self.records.completed_upto(None)
    }

    pub fn read_sync(&self, lsn: SequenceNumber) -> Result<Vec<u8>> {
        let record = self.records.at(lsn)?;
        let key = record
            .journal_key()
            .ok_or_else(|| LogStoreError::InvalidState(format!("lsn {lsn} has not completed yet")))?;
        self.journal.read(key)
    }

    /// Walks completed entries from `start` onward, reading each
    /// synchronously. `cb` returns `false` to stop early.
    pub fn foreach<F>(&self, start: SequenceNumber, mut cb: F)
    where
        F: FnMut(SequenceNumber, &[u8]) -> bool,
    {
        let mut aborted = false;
        self.records.foreach_completed(start, |lsn, _frontier, state| {
            if aborted {
                return false;
            }
            let key = state.journal_key().expect("foreach_completed only yields Completed entries");
            match self.journal.read(key) {
                Ok(payload) => {
                    if cb(lsn, &payload) {
                        true
                    } else {
                        aborted = true;
                        false
                    }
                }
                Err(e) => {
                    warn!(store_id = self.store_id, lsn, error = %e, "foreach read failed");
                    aborted = true;
                    false
                }
            }
        });
    }

    /// Called once per flush batch by the owning family, for every store
    /// that had at least one completion in it.
    pub(crate) fn on_batch_completion(&self, flush_batch_ld_key: JournalKey) {
        let mut max = self.flush_batch_max_lsn.lock();
        if *max == NONE_LSN {
            return;
        }
        self.trunc.lock().record_batch_completion(*max, flush_batch_ld_key);
        debug!(store_id = self.store_id, flush_batch_max_lsn = *max, idx = flush_batch_ld_key.idx, "batch completion recorded");
        *max = NONE_LSN;
    }

    // ---- truncation -----------------------------------------------------

    fn do_truncate(&self, upto_lsn: SequenceNumber, persist_now: bool) {
        self.records.truncate(upto_lsn);
        let advanced = self.trunc.lock().apply_local_truncate(upto_lsn);
        self.journal
            .update_store_superblk(self.store_id, LogStoreSuperblock { first_seq_num: upto_lsn + 1 }, persist_now);
        debug!(store_id = self.store_id, upto_lsn, device_boundary_advanced = advanced, "local truncate applied");
    }

    /// Truncates this log's in-memory state up to `upto_lsn` and, unless
    /// `in_memory_only`, asks the family to run a device truncation pass.
    /// Runs under the journal's cooperative flush lock.
    pub fn truncate(self: &Arc<Self>, upto_lsn: SequenceNumber, in_memory_only: bool) -> Result<()> {
        let completed = self.records.completed_upto(None);
        debug_assert!(upto_lsn <= completed, "truncate({upto_lsn}) beyond completed_upto({completed})");

        let this = self.clone();
        let outcome = self.journal.try_lock_flush(Box::new(move || {
            this.do_truncate(upto_lsn, false);
            if !in_memory_only {
                if let Some(coord) = this.coordinator.as_ref().and_then(Weak::upgrade) {
                    coord.request_device_truncate();
                }
            }
        }));
        if let FlushLockOutcome::AcquiredAndRan = outcome {
            self.journal.unlock_flush();
        }
        Ok(())
    }

    /// Like `truncate`, but first fills any gap between the issued
    /// frontier and `upto_lsn` with empty completions, and blocks the
    /// caller until the truncation continuation has actually run.
    pub fn sync_truncate(self: &Arc<Self>, upto_lsn: SequenceNumber, in_memory_only: bool) -> Result<()> {
        let issued = self.records.active_upto(None);
        for lsn in (issued + 1)..=upto_lsn {
            if self.records.status(lsn).is_hole {
                self.records.create_and_complete(lsn, JournalKey::empty())?;
                debug!(store_id = self.store_id, lsn, "gap filled ahead of sync_truncate");
            }
        }

        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let done2 = done.clone();
        let this = self.clone();
        let outcome = self.journal.try_lock_flush(Box::new(move || {
            this.do_truncate(upto_lsn, false);
            if !in_memory_only {
                if let Some(coord) = this.coordinator.as_ref().and_then(Weak::upgrade) {
                    coord.request_device_truncate();
                }
            }
            let (lock, cv) = &*done2;
            *lock.lock() = true;
            cv.notify_all();
        }));
        if let FlushLockOutcome::AcquiredAndRan = outcome {
            self.journal.unlock_flush();
        }

        let (lock, cv) = &*done;
        let mut ran = lock.lock();
        while !*ran {
            cv.wait(&mut ran);
        }
        Ok(())
    }

    // ---- recovery -------------------------------------------------------

    /// Invoked by the owning family during replay for each surviving
    /// record. Records below the persisted truncation boundary are
    /// restored into the index (for accounting) but not surfaced to the
    /// caller's `on_found` callback.
    pub(crate) fn on_log_found(&self, lsn: SequenceNumber, ld_key: JournalKey, payload: &[u8]) {
        if let Err(e) = self.records.create_and_complete(lsn, ld_key) {
            warn!(store_id = self.store_id, lsn, error = %e, "recovery replay rejected");
            return;
        }
        self.next_lsn.fetch_max(lsn + 1, Ordering::AcqRel);
        {
            let mut max = self.flush_batch_max_lsn.lock();
            *max = (*max).max(lsn);
        }

        let below_truncation = lsn <= self.trunc.lock().boundary().seq_num;
        if below_truncation {
            trace!(store_id = self.store_id, lsn, "recovered record below truncation boundary, not surfaced");
            return;
        }
        if let Some(on_found) = &self.on_found {
            on_found(lsn, payload);
        }
    }

    // ---- sync flush -----------------------------------------------------

    /// Blocks until every record up to `upto_lsn` (or, if `None`, the
    /// current issued frontier) has completed.
    pub fn flush_sync(&self, upto_lsn: Option<SequenceNumber>) -> Result<()> {
        if self.journal.is_flush_thread() {
            return Err(LogStoreError::InvalidState("flush_sync must not be called from the journal's flush thread".into()));
        }
        let target = upto_lsn.unwrap_or_else(|| self.records.active_upto(None));
        if self.records.completed_upto(None) >= target {
            return Ok(());
        }

        let mut guard = self.sync_flush_lock.lock();
        self.sync_flush_waiter_lsn.store(target, Ordering::Release);
        if self.records.completed_upto(None) >= target {
            return Ok(());
        }
        self.journal.flush_if_needed();
        while self.records.completed_upto(None) < target {
            self.sync_flush_cv.wait(&mut guard);
        }
        Ok(())
    }

    // ---- rollback -------------------------------------------------------

    /// Withdraws all records with `lsn > to_lsn`. Precondition: no
    /// concurrent writers are issuing new appends above `to_lsn` for the
    /// duration of the call — the caller's responsibility, not enforced
    /// here beyond the debug assertion below.
    pub fn rollback_async(self: &Arc<Self>, to_lsn: SequenceNumber, cb: RollbackCb) -> Result<usize> {
        let truncated_upto = self.trunc.lock().boundary().seq_num;
        if to_lsn + 1 <= truncated_upto {
            return Err(LogStoreError::InvalidState(format!(
                "rollback target {to_lsn} falls within the truncated range (truncated_upto_lsn={truncated_upto})"
            )));
        }

        let issued_frontier = self.records.active_upto(None);
        if self.records.completed_upto(None) < issued_frontier {
            self.flush_sync(Some(issued_frontier))?;
            debug_assert_eq!(
                self.records.active_upto(None),
                issued_frontier,
                "issued frontier advanced while rollback waited on flush_sync"
            );
        }

        let withdrawn = (issued_frontier - to_lsn).max(0) as usize;
        self.next_lsn.store(to_lsn + 1, Ordering::Release);

        let from_key = self.records.at(to_lsn + 1).ok().and_then(|r| r.journal_key()).unwrap_or(JournalKey::INVALID);
        let to_key = self.records.at(issued_frontier).ok().and_then(|r| r.journal_key()).unwrap_or(JournalKey::INVALID);
        let logid_range = (from_key.idx, to_key.idx);

        self.records.rollback(to_lsn);

        let this = self.clone();
        let outcome = self.journal.try_lock_flush(Box::new(move || {
            if let Err(e) = this.journal.rollback(this.store_id, logid_range) {
                warn!(store_id = this.store_id, error = %e, "journal-side rollback failed");
            }
            this.trunc.lock().erase_barriers_after(to_lsn);
            *this.flush_batch_max_lsn.lock() = NONE_LSN;
            cb(to_lsn);
        }));
        if let FlushLockOutcome::AcquiredAndRan = outcome {
            self.journal.unlock_flush();
        }

        debug!(store_id = self.store_id, to_lsn, withdrawn, "rollback issued");
        Ok(withdrawn)
    }

    // ---- diagnostics ----------------------------------------------------

    pub fn status(&self) -> LogStoreStatus {
        let boundary = self.trunc.lock().boundary();
        LogStoreStatus {
            store_id: self.store_id,
            append_mode: self.append_mode,
            highest_lsn: self.records.active_upto(None),
            max_lsn_in_prev_flush_batch: *self.flush_batch_max_lsn.lock(),
            truncated_upto_logdev_key: boundary.ld_key,
            truncated_upto_lsn: boundary.seq_num,
            truncation_pending_on_device: boundary.pending_dev_truncation,
            truncation_parallel_to_writes: boundary.active_writes_not_part_of_truncation,
        }
    }

    pub fn dump(&self, request: &LogDumpRequest) -> Result<LogDumpResponse> {
        if let (Some(s), Some(e)) = (request.start_seq_num, request.end_seq_num) {
            if s > e {
                return Err(LogStoreError::InvalidArgument(format!("start_seq_num {s} is greater than end_seq_num {e}")));
            }
        }
        let floor = self.trunc.lock().boundary().seq_num + 1;
        let start = request.start_seq_num.unwrap_or(floor).max(floor);
        let end = request.end_seq_num.unwrap_or(SequenceNumber::MAX);
        let batch_size = request.batch_size.unwrap_or(DEFAULT_DUMP_BATCH_SIZE);

        let mut records = Vec::new();
        let mut next_cursor = None;
        let mut count = 0usize;

        self.records.foreach_completed(start, |lsn, _frontier, state| {
            if lsn > end {
                return false;
            }
            if count >= batch_size {
                next_cursor = Some(lsn.to_string());
                return false;
            }
            let key = state.journal_key().expect("foreach_completed only yields Completed entries");
            let mut size = 0u32;
            let content_base64 = if request.verbosity == DumpVerbosity::Content {
                match self.journal.read(key) {
                    Ok(payload) => {
                        size = payload.len() as u32;
                        Some(base64::engine::general_purpose::STANDARD.encode(&payload))
                    }
                    Err(e) => {
                        warn!(store_id = self.store_id, lsn, error = %e, "dump read failed");
                        None
                    }
                }
            } else {
                None
            };
            records.push(LogRecordDump { seq_num: lsn, size, store_id: self.store_id, content_base64 });
            count += 1;
            true
        });

        Ok(LogDumpResponse { records, next_cursor })
    }

    /// Called by the family during a device truncation pass.
    pub(crate) fn pre_device_truncation(&self) -> crate::types::TruncationBoundary {
        self.trunc.lock().pre_device_truncation()
    }

    /// Called by the family once the physical device truncate at
    /// `new_ld_key` has completed, only on stores whose own boundary
    /// equals the chosen minimum.
    pub(crate) fn post_device_truncation(&self, new_ld_key: JournalKey) {
        self.trunc.lock().post_device_truncation(new_ld_key);
    }
}
