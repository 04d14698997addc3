// In-process `JournalPort` double used by this crate's own tests (and
// available to downstream integration tests behind the `test-util`
// feature). It is reference/test tooling, not a production journal:
// durability is a `HashMap` behind a mutex, and batch membership is
// whatever the test driver asks for via `complete_batch`.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LogStoreError, Result};
use crate::journal::{Cookie, IoCompletionSink, JournalPort};
use crate::types::{FlushLockOutcome, JournalKey, LogStoreSuperblock, SequenceNumber};

thread_local! {
    static IS_FLUSH_THREAD: Cell<bool> = Cell::new(false);
}

/// Runs `f` marked as "the journal's flush thread" for the duration of
/// the call, so `JournalPort::is_flush_thread` returns `true` inside it.
/// Mirrors the original's `iomanager.am_i_worker_reactor()` predicate.
pub fn run_as_flush_thread<R>(f: impl FnOnce() -> R) -> R {
    IS_FLUSH_THREAD.with(|c| c.set(true));
    let result = f();
    IS_FLUSH_THREAD.with(|c| c.set(false));
    result
}

struct PendingAppend {
    store_id: u32,
    lsn: SequenceNumber,
    key: JournalKey,
    cookie: Cookie,
}

struct Inner {
    sink: Option<Arc<dyn IoCompletionSink>>,
    storage: HashMap<JournalKey, Vec<u8>>,
    pending: VecDeque<PendingAppend>,
    superblocks: HashMap<u32, LogStoreSuperblock>,
    rollback_calls: Vec<(u32, (i64, i64))>,
    device_truncate_calls: Vec<JournalKey>,
    deferred: Vec<Box<dyn FnOnce() + Send>>,
}

/// An in-memory stand-in for the shared journal device.
pub struct InMemoryJournal {
    inner: Mutex<Inner>,
    next_idx: AtomicI64,
    flush_locked: AtomicBool,
    /// When true (the default), `flush_if_needed` completes every
    /// currently pending append as one batch, the way a real device
    /// eventually would. Tests that need to control completion order
    /// precisely can disable this and drive `complete_batch` themselves.
    auto_complete_on_flush: AtomicBool,
    /// When true, `append_async` rejects every call synchronously instead
    /// of queuing it, exercising the journal's own fallible contract for
    /// callers that need to test the failed-append unwind path.
    reject_appends: AtomicBool,
}

impl Default for InMemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sink: None,
                storage: HashMap::new(),
                pending: VecDeque::new(),
                superblocks: HashMap::new(),
                rollback_calls: Vec::new(),
                device_truncate_calls: Vec::new(),
                deferred: Vec::new(),
            }),
            next_idx: AtomicI64::new(0),
            flush_locked: AtomicBool::new(false),
            auto_complete_on_flush: AtomicBool::new(true),
            reject_appends: AtomicBool::new(false),
        }
    }

    pub fn with_manual_flush(self) -> Self {
        self.auto_complete_on_flush.store(false, Ordering::SeqCst);
        self
    }

    /// Makes every subsequent `append_async` fail synchronously instead
    /// of queuing, for exercising the failed-append unwind path.
    pub fn with_rejected_appends(self) -> Self {
        self.reject_appends.store(true, Ordering::SeqCst);
        self
    }

    /// Completes the given `(store_id, lsn)` pairs, in the order given,
    /// as a single flush batch. `n_remaining_in_batch` counts down to
    /// zero on the last entry; `flush_ld_key` is the highest journal key
    /// among the completed entries.
    pub fn complete_batch(&self, targets: &[(u32, SequenceNumber)]) {
        let (found, sink) = {
            let mut inner = self.inner.lock();
            let mut found = Vec::with_capacity(targets.len());
            for &(store_id, lsn) in targets {
                if let Some(pos) = inner.pending.iter().position(|p| p.store_id == store_id && p.lsn == lsn) {
                    found.push(inner.pending.remove(pos).expect("position just checked"));
                }
            }
            (found, inner.sink.clone())
        };
        let sink = sink.expect("JournalPort::attach_sink was never called");
        let flush_key = found.iter().map(|p| p.key).max().unwrap_or(JournalKey::INVALID);
        let total = found.len() as u32;
        for (i, p) in found.into_iter().enumerate() {
            let remaining = total - i as u32 - 1;
            sink.on_io_completion(p.store_id, p.lsn, p.key, flush_key, remaining, p.cookie);
        }
    }

    /// Completes every currently pending append as one batch, FIFO.
    pub fn complete_all_pending(&self) {
        let targets: Vec<(u32, SequenceNumber)> = {
            let inner = self.inner.lock();
            inner.pending.iter().map(|p| (p.store_id, p.lsn)).collect()
        };
        if !targets.is_empty() {
            self.complete_batch(&targets);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn rollback_calls(&self) -> Vec<(u32, (i64, i64))> {
        self.inner.lock().rollback_calls.clone()
    }

    pub fn device_truncate_calls(&self) -> Vec<JournalKey> {
        self.inner.lock().device_truncate_calls.clone()
    }

    pub fn superblock(&self, store_id: u32) -> Option<LogStoreSuperblock> {
        self.inner.lock().superblocks.get(&store_id).copied()
    }
}

impl JournalPort for InMemoryJournal {
    fn attach_sink(&self, sink: Arc<dyn IoCompletionSink>) {
        self.inner.lock().sink = Some(sink);
    }

    fn append_async(&self, store_id: u32, lsn: SequenceNumber, payload: Vec<u8>, cookie: Cookie) -> Result<()> {
        if self.reject_appends.load(Ordering::SeqCst) {
            return Err(LogStoreError::Journal(format!("append rejected for store {store_id} lsn {lsn}")));
        }
        let idx = self.next_idx.fetch_add(1, Ordering::SeqCst);
        let key = JournalKey { idx, dev_offset: idx as u64 };
        let mut inner = self.inner.lock();
        inner.storage.insert(key, payload);
        inner.pending.push_back(PendingAppend { store_id, lsn, key, cookie });
        Ok(())
    }

    fn read(&self, ld_key: JournalKey) -> Result<Vec<u8>> {
        if !ld_key.is_valid() {
            // Gap-fill entries carry an empty key; reads return an empty
            // payload rather than an error.
            return Ok(Vec::new());
        }
        self.inner
            .lock()
            .storage
            .get(&ld_key)
            .cloned()
            .ok_or_else(|| LogStoreError::Journal(format!("no record at journal key {ld_key:?}")))
    }

    fn try_lock_flush(&self, continuation: Box<dyn FnOnce() + Send>) -> FlushLockOutcome {
        if self
            .flush_locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            continuation();
            FlushLockOutcome::AcquiredAndRan
        } else {
            self.inner.lock().deferred.push(continuation);
            FlushLockOutcome::Deferred
        }
    }

    fn unlock_flush(&self) {
        let deferred: Vec<_> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.deferred)
        };
        self.flush_locked.store(false, Ordering::SeqCst);
        for continuation in deferred {
            // Re-acquire on behalf of the deferred caller, matching the
            // original's "journal executes it after the in-flight flush
            // completes" semantics.
            if self
                .flush_locked
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                continuation();
                self.flush_locked.store(false, Ordering::SeqCst);
            }
        }
    }

    fn flush_if_needed(&self) {
        if self.auto_complete_on_flush.load(Ordering::SeqCst) {
            self.complete_all_pending();
        }
    }

    fn rollback(&self, store_id: u32, logid_range: (i64, i64)) -> Result<()> {
        self.inner.lock().rollback_calls.push((store_id, logid_range));
        Ok(())
    }

    fn update_store_superblk(&self, store_id: u32, sb: LogStoreSuperblock, _persist_now: bool) {
        self.inner.lock().superblocks.insert(store_id, sb);
    }

    fn device_truncate(&self, upto: JournalKey) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.device_truncate_calls.push(upto);
        inner.storage.retain(|key, _| key.idx > upto.idx);
        Ok(())
    }

    fn is_flush_thread(&self) -> bool {
        IS_FLUSH_THREAD.with(|c| c.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        completions: StdMutex<Vec<(u32, SequenceNumber, JournalKey, JournalKey, u32, Cookie)>>,
    }

    impl IoCompletionSink for RecordingSink {
        fn on_io_completion(
            &self,
            store_id: u32,
            lsn: SequenceNumber,
            ld_key: JournalKey,
            flush_ld_key: JournalKey,
            n_remaining_in_batch: u32,
            cookie: Cookie,
        ) {
            self.completions.lock().unwrap().push((store_id, lsn, ld_key, flush_ld_key, n_remaining_in_batch, cookie));
        }
    }

    #[test]
    fn complete_batch_delivers_in_requested_order_with_countdown() {
        let journal = InMemoryJournal::new();
        let sink = Arc::new(RecordingSink { completions: StdMutex::new(Vec::new()) });
        journal.attach_sink(sink.clone());

        for lsn in 0..3 {
            journal.append_async(1, lsn, vec![lsn as u8], 0).unwrap();
        }
        journal.complete_batch(&[(1, 2), (1, 0), (1, 1)]);

        let completions = sink.completions.lock().unwrap();
        assert_eq!(completions.len(), 3);
        assert_eq!(completions[0].1, 2);
        assert_eq!(completions[0].4, 2);
        assert_eq!(completions[2].1, 1);
        assert_eq!(completions[2].4, 0);
    }

    #[test]
    fn gap_fill_key_reads_as_empty() {
        let journal = InMemoryJournal::new();
        assert_eq!(journal.read(JournalKey::empty()).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn try_lock_flush_defers_when_already_held() {
        let journal = InMemoryJournal::new();
        let ran_first = Arc::new(AtomicBool::new(false));
        let ran_first2 = ran_first.clone();
        let outcome = journal.try_lock_flush(Box::new(move || {
            ran_first2.store(true, Ordering::SeqCst);
        }));
        assert_eq!(outcome, FlushLockOutcome::AcquiredAndRan);
        assert!(ran_first.load(Ordering::SeqCst));

        // Hold the lock manually to force the next request to defer.
        journal.flush_locked.store(true, Ordering::SeqCst);
        let ran_second = Arc::new(AtomicBool::new(false));
        let ran_second2 = ran_second.clone();
        let outcome = journal.try_lock_flush(Box::new(move || {
            ran_second2.store(true, Ordering::SeqCst);
        }));
        assert_eq!(outcome, FlushLockOutcome::Deferred);
        assert!(!ran_second.load(Ordering::SeqCst));

        journal.unlock_flush();
        assert!(ran_second.load(Ordering::SeqCst));
    }
}
