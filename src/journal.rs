// The external contract this crate depends on but does not implement:
// the shared append-only journal device ("LogDev" in the original
// source). Production code wires a real device behind this trait; the
// `testkit` module (feature `test-util`) ships the in-process double
// this crate's own tests are built on.

use std::sync::Arc;

use crate::error::Result;
use crate::types::{FlushLockOutcome, JournalKey, LogStoreSuperblock, SequenceNumber};

/// Opaque token threaded unchanged from `append_async` through to the
/// user's completion callback. Not interpreted by the journal or the
/// core — purely a caller convenience (the original's `void* cookie`).
pub type Cookie = u64;

/// The sink a `JournalPort` delivers completions to. `LogStoreFamily`
/// is the only production implementor; it routes each completion to the
/// owning store and, once a batch drains to zero remaining, to every
/// participating store's `on_batch_completion`.
pub trait IoCompletionSink: Send + Sync {
    fn on_io_completion(
        &self,
        store_id: u32,
        lsn: SequenceNumber,
        ld_key: JournalKey,
        flush_ld_key: JournalKey,
        n_remaining_in_batch: u32,
        cookie: Cookie,
    );
}

/// Contract the log store core depends on. See `SPEC_FULL.md` §4.5.
pub trait JournalPort: Send + Sync {
    /// Registers the completion sink (normally the owning `LogStoreFamily`).
    /// Must be called once before any `append_async`.
    fn attach_sink(&self, sink: Arc<dyn IoCompletionSink>);

    /// Durably appends `payload` for `(store_id, lsn)`. Completion is
    /// delivered asynchronously to the attached sink.
    fn append_async(&self, store_id: u32, lsn: SequenceNumber, payload: Vec<u8>, cookie: Cookie) -> Result<()>;

    /// Synchronous payload retrieval for a previously completed record.
    fn read(&self, ld_key: JournalKey) -> Result<Vec<u8>>;

    /// Requests the journal's cooperative flush lock. If the lock is
    /// free, `continuation` runs synchronously before this call returns
    /// `AcquiredAndRan` and the caller must call `unlock_flush`.
    /// Otherwise the journal defers `continuation` to run after the
    /// in-flight flush completes and returns `Deferred`; the caller must
    /// not call `unlock_flush` in that case.
    fn try_lock_flush(&self, continuation: Box<dyn FnOnce() + Send>) -> FlushLockOutcome;

    /// Releases the flush lock acquired via `AcquiredAndRan`.
    fn unlock_flush(&self);

    /// Requests a flush pass with the minimum threshold (used by
    /// `flush_sync` to force progress rather than wait for a timer).
    fn flush_if_needed(&self);

    /// Persists a store-scoped rollback of journal ids in `logid_range`
    /// (inclusive start, inclusive end, by `idx`).
    fn rollback(&self, store_id: u32, logid_range: (i64, i64)) -> Result<()>;

    /// Writes per-store metadata. `persist_now` forces an immediate
    /// durable write rather than deferring to the next device truncate.
    fn update_store_superblk(&self, store_id: u32, sb: LogStoreSuperblock, persist_now: bool);

    /// Physically truncates device space up to and including `upto`.
    fn device_truncate(&self, upto: JournalKey) -> Result<()>;

    /// True when called from a thread the journal uses to carry out
    /// flushes/completions — used to refuse sync calls that would
    /// otherwise deadlock against themselves.
    fn is_flush_thread(&self) -> bool;
}

#[cfg(any(test, feature = "test-util"))]
pub mod testkit;
