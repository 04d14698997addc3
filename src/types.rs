// Core data types shared across the log store core.
//
// These are plain value types; the state machines that interpret them
// live in `record_index`, `truncation`, `log_store` and `family`.

use serde::{Deserialize, Serialize};

/// Per-log monotonic sequence number. `NONE` denotes "no value".
pub type SequenceNumber = i64;

/// Sentinel meaning "no sequence number".
pub const NONE_LSN: SequenceNumber = -1;

/// Opaque location of a record on the shared journal device.
///
/// Ordered by `idx` then `dev_offset` — this is the order used to find
/// the minimum truncation point across tenants sharing one journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct JournalKey {
    pub idx: i64,
    pub dev_offset: u64,
}

impl JournalKey {
    pub const INVALID: JournalKey = JournalKey { idx: -1, dev_offset: 0 };

    /// An empty key marks a gap-fill rather than a real record.
    pub fn empty() -> Self {
        Self::INVALID
    }

    pub fn is_valid(&self) -> bool {
        self.idx >= 0
    }
}

/// Lifecycle state of a single sequence number in a `RecordIndex`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    /// Below the issued frontier but never written.
    Hole,
    /// Append in flight; no journal key assigned yet.
    Issued,
    /// Journal acknowledged the append at this location.
    Completed(JournalKey),
    /// Below the truncation boundary; reads fail.
    Truncated,
}

impl RecordState {
    pub fn journal_key(&self) -> Option<JournalKey> {
        match self {
            RecordState::Completed(key) => Some(*key),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RecordState::Completed(_))
    }
}

/// Result of `RecordIndex::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordStatus {
    pub is_hole: bool,
    pub is_out_of_range: bool,
    pub is_completed: bool,
}

/// `(seq_num, ld_key)`: at device truncation point `ld_key`, all of this
/// log's records up to `seq_num` are durable. Barriers are kept sorted
/// ascending by `seq_num`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationBarrier {
    pub seq_num: SequenceNumber,
    pub ld_key: JournalKey,
}

/// The safe-truncation state of a single log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationBoundary {
    pub seq_num: SequenceNumber,
    pub ld_key: JournalKey,
    pub pending_dev_truncation: bool,
    pub active_writes_not_part_of_truncation: bool,
}

impl TruncationBoundary {
    pub fn new(start_lsn: SequenceNumber) -> Self {
        Self {
            seq_num: start_lsn - 1,
            ld_key: JournalKey::INVALID,
            pending_dev_truncation: false,
            active_writes_not_part_of_truncation: false,
        }
    }
}

/// Persisted per-store metadata, opaque to callers.
///
/// `-1` means uninitialized/cleared; `>= 0` is a valid first sequence
/// number surviving in the log (i.e. `truncated_upto_lsn + 1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStoreSuperblock {
    pub first_seq_num: SequenceNumber,
}

impl LogStoreSuperblock {
    pub fn default_value() -> Self {
        Self { first_seq_num: -1 }
    }

    pub fn init(&mut self) {
        self.first_seq_num = 0;
    }

    pub fn clear(&mut self) {
        self.first_seq_num = -1;
    }

    pub fn is_valid(&self) -> bool {
        self.first_seq_num >= 0
    }
}

impl Default for LogStoreSuperblock {
    fn default() -> Self {
        Self::default_value()
    }
}

/// Outcome of requesting the journal's cooperative flush lock.
///
/// `AcquiredAndRan` means the continuation already ran synchronously and
/// the caller is responsible for releasing the lock; `Deferred` means the
/// journal will run the continuation itself once the in-flight flush
/// completes, and the caller must not unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushLockOutcome {
    AcquiredAndRan,
    Deferred,
}

/// Verbosity requested for a record dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpVerbosity {
    #[default]
    Header,
    Content,
}

/// Request parameters for `LogStore::dump`.
#[derive(Debug, Clone, Default)]
pub struct LogDumpRequest {
    pub start_seq_num: Option<SequenceNumber>,
    pub end_seq_num: Option<SequenceNumber>,
    pub batch_size: Option<usize>,
    pub verbosity: DumpVerbosity,
}

/// One record in a dump response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecordDump {
    pub seq_num: SequenceNumber,
    pub size: u32,
    pub store_id: u32,
    /// Present only when the request asked for `DumpVerbosity::Content`.
    pub content_base64: Option<String>,
}

/// Response from `LogStore::dump`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogDumpResponse {
    pub records: Vec<LogRecordDump>,
    pub next_cursor: Option<String>,
}

/// Cheap, scalar-only diagnostics snapshot of a single log store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStoreStatus {
    pub store_id: u32,
    pub append_mode: bool,
    pub highest_lsn: SequenceNumber,
    pub max_lsn_in_prev_flush_batch: SequenceNumber,
    pub truncated_upto_logdev_key: JournalKey,
    pub truncated_upto_lsn: SequenceNumber,
    pub truncation_pending_on_device: bool,
    pub truncation_parallel_to_writes: bool,
}
