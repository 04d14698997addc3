// tenant-log-store — a multi-tenant log store layered atop a shared
// append-only journal device.

pub mod error;
pub mod types;

pub mod record_index;
pub mod truncation;

pub mod journal;
pub mod log_store;
pub mod family;

pub use error::{LogStoreError, Result};
pub use family::LogStoreFamily;
pub use journal::{Cookie, IoCompletionSink, JournalPort};
pub use log_store::{LogFoundCb, LogStore, RollbackCb, TruncationCoordinator, WriteCompletionCb};
pub use types::{
    DumpVerbosity, FlushLockOutcome, JournalKey, LogDumpRequest, LogDumpResponse, LogRecordDump,
    LogStoreStatus, LogStoreSuperblock, RecordState, RecordStatus, SequenceNumber, NONE_LSN,
};

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

/// Process-lifetime configuration of the log store subsystem.
#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    /// Default page size for `LogStore::dump` when the caller doesn't
    /// supply `batch_size` on the request.
    pub dump_batch_size: usize,
    /// Truncation-barrier `Vec` capacity reserved up front for every
    /// store a family creates or opens, mirroring the original's
    /// `reserve(10000)` against a long-running log's expected churn.
    pub expected_barriers: usize,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            dump_batch_size: log_store::DEFAULT_DUMP_BATCH_SIZE,
            expected_barriers: 10_000,
        }
    }
}

/// Process-lifetime handle to the log store subsystem. Replaces the
/// original's implicit global singleton with an explicit, owned object:
/// nothing is constructed on first use, and nothing outlives `shutdown`.
pub struct LogStoreManager {
    config: LogStoreConfig,
    families: Mutex<Vec<Arc<LogStoreFamily>>>,
}

impl LogStoreManager {
    pub fn init(config: LogStoreConfig) -> Self {
        info!(
            dump_batch_size = config.dump_batch_size,
            expected_barriers = config.expected_barriers,
            "log store manager initialized"
        );
        Self { config, families: Mutex::new(Vec::new()) }
    }

    pub fn config(&self) -> &LogStoreConfig {
        &self.config
    }

    /// Wraps a journal device in a new `LogStoreFamily`, applying this
    /// manager's `expected_barriers` hint to every store it creates.
    pub fn open_family(&self, journal: Arc<dyn JournalPort>) -> Arc<LogStoreFamily> {
        let family = LogStoreFamily::new(journal, self.config.expected_barriers);
        self.families.lock().push(family.clone());
        family
    }

    pub fn families(&self) -> Vec<Arc<LogStoreFamily>> {
        self.families.lock().clone()
    }

    /// Consumes the manager. Families and their stores are plain `Arc`s
    /// and keep working if a caller is still holding one; this just
    /// drops the manager's own registry.
    pub fn shutdown(self) {
        let count = self.families.lock().len();
        debug!(family_count = count, "log store manager shutting down");
    }
}
