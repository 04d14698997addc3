// Groups every log sharing one journal device: owns the id -> store map,
// dispatches journal completions to the right store, and aggregates
// per-store truncation boundaries into one safe device-truncation point.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::error::{LogStoreError, Result};
use crate::journal::{Cookie, IoCompletionSink, JournalPort};
use crate::log_store::{LogFoundCb, LogStore, TruncationCoordinator};
use crate::types::{JournalKey, LogStoreSuperblock, SequenceNumber};

struct PendingFoundRecord {
    lsn: SequenceNumber,
    ld_key: JournalKey,
    flush_ld_key: JournalKey,
    payload: Vec<u8>,
}

/// Owns every `LogStore` sharing one journal, and is that journal's
/// `IoCompletionSink`: every completion the journal reports is routed
/// here first, then to the owning store.
pub struct LogStoreFamily {
    journal: Arc<dyn JournalPort>,
    id_map: RwLock<HashMap<u32, Arc<LogStore>>>,
    next_store_id: AtomicU32,
    /// Barrier-vector capacity hint applied to every store this family
    /// creates or opens; see `LogStoreConfig::expected_barriers`.
    expected_barriers: usize,

    /// Store ids that have had at least one completion in the
    /// in-flight flush batch, drained once `n_remaining_in_batch` hits
    /// zero so each can receive `on_batch_completion`.
    batch_participants: Mutex<HashSet<u32>>,

    /// Stores discovered during recovery replay but not yet opened by a
    /// tenant, keyed by store id.
    unopened_superblocks: Mutex<HashMap<u32, LogStoreSuperblock>>,
    /// Replay records for those same not-yet-opened stores, delivered
    /// once the tenant finally calls `open_log_store`.
    unopened_records: Mutex<HashMap<u32, Vec<PendingFoundRecord>>>,
}

impl LogStoreFamily {
    pub fn new(journal: Arc<dyn JournalPort>, expected_barriers: usize) -> Arc<Self> {
        let family = Arc::new(Self {
            journal: journal.clone(),
            id_map: RwLock::new(HashMap::new()),
            next_store_id: AtomicU32::new(0),
            expected_barriers,
            batch_participants: Mutex::new(HashSet::new()),
            unopened_superblocks: Mutex::new(HashMap::new()),
            unopened_records: Mutex::new(HashMap::new()),
        });
        let sink: Arc<dyn IoCompletionSink> = family.clone();
        journal.attach_sink(sink);
        family
    }

    pub fn create_new_log_store(self: &Arc<Self>, append_mode: bool) -> Arc<LogStore> {
        let store_id = self.next_store_id.fetch_add(1, Ordering::AcqRel);
        let coordinator: Weak<dyn TruncationCoordinator> = Arc::downgrade(self);
        let store = Arc::new(LogStore::new(store_id, append_mode, 0, self.journal.clone(), Some(coordinator), None));
        store.reserve_barrier_capacity(self.expected_barriers);
        self.id_map.write().insert(store_id, store.clone());
        debug!(store_id, append_mode, "log store created");
        store
    }

    /// Opens a store by id, seeding its start lsn from a persisted
    /// superblock if this id was discovered during recovery but never
    /// opened, and replaying any replay records buffered for it.
    pub fn open_log_store(self: &Arc<Self>, store_id: u32, append_mode: bool, on_found: Option<LogFoundCb>) -> Result<Arc<LogStore>> {
        if let Some(existing) = self.id_map.read().get(&store_id) {
            return Ok(existing.clone());
        }

        let start_lsn = self
            .unopened_superblocks
            .lock()
            .remove(&store_id)
            .filter(LogStoreSuperblock::is_valid)
            .map(|sb| sb.first_seq_num)
            .unwrap_or(0);

        let coordinator: Weak<dyn TruncationCoordinator> = Arc::downgrade(self);
        let store = Arc::new(LogStore::new(store_id, append_mode, start_lsn, self.journal.clone(), Some(coordinator), on_found));
        store.reserve_barrier_capacity(self.expected_barriers);

        if let Some(pending) = self.unopened_records.lock().remove(&store_id) {
            for rec in pending {
                store.on_log_found(rec.lsn, rec.ld_key, &rec.payload);
                store.on_batch_completion(rec.flush_ld_key);
            }
        }

        self.id_map.write().insert(store_id, store.clone());
        debug!(store_id, append_mode, start_lsn, "log store opened");
        Ok(store)
    }

    pub fn remove_log_store(&self, store_id: u32) -> Result<()> {
        self.id_map.write().remove(&store_id).ok_or(LogStoreError::NotFound(store_id))?;
        debug!(store_id, "log store removed");
        Ok(())
    }

    pub fn find_logstore_by_id(&self, store_id: u32) -> Option<Arc<LogStore>> {
        self.id_map.read().get(&store_id).cloned()
    }

    /// Records a store discovered on the journal during recovery before
    /// any tenant has opened it, so the eventual `open_log_store` can
    /// seed its start lsn from `superblk`.
    pub fn on_log_store_found(&self, store_id: u32, superblk: LogStoreSuperblock) {
        if self.id_map.read().contains_key(&store_id) {
            return;
        }
        self.unopened_superblocks.lock().insert(store_id, superblk);
        debug!(store_id, first_seq_num = superblk.first_seq_num, "log store discovered during recovery, awaiting open");
    }

    /// Forwards a replayed record to its owning store, or buffers it if
    /// the store hasn't been opened yet.
    ///
    /// For an already-open store, this reuses the same batch-countdown
    /// path as live I/O completions: once `n_remaining_in_batch` reaches
    /// zero, every store that had a record in this replay batch receives
    /// `on_batch_completion`. For a not-yet-opened store `drain_batch_if_complete`
    /// can't reach it (it isn't in `id_map` yet), so each buffered record
    /// carries its own `flush_ld_key` forward; `open_log_store` replays it
    /// through `on_batch_completion` once the store is finally opened,
    /// reconstructing a truncation barrier per buffered record.
    pub fn on_logfound(
        &self,
        store_id: u32,
        lsn: SequenceNumber,
        ld_key: JournalKey,
        flush_ld_key: JournalKey,
        payload: Vec<u8>,
        n_remaining_in_batch: u32,
    ) {
        match self.find_logstore_by_id(store_id) {
            Some(store) => store.on_log_found(lsn, ld_key, &payload),
            None => {
                self.unopened_records
                    .lock()
                    .entry(store_id)
                    .or_default()
                    .push(PendingFoundRecord { lsn, ld_key, flush_ld_key, payload });
                trace!(store_id, lsn, "replay record buffered for not-yet-opened log store");
            }
        }
        self.drain_batch_if_complete(store_id, flush_ld_key, n_remaining_in_batch);
    }

    fn drain_batch_if_complete(&self, store_id: u32, flush_ld_key: JournalKey, n_remaining_in_batch: u32) {
        let mut participants = self.batch_participants.lock();
        participants.insert(store_id);
        if n_remaining_in_batch != 0 {
            return;
        }
        let ids: Vec<u32> = participants.drain().collect();
        drop(participants);
        for id in ids {
            if let Some(store) = self.find_logstore_by_id(id) {
                store.on_batch_completion(flush_ld_key);
            }
        }
    }

    /// Computes the minimum safe truncation point across every open
    /// store and, unless `dry_run`, truncates the physical device there.
    pub fn do_device_truncate(&self, dry_run: bool) -> JournalKey {
        let stores: Vec<Arc<LogStore>> = self.id_map.read().values().cloned().collect();
        let boundaries: Vec<(Arc<LogStore>, JournalKey)> =
            stores.into_iter().map(|s| { let b = s.pre_device_truncation(); (s, b.ld_key) }).collect();

        let min_key = boundaries.iter().map(|(_, key)| *key).min().unwrap_or(JournalKey::INVALID);

        if dry_run {
            return min_key;
        }
        if let Err(e) = self.journal.device_truncate(min_key) {
            warn!(error = %e, "device truncate failed");
            return min_key;
        }
        for (store, boundary_key) in &boundaries {
            if *boundary_key == min_key {
                store.post_device_truncation(min_key);
            }
        }
        debug!(idx = min_key.idx, dev_offset = min_key.dev_offset, "device truncated");
        min_key
    }
}

impl TruncationCoordinator for LogStoreFamily {
    fn request_device_truncate(&self) {
        self.do_device_truncate(false);
    }
}

impl IoCompletionSink for LogStoreFamily {
    fn on_io_completion(
        &self,
        store_id: u32,
        lsn: SequenceNumber,
        ld_key: JournalKey,
        flush_ld_key: JournalKey,
        n_remaining_in_batch: u32,
        cookie: Cookie,
    ) {
        let _ = cookie;
        match self.find_logstore_by_id(store_id) {
            Some(store) => store.on_write_completion(lsn, ld_key),
            None => warn!(store_id, lsn, "completion for unknown or unopened log store"),
        }
        self.drain_batch_if_complete(store_id, flush_ld_key, n_remaining_in_batch);
    }
}
