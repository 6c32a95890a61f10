// ABOUTME: Durable, capacity-bounded log queue partitioned by group with in-memory pending batches.
// ABOUTME: Orchestrates the row store, large payload files, and token encryption under one lock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use logspool_core::{FormatError, LogRecord, LogSerializer, SerializeError};
use thiserror::Error;
use ulid::Ulid;

use crate::config::{ConfigError, StoreConfig};
use crate::crypto::{Crypto, CryptoError};
use crate::payload::{PayloadError, PayloadStore};
use crate::rows::{ColumnDef, Order, Row, RowStore, RowStoreError, TableSpec};

pub const COLUMN_GROUP: &str = "persistence_group";
/// Serialized body, or null when the body lives in a large payload file.
pub const COLUMN_LOG: &str = "log";
pub const COLUMN_TARGET_TOKEN: &str = "target_token";
pub const COLUMN_DATA_TYPE: &str = "data_type";

const COLUMNS: &[ColumnDef] = &[
    ColumnDef {
        name: COLUMN_GROUP,
        since: 1,
    },
    ColumnDef {
        name: COLUMN_LOG,
        since: 1,
    },
    ColumnDef {
        name: COLUMN_TARGET_TOKEN,
        since: 2,
    },
    ColumnDef {
        name: COLUMN_DATA_TYPE,
        since: 2,
    },
];

/// Layout of the `logs` table at the current schema version.
pub const LOGS_TABLE: TableSpec = TableSpec {
    table: "logs",
    version: 2,
    columns: COLUMNS,
};

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(RowStoreError),

    #[error("large payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("failed to evict row {row_id} to make room: {source}")]
    Eviction {
        row_id: i64,
        #[source]
        source: RowStoreError,
    },

    #[error("schema migration failed: {0}")]
    Migration(RowStoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] SerializeError),

    #[error("token encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("log of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
}

impl From<RowStoreError> for PersistenceError {
    fn from(e: RowStoreError) -> Self {
        match e {
            RowStoreError::Migration { .. } | RowStoreError::NewerSchema { .. } => {
                PersistenceError::Migration(e)
            }
            other => PersistenceError::Storage(other),
        }
    }
}

impl PersistenceError {
    /// Whether the failure came from disk or filesystem access.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            PersistenceError::Storage(_)
                | PersistenceError::Payload(_)
                | PersistenceError::Eviction { .. }
        )
    }
}

/// Opaque identifier of a drained batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(Ulid);

impl BatchId {
    fn new() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for BatchId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Records handed to a consumer together, reserved until acknowledged or released.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub group: String,
    pub logs: Vec<LogRecord>,
}

struct PendingBatch {
    id: BatchId,
    row_ids: Vec<i64>,
}

/// Why a stored row could not be turned back into a record.
#[derive(Debug, Error)]
enum RowDefect {
    #[error("large payload unreadable: {0}")]
    Payload(#[from] PayloadError),

    #[error("body does not decode: {0}")]
    Format(#[from] FormatError),

    #[error("target token does not decrypt: {0}")]
    Token(#[from] CryptoError),
}

struct Inner {
    rows: RowStore,
    payloads: PayloadStore,
    crypto: Crypto,
    pending: HashMap<String, Vec<PendingBatch>>,
}

/// The persistent log queue.
///
/// Every operation runs under a single lock covering the row store, the
/// payload files and the pending-batch map, so no caller observes a
/// half-evicted or half-offloaded row. Pending batches live in memory only;
/// reopening the store makes every row drainable again.
pub struct Persistence {
    inner: Mutex<Inner>,
    serializer: Arc<dyn LogSerializer>,
    config: StoreConfig,
}

impl fmt::Debug for Persistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistence")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Persistence {
    /// Open the queue described by `config`, building its token cipher and
    /// payload directory from the same configuration.
    pub fn open(
        config: StoreConfig,
        serializer: Arc<dyn LogSerializer>,
    ) -> Result<Self, PersistenceError> {
        config.validate()?;
        let crypto = config.crypto()?;
        let payloads = PayloadStore::new(config.payload_root());
        Self::open_with(config, crypto, payloads, serializer)
    }

    /// Open with explicitly supplied collaborators.
    pub fn open_with(
        config: StoreConfig,
        crypto: Crypto,
        payloads: PayloadStore,
        serializer: Arc<dyn LogSerializer>,
    ) -> Result<Self, PersistenceError> {
        config.validate()?;
        let rows = RowStore::open(&config.database_path(), LOGS_TABLE)?;
        if let Err(e) = payloads.sweep() {
            tracing::warn!(error = %e, "failed to clean up interrupted payload writes");
        }
        tracing::info!(
            path = %config.database_path().display(),
            capacity = config.capacity,
            stored = rows.count(None)?,
            "opened log queue"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                rows,
                payloads,
                crypto,
                pending: HashMap::new(),
            }),
            serializer,
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Each operation leaves SQLite consistent, so a panic elsewhere does
        // not invalidate the state behind the lock.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a record in a group and return its row id.
    pub fn append(&self, group: &str, record: &LogRecord) -> Result<i64, PersistenceError> {
        let body = self.serializer.serialize(record)?;
        let token = record.target_token.as_deref();

        let size = body.len() + token.map_or(0, str::len);
        if size > self.config.max_payload_size {
            return Err(PersistenceError::PayloadTooLarge {
                size,
                limit: self.config.max_payload_size,
            });
        }
        let offload = size >= self.config.inline_threshold;
        if offload && record.is_common_schema() {
            return Err(PersistenceError::PayloadTooLarge {
                size,
                limit: self.config.inline_threshold,
            });
        }

        let mut guard = self.lock();
        let inner = &mut *guard;

        let token = token.map(|t| inner.crypto.encrypt(t)).transpose()?;

        // The body reaches disk before anything is evicted or inserted; it
        // takes its row id name only once the row exists.
        let staged = if offload {
            match inner.payloads.stage(group, &body) {
                Ok(staged) => Some(staged),
                Err(e) => {
                    tracing::error!(group, size, error = %e, "failed to offload large log");
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let inserted = self.make_room(inner).and_then(|()| {
            Ok(inner.rows.insert(&[
                (COLUMN_GROUP, Some(group)),
                (COLUMN_LOG, if offload { None } else { Some(body.as_str()) }),
                (COLUMN_TARGET_TOKEN, token.as_deref()),
                (COLUMN_DATA_TYPE, Some(record.log_type.as_str())),
            ])?)
        });
        let row_id = match inserted {
            Ok(row_id) => row_id,
            Err(e) => {
                if let Some(staged) = staged {
                    inner.payloads.discard(staged);
                }
                return Err(e);
            }
        };

        if let Some(staged) = staged
            && let Err(e) = inner.payloads.commit(staged, row_id)
        {
            tracing::error!(group, row_id, error = %e, "failed to bind large log to its row");
            if let Err(cleanup) = inner.rows.delete(row_id) {
                tracing::error!(row_id, error = %cleanup, "failed to remove row after offload failure");
            }
            return Err(e.into());
        }

        tracing::debug!(group, row_id, size, offload, "appended log");
        Ok(row_id)
    }

    /// Evict globally-oldest rows until one more row fits under capacity.
    fn make_room(&self, inner: &mut Inner) -> Result<(), PersistenceError> {
        while inner.rows.count(None)? >= self.config.capacity {
            let Some(victim) = inner.rows.oldest()? else {
                break;
            };
            let group = victim.get(COLUMN_GROUP).unwrap_or_default();

            inner
                .rows
                .delete(victim.id)
                .map_err(|source| PersistenceError::Eviction {
                    row_id: victim.id,
                    source,
                })?;
            if victim.get(COLUMN_LOG).is_none()
                && let Err(e) = inner.payloads.delete(group, victim.id)
            {
                tracing::warn!(group, row_id = victim.id, error = %e, "evicted row left its payload file behind");
            }
            forget_rows(&mut inner.pending, group, &[victim.id]);

            tracing::warn!(group, row_id = victim.id, "evicted oldest log to stay under capacity");
        }
        Ok(())
    }

    /// Reserve up to `max_count` of the group's oldest unreserved records.
    ///
    /// Rows whose body or token can no longer be decoded are deleted and
    /// skipped. Returns `None` when no valid rows remain.
    pub fn drain(&self, group: &str, max_count: usize) -> Result<Option<Batch>, PersistenceError> {
        if max_count == 0 {
            return Ok(None);
        }

        let mut guard = self.lock();
        let Inner {
            rows,
            payloads,
            crypto,
            pending,
        } = &mut *guard;

        let reserved: HashSet<i64> = pending
            .get(group)
            .into_iter()
            .flatten()
            .flat_map(|batch| batch.row_ids.iter().copied())
            .collect();

        let mut row_ids = Vec::new();
        let mut logs = Vec::new();
        let mut defective = Vec::new();
        let mut reencrypted = Vec::new();

        rows.scan(Some((COLUMN_GROUP, group)), Order::Ascending, |row| {
            if reserved.contains(&row.id) {
                return ControlFlow::Continue(());
            }
            match self.decode_row(payloads, crypto, group, &row) {
                Ok((log, rewrite)) => {
                    row_ids.push(row.id);
                    logs.push(log);
                    if let Some(token) = rewrite {
                        reencrypted.push((row.id, token));
                    }
                }
                Err(defect) => {
                    tracing::warn!(group, row_id = row.id, error = %defect, "dropping unreadable log");
                    defective.push((row.id, row.get(COLUMN_LOG).is_none()));
                }
            }
            if logs.len() >= max_count {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;

        for (row_id, offloaded) in defective {
            rows.delete(row_id)?;
            if offloaded && let Err(e) = payloads.delete(group, row_id) {
                tracing::warn!(group, row_id, error = %e, "failed to remove payload of dropped log");
            }
        }

        for (row_id, token) in reencrypted {
            rows.update(row_id, COLUMN_TARGET_TOKEN, Some(token.as_str()))?;
            tracing::debug!(group, row_id, "re-encrypted target token under current key");
        }

        if logs.is_empty() {
            return Ok(None);
        }

        let id = BatchId::new();
        pending
            .entry(group.to_string())
            .or_default()
            .push(PendingBatch { id, row_ids });

        tracing::debug!(group, batch = %id, count = logs.len(), "drained batch");
        Ok(Some(Batch {
            id,
            group: group.to_string(),
            logs,
        }))
    }

    /// Decode one row. On success also returns the token re-encrypted under
    /// the current key when the stored value was legacy or stale.
    fn decode_row(
        &self,
        payloads: &PayloadStore,
        crypto: &Crypto,
        group: &str,
        row: &Row,
    ) -> Result<(LogRecord, Option<String>), RowDefect> {
        let body = match row.get(COLUMN_LOG) {
            Some(body) => body.to_string(),
            None => payloads.read(group, row.id)?,
        };
        let mut log = self
            .serializer
            .deserialize(&body, row.get(COLUMN_DATA_TYPE))?;

        let mut rewrite = None;
        if let Some(stored) = row.get(COLUMN_TARGET_TOKEN) {
            let outcome = crypto.decrypt(stored)?;
            if outcome.needs_reencrypt() {
                match crypto.encrypt(outcome.plaintext()) {
                    Ok(sealed) => rewrite = Some(sealed),
                    Err(e) => {
                        tracing::warn!(row_id = row.id, error = %e, "could not re-encrypt target token");
                    }
                }
            }
            log.target_token = Some(outcome.into_plaintext());
        }

        Ok((log, rewrite))
    }

    /// Delete every row of a delivered batch. Unknown batches are ignored so
    /// acknowledgment can be retried.
    pub fn acknowledge(&self, group: &str, batch_id: &BatchId) -> Result<(), PersistenceError> {
        let mut guard = self.lock();
        let Inner {
            rows,
            payloads,
            pending,
            ..
        } = &mut *guard;

        let Some(batches) = pending.get_mut(group) else {
            tracing::debug!(group, batch = %batch_id, "acknowledged unknown batch");
            return Ok(());
        };
        let Some(index) = batches.iter().position(|b| b.id == *batch_id) else {
            tracing::debug!(group, batch = %batch_id, "acknowledged unknown batch");
            return Ok(());
        };

        // Delete before forgetting the batch so a failure leaves it pending.
        for &row_id in &batches[index].row_ids {
            rows.delete(row_id)?;
            if let Err(e) = payloads.delete(group, row_id) {
                tracing::warn!(group, row_id, error = %e, "failed to remove payload of acknowledged log");
            }
        }

        let batch = batches.remove(index);
        if batches.is_empty() {
            pending.remove(group);
        }

        tracing::debug!(group, batch = %batch_id, count = batch.row_ids.len(), "acknowledged batch");
        Ok(())
    }

    /// Forget the group's pending batches; their rows become drainable again.
    pub fn release_group(&self, group: &str) {
        if let Some(batches) = self.lock().pending.remove(group) {
            tracing::debug!(group, batches = batches.len(), "released pending batches");
        }
    }

    /// Forget every pending batch in every group.
    pub fn release_all(&self) {
        let mut guard = self.lock();
        tracing::debug!(groups = guard.pending.len(), "released all pending batches");
        guard.pending.clear();
    }

    /// Delete every row and payload file of a group and forget its batches.
    pub fn delete_group(&self, group: &str) -> Result<(), PersistenceError> {
        let mut guard = self.lock();
        let removed = guard.rows.delete_where(COLUMN_GROUP, group)?;
        guard.pending.remove(group);
        guard.payloads.delete_group(group)?;

        tracing::info!(group, removed, "deleted group");
        Ok(())
    }

    /// Rows stored for a group, including rows reserved by pending batches.
    pub fn count(&self, group: &str) -> Result<usize, PersistenceError> {
        Ok(self.lock().rows.count(Some((COLUMN_GROUP, group)))?)
    }

    /// Rows stored across all groups.
    pub fn total_count(&self) -> Result<usize, PersistenceError> {
        Ok(self.lock().rows.count(None)?)
    }

    /// Groups that currently hold at least one row.
    pub fn groups(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(self.lock().rows.distinct(COLUMN_GROUP)?)
    }

    /// Number of live batches for a group.
    pub fn pending_batches(&self, group: &str) -> usize {
        self.lock().pending.get(group).map_or(0, Vec::len)
    }

    /// Close the store, releasing all pending state.
    pub fn close(self) -> Result<(), PersistenceError> {
        let inner = self.inner.into_inner().unwrap_or_else(PoisonError::into_inner);
        inner.rows.close()?;
        Ok(())
    }
}

/// Drop row ids from a group's pending batches, discarding emptied batches.
fn forget_rows(pending: &mut HashMap<String, Vec<PendingBatch>>, group: &str, row_ids: &[i64]) {
    let Some(batches) = pending.get_mut(group) else {
        return;
    };
    for batch in batches.iter_mut() {
        batch.row_ids.retain(|id| !row_ids.contains(id));
    }
    batches.retain(|b| !b.row_ids.is_empty());
    if batches.is_empty() {
        pending.remove(group);
    }
}
