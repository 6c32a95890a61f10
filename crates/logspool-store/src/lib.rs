// ABOUTME: Persistence layer for logspool: SQLite row store, large payload files, and token encryption.
// ABOUTME: The persistence module ties them into a capacity-bounded, group-partitioned batch queue.

pub mod config;
pub mod crypto;
pub mod payload;
pub mod persistence;
pub mod rows;

pub use config::{ConfigError, StoreConfig};
pub use crypto::{Crypto, CryptoError, DecryptOutcome};
pub use payload::{PayloadError, PayloadStore, StagedPayload};
pub use persistence::{Batch, BatchId, LOGS_TABLE, Persistence, PersistenceError};
pub use rows::{ColumnDef, Order, Row, RowStore, RowStoreError, TableSpec};
