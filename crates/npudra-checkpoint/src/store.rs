//! CheckpointStore: redb-backed checkpoint persistence.
//!
//! Stores named checkpoints as checksummed JSON envelopes. Writes are
//! create-or-overwrite and commit in a single redb write transaction, so a
//! reader sees either the previous or the new checkpoint, never a mix. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{CheckpointError, CheckpointResult};
use crate::tables::CHECKPOINTS;
use crate::types::Checkpoint;

/// Convert any `Display` error into a `CheckpointError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| CheckpointError::$variant(e.to_string())
    };
}

/// Durable checkpoint persistence as consumed by the device-state controller.
pub trait CheckpointManager: Send + Sync {
    /// Load a checkpoint. Missing keys are [`CheckpointError::NotFound`].
    fn get_checkpoint(&self, key: &str) -> CheckpointResult<Checkpoint>;

    /// Create or overwrite a checkpoint.
    fn create_checkpoint(&self, key: &str, checkpoint: &Checkpoint) -> CheckpointResult<()>;

    /// Names of all stored checkpoints.
    fn list_checkpoints(&self) -> CheckpointResult<Vec<String>>;
}

/// Thread-safe checkpoint store backed by redb.
#[derive(Clone)]
pub struct CheckpointStore {
    db: Arc<Database>,
}

impl CheckpointStore {
    /// Open (or create) a persistent checkpoint store at the given path.
    pub fn open(path: &Path) -> CheckpointResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "checkpoint store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory checkpoint store (for testing).
    pub fn open_in_memory() -> CheckpointResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory checkpoint store opened");
        Ok(store)
    }

    /// Create the checkpoint table if it doesn't exist yet.
    fn ensure_tables(&self) -> CheckpointResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

impl CheckpointManager for CheckpointStore {
    fn get_checkpoint(&self, key: &str) -> CheckpointResult<Checkpoint> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Checkpoint::unmarshal(key, guard.value()),
            None => Err(CheckpointError::NotFound(key.to_string())),
        }
    }

    fn create_checkpoint(&self, key: &str, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        let value = checkpoint.marshal()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            %key,
            claims = checkpoint.prepared_claims().len(),
            "checkpoint stored"
        );
        Ok(())
    }

    fn list_checkpoints(&self) -> CheckpointResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }
}
