//! Persisted channel records.
//!
//! A [`PersistedChannel`] holds everything needed to resume a channel after
//! a restart: who the counterparty is, where it was last seen, and the state
//! machine snapshot. Records are CBOR-encoded and keyed by channel id.

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::Path,
    sync::Mutex,
};

use bitcoin::Network;
use mooring_proto::{ChannelId, NodeId};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PossibleBug;

/// Table of CBOR records keyed by the 32 channel id bytes.
const CHANNELS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("channels");

/// Durable metadata of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedChannel {
    /// Channel id, also the storage key
    pub channel_id: ChannelId,
    /// Stable index within the owning account
    pub channel_index: u32,
    /// Chain the channel lives on
    pub network: Network,
    /// Counterparty
    pub remote_node_id: NodeId,
    /// Opaque state machine snapshot
    pub state_snapshot: Vec<u8>,
    /// Identity of the owning account file
    pub account_file: String,
    /// Counterparty's last known address
    pub remote_endpoint: SocketAddr,
    /// Confirmations required before funding is considered safe
    pub min_safe_depth: u32,
}

impl PersistedChannel {
    /// CBOR encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| StoreError::Corrupt(format!("encode {}: {e}", self.channel_id)))?;
        Ok(buf)
    }

    /// Decode a record written by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        ciborium::de::from_reader(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}

/// Storage for channel records.
pub trait ChannelStore: Send + Sync {
    /// Record for `channel_id`.
    fn load(&self, channel_id: &ChannelId) -> Result<PersistedChannel, StoreError>;

    /// Insert or replace the record for `channel.channel_id`.
    fn save(&self, channel: &PersistedChannel) -> Result<(), StoreError>;

    /// Ids of every stored channel, in ascending order.
    fn list(&self) -> Result<Vec<ChannelId>, StoreError>;
}

/// Failure to load, save, or restore a channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No record for this channel
    #[error("channel {0} not found")]
    NotFound(ChannelId),

    /// Record exists but cannot be decoded or encoded
    #[error("corrupt channel record: {0}")]
    Corrupt(String),

    /// Storage backend failed
    #[error("storage backend failed: {0}")]
    Backend(String),

    /// Restored machine reports a different channel id than it was loaded by
    #[error("restored channel reports id {actual:?}, expected {expected}")]
    ChannelIdMismatch {
        /// Id the record was looked up by
        expected: ChannelId,
        /// Id the restored machine reports
        actual: Option<ChannelId>,
    },

    /// State machine rejected the snapshot
    #[error("failed to restore channel {channel_id}: {reason}")]
    Restore {
        /// Channel being restored
        channel_id: ChannelId,
        /// Error from the state machine
        reason: String,
    },

    /// State machine could not produce a snapshot
    #[error("failed to snapshot channel {channel_id}: {reason}")]
    Snapshot {
        /// Channel being saved
        channel_id: ChannelId,
        /// Error from the state machine
        reason: String,
    },
}

impl PossibleBug for StoreError {
    fn possible_bug(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::Backend(_) => false,
            Self::Corrupt(_)
            | Self::ChannelIdMismatch { .. }
            | Self::Restore { .. }
            | Self::Snapshot { .. } => true,
        }
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryChannelStore {
    records: Mutex<HashMap<ChannelId, Vec<u8>>>,
}

impl MemoryChannelStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelStore for MemoryChannelStore {
    fn load(&self, channel_id: &ChannelId) -> Result<PersistedChannel, StoreError> {
        let records = self.records.lock().map_err(|_| poisoned())?;
        let bytes = records.get(channel_id).ok_or(StoreError::NotFound(*channel_id))?;
        PersistedChannel::from_bytes(bytes)
    }

    fn save(&self, channel: &PersistedChannel) -> Result<(), StoreError> {
        let bytes = channel.to_bytes()?;
        self.records.lock().map_err(|_| poisoned())?.insert(channel.channel_id, bytes);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ChannelId>, StoreError> {
        let mut ids: Vec<_> = self.records.lock().map_err(|_| poisoned())?.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("store lock poisoned".to_string())
}

/// Store backed by a redb database file.
pub struct RedbChannelStore {
    db: Database,
}

impl std::fmt::Debug for RedbChannelStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbChannelStore").finish_non_exhaustive()
    }
}

impl RedbChannelStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(backend)?;

        let txn = db.begin_write().map_err(backend)?;
        txn.open_table(CHANNELS).map_err(backend)?;
        txn.commit().map_err(backend)?;

        Ok(Self { db })
    }
}

impl ChannelStore for RedbChannelStore {
    fn load(&self, channel_id: &ChannelId) -> Result<PersistedChannel, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(CHANNELS).map_err(backend)?;
        let record = table
            .get(channel_id.as_bytes().as_slice())
            .map_err(backend)?
            .ok_or(StoreError::NotFound(*channel_id))?;
        PersistedChannel::from_bytes(record.value())
    }

    fn save(&self, channel: &PersistedChannel) -> Result<(), StoreError> {
        let bytes = channel.to_bytes()?;

        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = txn.open_table(CHANNELS).map_err(backend)?;
            table.insert(channel.channel_id.as_bytes().as_slice(), bytes.as_slice()).map_err(backend)?;
        }
        txn.commit().map_err(backend)?;

        tracing::debug!(channel_id = %channel.channel_id, "saved channel");
        Ok(())
    }

    fn list(&self) -> Result<Vec<ChannelId>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(CHANNELS).map_err(backend)?;

        let mut ids = Vec::new();
        for entry in table.iter().map_err(backend)? {
            let (key, _) = entry.map_err(backend)?;
            let id = ChannelId::from_slice(key.value())
                .ok_or_else(|| StoreError::Corrupt(format!("bad key length {}", key.value().len())))?;
            ids.push(id);
        }
        Ok(ids)
    }
}

fn backend<E: Into<redb::Error>>(err: E) -> StoreError {
    StoreError::Backend(err.into().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryChannelStore::new();
        let record = fixtures::persisted(fixtures::CHANNEL);

        store.save(&record).unwrap();
        assert_eq!(store.load(&fixtures::CHANNEL).unwrap(), record);
        assert_eq!(store.list().unwrap(), vec![fixtures::CHANNEL]);
    }

    #[test]
    fn missing_channel_is_not_found() {
        let store = MemoryChannelStore::new();
        let err = store.load(&fixtures::CHANNEL).unwrap_err();

        assert_eq!(err, StoreError::NotFound(fixtures::CHANNEL));
        assert!(!err.possible_bug());
    }

    #[test]
    fn redb_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.redb");
        let record = fixtures::persisted(fixtures::CHANNEL);

        {
            let store = RedbChannelStore::open(&path).unwrap();
            store.save(&record).unwrap();
        }

        let store = RedbChannelStore::open(&path).unwrap();
        assert_eq!(store.load(&fixtures::CHANNEL).unwrap(), record);
        assert_eq!(store.list().unwrap(), vec![fixtures::CHANNEL]);
    }

    #[test]
    fn save_replaces_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbChannelStore::open(dir.path().join("channels.redb")).unwrap();
        let mut record = fixtures::persisted(fixtures::CHANNEL);

        store.save(&record).unwrap();
        record.min_safe_depth = 6;
        store.save(&record).unwrap();

        assert_eq!(store.load(&fixtures::CHANNEL).unwrap().min_safe_depth, 6);
    }

    #[test]
    fn garbage_record_is_corrupt() {
        let err = PersistedChannel::from_bytes(&[0xff, 0x00]).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
        assert!(err.possible_bug());
    }
}
