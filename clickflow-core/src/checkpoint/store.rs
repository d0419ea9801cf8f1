//! Where committed checkpoints live. Each pipeline instance keeps only its latest checkpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::checkpoint::Checkpoint;
use crate::{Error, Result};

#[trait_variant::make(CheckpointStore: Send)]
pub trait LocalCheckpointStore: Sync {
    /// The most recent committed checkpoint, `None` before the first commit.
    async fn load_latest(&self) -> Result<Option<Checkpoint>>;

    /// Replaces the stored checkpoint. Either the old or the new one survives a crash.
    async fn commit(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// One JSON file per instance, `<dir>/instance-<n>.json`, replaced atomically by rename.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl FileCheckpointStore {
    pub async fn new(dir: &Path, instance: u16) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            Error::Checkpoint(format!("creating checkpoint dir {}: {e}", dir.display()))
        })?;
        Ok(Self {
            path: dir.join(format!("instance-{instance}.json")),
            tmp_path: dir.join(format!(".instance-{instance}.json.tmp")),
        })
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn load_latest(&self) -> Result<Option<Checkpoint>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Checkpoint(format!("corrupt checkpoint {}: {e}", self.path.display()))
        })?;
        info!(
            checkpoint = checkpoint.checkpoint_id,
            offsets = ?checkpoint.offsets,
            "Loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }

    async fn commit(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| Error::Checkpoint(format!("encoding checkpoint: {e}")))?;
        let mut file = tokio::fs::File::create(&self.tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&self.tmp_path, &self.path).await?;
        debug!(checkpoint = checkpoint.checkpoint_id, path = %self.path.display(), "Stored checkpoint");
        Ok(())
    }
}

/// Keeps the checkpoint in memory. Survives pipeline restarts, not process restarts.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    latest: Arc<Mutex<Option<Checkpoint>>>,
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn load_latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.latest.lock().clone())
    }

    async fn commit(&self, checkpoint: &Checkpoint) -> Result<()> {
        *self.latest.lock() = Some(checkpoint.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum CheckpointStoreType {
    File(FileCheckpointStore),
    Memory(MemoryCheckpointStore),
}

impl CheckpointStoreType {
    /// File backed when a directory is configured, in memory otherwise.
    pub async fn new(dir: Option<&Path>, instance: u16) -> Result<Self> {
        match dir {
            Some(dir) => Ok(CheckpointStoreType::File(
                FileCheckpointStore::new(dir, instance).await?,
            )),
            None => Ok(CheckpointStoreType::Memory(MemoryCheckpointStore::default())),
        }
    }
}

impl CheckpointStore for CheckpointStoreType {
    async fn load_latest(&self) -> Result<Option<Checkpoint>> {
        match self {
            CheckpointStoreType::File(store) => CheckpointStore::load_latest(store).await,
            CheckpointStoreType::Memory(store) => CheckpointStore::load_latest(store).await,
        }
    }

    async fn commit(&self, checkpoint: &Checkpoint) -> Result<()> {
        match self {
            CheckpointStoreType::File(store) => CheckpointStore::commit(store, checkpoint).await,
            CheckpointStoreType::Memory(store) => CheckpointStore::commit(store, checkpoint).await,
        }
    }
}
