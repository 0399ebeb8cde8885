use async_trait::async_trait;
use conclave_core::store::{CoordinationStore, PersistedCoordinationState};
use conclave_core::{ClusterState, ConclaveError, Result, Term};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// File-backed coordination store.
///
/// The record is kept in a single file, rewritten on every mutation through
/// a temporary file, fsync, and atomic rename, so a crash mid-write leaves
/// either the old record or the new one. A crc32 trailer detects torn or
/// corrupted files at load time; a corrupt file is an error, not an empty
/// store, because silently restarting from scratch could let the node grant
/// a second vote for a term it already voted in.
#[derive(Clone, Debug)]
pub struct FileStore {
    state_file_path: PathBuf,
    cached: Arc<RwLock<Option<PersistedCoordinationState>>>,
}

impl FileStore {
    /// Open a store rooted at `data_dir`, creating the directory if needed
    /// and loading any existing record.
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            fs::create_dir_all(data_dir).await.map_err(|e| {
                ConclaveError::durability(format!("failed to create data directory: {}", e))
            })?;
        }

        let store = Self {
            state_file_path: data_dir.join("coordination.dat"),
            cached: Arc::new(RwLock::new(None)),
        };
        let record = store.read_record().await?;
        *store.cached.write() = record;
        Ok(store)
    }

    async fn read_record(&self) -> Result<Option<PersistedCoordinationState>> {
        let data = match fs::read(&self.state_file_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConclaveError::durability(format!(
                    "failed to read coordination file: {}",
                    e
                )))
            }
        };

        if data.len() < 4 {
            return Err(ConclaveError::durability(
                "coordination file too short for its checksum",
            ));
        }
        let (payload, trailer) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = crc32fast::hash(payload);
        if stored != computed {
            return Err(ConclaveError::durability(format!(
                "coordination file checksum mismatch: stored {:08x}, computed {:08x}",
                stored, computed
            )));
        }

        PersistedCoordinationState::from_bytes(payload).map(Some)
    }

    async fn write_record(&self, record: &PersistedCoordinationState) -> Result<()> {
        let mut data = record.to_bytes()?;
        let checksum = crc32fast::hash(&data);
        data.extend_from_slice(&checksum.to_le_bytes());

        let temp_path = self.state_file_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            ConclaveError::durability(format!("failed to create temp file: {}", e))
        })?;
        file.write_all(&data).await.map_err(|e| {
            ConclaveError::durability(format!("failed to write coordination record: {}", e))
        })?;
        // the record must be on stable storage before the rename makes it
        // the current one
        file.sync_all().await.map_err(|e| {
            ConclaveError::durability(format!("failed to sync coordination record: {}", e))
        })?;
        drop(file);

        fs::rename(&temp_path, &self.state_file_path)
            .await
            .map_err(|e| {
                ConclaveError::durability(format!("failed to install coordination record: {}", e))
            })?;

        debug!(
            "persisted coordination record at term {}",
            record.current_term
        );
        Ok(())
    }

    fn cached_or_default(&self) -> PersistedCoordinationState {
        self.cached.read().clone().unwrap_or_default()
    }
}

#[async_trait]
impl CoordinationStore for FileStore {
    async fn load(&self) -> Result<Option<PersistedCoordinationState>> {
        Ok(self.cached.read().clone())
    }

    async fn store_term(&self, term: Term) -> Result<()> {
        let mut record = self.cached_or_default();
        record.current_term = term;
        self.write_record(&record).await?;
        *self.cached.write() = Some(record);
        Ok(())
    }

    async fn store_accepted_state(&self, state: &ClusterState) -> Result<()> {
        let mut record = self.cached_or_default();
        record.last_accepted = Some(state.clone());
        self.write_record(&record).await?;
        *self.cached.write() = Some(record);
        Ok(())
    }
}
