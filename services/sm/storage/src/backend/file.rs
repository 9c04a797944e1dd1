//! File-based storage backend with checksummed, atomically replaced snapshots

use crate::{Snapshot, SnapshotStore, StorageError};
use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Configuration for the file store
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Snapshot file path
    pub path: PathBuf,
    /// Fsync the temp file before renaming it over the snapshot
    pub fsync: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./smdata/stream.snapshot"),
            fsync: true,
        }
    }
}

/// Snapshot record header
#[derive(Debug)]
struct RecordHeader {
    crc32: u32, // CRC32 over the JSON body
}

impl RecordHeader {
    const SIZE: usize = 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.crc32);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, StorageError> {
        if buf.remaining() < Self::SIZE {
            return Err(StorageError::Corruption(
                "Incomplete snapshot header".to_string(),
            ));
        }

        Ok(Self {
            crc32: buf.get_u32_le(),
        })
    }

    fn compute_crc(body: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(body);
        hasher.finalize()
    }
}

/// Snapshot kept in a single file.
///
/// Layout is a little-endian CRC32 followed by the JSON-encoded snapshot. Saves
/// go to a sibling `.tmp` file that is renamed over the previous snapshot, so a
/// crash mid-save leaves the old snapshot intact.
#[derive(Clone, Debug)]
pub struct FileStore {
    config: FileStoreConfig,
}

impl FileStore {
    /// Create a file store, making sure the parent directory exists
    pub fn new(config: FileStoreConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        info!("Snapshot file store at {:?}", config.path);
        Ok(Self { config })
    }

    /// Path of the snapshot file
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .config
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.config.path.with_file_name(name)
    }

    /// Write `record` to `tmp`, then rename it over the snapshot
    fn replace_with(&self, tmp: &Path, record: &[u8]) -> std::io::Result<()> {
        let mut file = File::create(tmp)?;
        file.write_all(record)?;
        if self.config.fsync {
            file.sync_all()?;
        }
        drop(file);
        fs::rename(tmp, &self.config.path)
    }
}

impl SnapshotStore for FileStore {
    fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let body = serde_json::to_vec(snapshot)?;

        let mut record = BytesMut::with_capacity(RecordHeader::SIZE + body.len());
        RecordHeader {
            crc32: RecordHeader::compute_crc(&body),
        }
        .encode(&mut record);
        record.extend_from_slice(&body);

        let tmp = self.tmp_path();
        if let Err(e) = self.replace_with(&tmp, &record) {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove {:?}: {}", tmp, cleanup);
                }
            }
            return Err(e.into());
        }

        debug!(
            "Saved snapshot to {:?}: {} bytes, {} queued",
            self.config.path,
            record.len(),
            snapshot.queue.len()
        );
        Ok(())
    }

    fn restore(&self) -> Result<Option<Snapshot>, StorageError> {
        let content = match fs::read(&self.config.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No snapshot at {:?}", self.config.path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut buf = content.as_slice();
        let header = RecordHeader::decode(&mut buf)?;
        let actual = RecordHeader::compute_crc(buf);
        if actual != header.crc32 {
            warn!(
                "Snapshot checksum mismatch in {:?}: stored={:08x} actual={:08x}",
                self.config.path, header.crc32, actual
            );
            return Err(StorageError::Corruption(format!(
                "checksum mismatch in {:?}",
                self.config.path
            )));
        }

        let snapshot: Snapshot = serde_json::from_slice(buf).map_err(|e| {
            StorageError::Corruption(format!("Invalid snapshot {:?}: {}", self.config.path, e))
        })?;
        debug!(
            "Restored snapshot from {:?}: owner={} queued={}",
            self.config.path,
            snapshot.owner,
            snapshot.queue.len()
        );
        Ok(Some(snapshot))
    }

    fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.config.path) {
            Ok(()) => {
                info!("Cleared snapshot {:?}", self.config.path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
