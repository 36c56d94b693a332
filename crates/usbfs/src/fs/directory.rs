//! Entry streaming over one directory of a drive's volume.

use std::sync::{Arc, Mutex};

use usbfs_fat::EntryInfo;
use usbfs_scsi::transport::InterfaceId;

use crate::error::{Result, ServiceError};
use crate::manager::DriveManager;

/// Server-owned directory object with a read cursor.
pub struct DriveDirectory {
    manager: Arc<DriveManager>,
    iface_id: InterfaceId,
    /// Mount-prefixed path.
    path: String,
    cursor: Mutex<usize>,
}

impl DriveDirectory {
    pub(crate) fn new(manager: Arc<DriveManager>, iface_id: InterfaceId, path: String) -> Self {
        Self {
            manager,
            iface_id,
            path,
            cursor: Mutex::new(0),
        }
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.manager.is_drive_valid(self.iface_id) {
            Ok(())
        } else {
            Err(ServiceError::DriveUnavailable)
        }
    }

    /// Read up to `max_entries` directory entries, advancing the cursor.
    /// An empty result means the stream is exhausted.
    pub fn read_entries(&self, max_entries: usize) -> Result<Vec<EntryInfo>> {
        self.ensure_valid()?;

        let entries = self
            .manager
            .with_volume(self.iface_id, |v| v.read_dir(&self.path))?;

        let mut cursor = self.cursor.lock().unwrap();
        let start = (*cursor).min(entries.len());
        let end = start.saturating_add(max_entries).min(entries.len());
        *cursor = end;

        Ok(entries[start..end].to_vec())
    }

    /// Number of entries left in the stream. Counting consumes the
    /// stream, like reading the underlying directory to its end.
    pub fn entry_count(&self) -> Result<u64> {
        self.ensure_valid()?;

        let entries = self
            .manager
            .with_volume(self.iface_id, |v| v.read_dir(&self.path))?;

        let mut cursor = self.cursor.lock().unwrap();
        let remaining = entries.len().saturating_sub(*cursor);
        *cursor = entries.len();

        Ok(remaining as u64)
    }
}
