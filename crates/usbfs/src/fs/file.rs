//! Byte I/O on one file of a drive's volume.

use std::sync::Arc;

use usbfs_fat::FatError;
use usbfs_scsi::transport::InterfaceId;

use crate::error::{Result, ServiceError};
use crate::fs::OpenMode;
use crate::manager::DriveManager;

/// Server-owned file object.
///
/// All I/O takes explicit offsets, so the object itself carries no
/// cursor; each operation resolves the path under the drive's filesystem
/// lock. Mode flags are enforced here the way the FAT layer would: an
/// access outside the open mode is denied with the FAT status a
/// read-protected handle produces.
pub struct DriveFile {
    manager: Arc<DriveManager>,
    iface_id: InterfaceId,
    /// Mount-prefixed path.
    path: String,
    mode: OpenMode,
}

impl DriveFile {
    pub(crate) fn new(
        manager: Arc<DriveManager>,
        iface_id: InterfaceId,
        path: String,
        mode: OpenMode,
    ) -> Self {
        Self {
            manager,
            iface_id,
            path,
            mode,
        }
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.manager.is_drive_valid(self.iface_id) {
            Ok(())
        } else {
            Err(ServiceError::DriveUnavailable)
        }
    }

    /// Read up to `buf.len()` bytes at `offset`. Short reads at end of
    /// file are not an error.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_valid()?;
        if !self.mode.contains(OpenMode::READ) {
            return Err(FatError::Denied.into());
        }
        self.manager
            .with_volume(self.iface_id, |v| v.read_at(&self.path, offset, buf))
    }

    /// Write `data` at `offset`; in append mode the offset is ignored and
    /// the write lands at end of file.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.ensure_valid()?;
        if !self.mode.contains(OpenMode::WRITE) && !self.mode.contains(OpenMode::APPEND) {
            return Err(FatError::Denied.into());
        }
        let append = self.mode.contains(OpenMode::APPEND);
        self.manager
            .with_volume(self.iface_id, |v| v.write_at(&self.path, offset, data, append))
    }

    pub fn get_size(&self) -> Result<u64> {
        self.ensure_valid()?;
        self.manager
            .with_volume(self.iface_id, |v| v.stat(&self.path))
            .map(|meta| meta.size)
    }

    /// Resize the file: truncates on shrink, zero-extends on growth.
    pub fn set_size(&self, size: u64) -> Result<()> {
        self.ensure_valid()?;
        if !self.mode.contains(OpenMode::WRITE) && !self.mode.contains(OpenMode::APPEND) {
            return Err(FatError::Denied.into());
        }
        self.manager
            .with_volume(self.iface_id, |v| v.set_len(&self.path, size))
    }

    /// Data is written through on every call; flush only revalidates the
    /// drive.
    pub fn flush(&self) -> Result<()> {
        self.ensure_valid()
    }

    /// Range operations are not part of this filesystem.
    pub fn operate_range(&self, _operation_id: u32, _offset: u64, _size: u64) -> Result<()> {
        Err(ServiceError::NotImplemented)
    }
}
