//! Namespace operations on one drive's volume.

use std::sync::Arc;

use usbfs_fat::EntryKind;
use usbfs_scsi::transport::InterfaceId;

use crate::error::{Result, ServiceError};
use crate::fs::directory::DriveDirectory;
use crate::fs::file::DriveFile;
use crate::fs::{FileTimestamp, OpenMode};
use crate::manager::DriveManager;

/// Server-owned filesystem object for a single drive.
///
/// Paths are volume-absolute (`"/dir/file"`); the adapter prepends the
/// drive's mount name before handing them to the FAT layer.
pub struct DriveFileSystem {
    manager: Arc<DriveManager>,
    iface_id: InterfaceId,
    mount_name: String,
}

impl DriveFileSystem {
    pub(crate) fn new(
        manager: Arc<DriveManager>,
        iface_id: InterfaceId,
        mount_name: String,
    ) -> Self {
        Self {
            manager,
            iface_id,
            mount_name,
        }
    }

    pub fn interface_id(&self) -> InterfaceId {
        self.iface_id
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.manager.is_drive_valid(self.iface_id) {
            Ok(())
        } else {
            Err(ServiceError::DriveUnavailable)
        }
    }

    fn full_path(&self, path: &str) -> String {
        format!("{}{}", self.mount_name, path)
    }

    fn join_child(parent: &str, name: &str) -> String {
        if parent.ends_with(['/', ':']) {
            format!("{parent}{name}")
        } else {
            format!("{parent}/{name}")
        }
    }

    /// Create a file of `size` zero-filled bytes.
    pub fn create_file(&self, path: &str, size: u64) -> Result<()> {
        self.ensure_valid()?;
        let full = self.full_path(path);
        self.manager
            .with_volume(self.iface_id, |v| v.create_file(&full, size))
    }

    pub fn delete_file(&self, path: &str) -> Result<()> {
        self.ensure_valid()?;
        let full = self.full_path(path);
        self.manager
            .with_volume(self.iface_id, |v| v.remove_file(&full))
    }

    pub fn create_directory(&self, path: &str) -> Result<()> {
        self.ensure_valid()?;
        let full = self.full_path(path);
        self.manager
            .with_volume(self.iface_id, |v| v.create_dir(&full))
    }

    /// Delete an empty directory.
    pub fn delete_directory(&self, path: &str) -> Result<()> {
        self.ensure_valid()?;
        let full = self.full_path(path);
        self.manager
            .with_volume(self.iface_id, |v| v.remove_dir(&full))
    }

    /// Delete a directory and everything below it. The FAT primitive is
    /// not recursive, so the walk happens here, depth first.
    pub fn delete_directory_recursively(&self, path: &str) -> Result<()> {
        self.ensure_valid()?;
        let full = self.full_path(path);
        self.delete_recursively(&full, true)
    }

    /// Delete a directory's contents but keep the directory itself.
    pub fn clean_directory_recursively(&self, path: &str) -> Result<()> {
        self.ensure_valid()?;
        let full = self.full_path(path);
        self.delete_recursively(&full, false)
    }

    fn delete_recursively(&self, full: &str, delete_parent: bool) -> Result<()> {
        let entries = self
            .manager
            .with_volume(self.iface_id, |v| v.read_dir(full))?;

        for entry in entries {
            let child = Self::join_child(full, &entry.name);
            match entry.kind {
                EntryKind::Directory => self.delete_recursively(&child, true)?,
                EntryKind::File => self
                    .manager
                    .with_volume(self.iface_id, |v| v.remove_file(&child))?,
            }
        }

        if delete_parent {
            self.manager
                .with_volume(self.iface_id, |v| v.remove_dir(full))?;
        }
        Ok(())
    }

    pub fn rename_file(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.ensure_valid()?;
        let old_full = self.full_path(old_path);
        let new_full = self.full_path(new_path);
        self.manager
            .with_volume(self.iface_id, |v| v.rename(&old_full, &new_full))
    }

    /// Same primitive as [`rename_file`](Self::rename_file); the FAT
    /// rename does not distinguish entry kinds.
    pub fn rename_directory(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.rename_file(old_path, new_path)
    }

    pub fn get_entry_type(&self, path: &str) -> Result<EntryKind> {
        self.ensure_valid()?;
        let full = self.full_path(path);
        self.manager
            .with_volume(self.iface_id, |v| v.stat(&full))
            .map(|meta| meta.kind)
    }

    /// Open a file for explicit-offset I/O. The file must exist.
    pub fn open_file(&self, path: &str, mode: OpenMode) -> Result<DriveFile> {
        self.ensure_valid()?;
        let full = self.full_path(path);

        let meta = self
            .manager
            .with_volume(self.iface_id, |v| v.stat(&full))?;
        if meta.kind != EntryKind::File {
            return Err(ServiceError::PathNotFound);
        }

        Ok(DriveFile::new(
            self.manager.clone(),
            self.iface_id,
            full,
            mode,
        ))
    }

    pub fn open_directory(&self, path: &str) -> Result<DriveDirectory> {
        self.ensure_valid()?;
        let full = self.full_path(path);

        let meta = self
            .manager
            .with_volume(self.iface_id, |v| v.stat(&full))?;
        if meta.kind != EntryKind::Directory {
            return Err(ServiceError::PathNotFound);
        }

        Ok(DriveDirectory::new(self.manager.clone(), self.iface_id, full))
    }

    /// Writes go straight to the device; commit only revalidates the
    /// drive.
    pub fn commit(&self) -> Result<()> {
        self.ensure_valid()
    }

    pub fn get_free_space(&self) -> Result<u64> {
        self.ensure_valid()?;
        self.manager.with_volume(self.iface_id, |v| v.free_space())
    }

    pub fn get_total_space(&self) -> Result<u64> {
        self.ensure_valid()?;
        self.manager.with_volume(self.iface_id, |v| v.total_space())
    }

    pub fn get_file_timestamp(&self, path: &str) -> Result<FileTimestamp> {
        self.ensure_valid()?;
        let full = self.full_path(path);

        let meta = self
            .manager
            .with_volume(self.iface_id, |v| v.stat(&full))?;

        Ok(FileTimestamp {
            created: 0,
            modified: meta.modified_unix,
            accessed: 0,
            is_valid: true,
        })
    }

    /// Extended entry queries are not part of this filesystem.
    pub fn query_entry(&self, _path: &str, _query_id: u32) -> Result<()> {
        self.ensure_valid()?;
        Err(ServiceError::NotImplemented)
    }
}
