//! The `fsp-usb` service surface.
//!
//! Five wire methods, dispatched by [`CommandId`]. Every method forces a
//! reconcile pass first so clients observe fresh plug state, then
//! validates the interface id before touching the drive.

use std::sync::Arc;

use usbfs_fat::MAX_LABEL_LEN;
use usbfs_scsi::transport::InterfaceId;

use crate::error::{Result, ServiceError};
use crate::fs::filesystem::DriveFileSystem;
use crate::manager::DriveManager;

/// Registered service name.
pub const SERVICE_NAME: &str = "fsp-usb";

/// Sizing contract for the hosting RPC server; mirrors the main
/// filesystem service so clients can treat both alike.
pub struct ServerOptions;

impl ServerOptions {
    pub const MAX_SESSIONS: usize = 61;
    pub const POINTER_BUFFER_SIZE: usize = 0x800;
    pub const MAX_OBJECTS: usize = 0x4000;
}

/// Wire command ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandId {
    ListMountedDrives = 0,
    GetDriveFileSystemType = 1,
    GetDriveLabel = 2,
    SetDriveLabel = 3,
    OpenDriveFileSystem = 4,
}

/// The service object the dispatcher routes client calls to.
pub struct FsService {
    manager: Arc<DriveManager>,
}

impl FsService {
    pub fn new(manager: Arc<DriveManager>) -> Self {
        Self { manager }
    }

    fn ensure_valid(&self, id: InterfaceId) -> Result<()> {
        if self.manager.is_drive_valid(id) {
            Ok(())
        } else {
            Err(ServiceError::InvalidDriveInterfaceId)
        }
    }

    /// Copy up to `out_ids.len()` mounted-drive interface ids, in
    /// acquisition order. Returns the number copied.
    pub fn list_mounted_drives(&self, out_ids: &mut [i32]) -> i32 {
        log::debug!("ListMountedDrives: forcing a drive list update");
        self.manager.poll();

        let ids = self.manager.interface_ids();
        let count = ids.len().min(out_ids.len());
        for (out, id) in out_ids.iter_mut().zip(ids.iter().take(count)) {
            *out = id.0;
        }

        log::debug!(
            "ListMountedDrives: {} drive(s), reporting {count}",
            ids.len()
        );
        count as i32
    }

    /// Filesystem type byte of a mounted drive (FAT12/16/32/exFAT).
    pub fn get_drive_fs_type(&self, id: i32) -> Result<u8> {
        let id = InterfaceId(id);
        log::debug!("GetDriveFileSystemType (interface {id})");
        self.manager.poll();
        self.ensure_valid(id)?;

        self.manager.with_volume(id, |volume| Ok(volume.fs_type().as_u8()))
    }

    /// Current volume label of a mounted drive.
    pub fn get_drive_label(&self, id: i32) -> Result<String> {
        let id = InterfaceId(id);
        log::debug!("GetDriveLabel (interface {id})");
        self.manager.poll();
        self.ensure_valid(id)?;

        self.manager.with_volume(id, |volume| volume.label())
    }

    /// Set or clear a drive's volume label. Labels are truncated to the
    /// FAT maximum of 11 characters; an empty string clears the label.
    pub fn set_drive_label(&self, id: i32, label: &str) -> Result<()> {
        let id = InterfaceId(id);
        log::debug!("SetDriveLabel (interface {id}): {label:?}");
        self.manager.poll();
        self.ensure_valid(id)?;

        let mount_name = self
            .manager
            .mount_name_of(id)
            .ok_or(ServiceError::DriveUnavailable)?;

        let truncated: String = label.chars().take(MAX_LABEL_LEN).collect();
        let spec = format!("{mount_name}{truncated}");
        self.manager.with_volume(id, |volume| volume.set_label(&spec))
    }

    /// Open a filesystem object bound to one drive. Its operations check
    /// drive validity per call and fail with
    /// [`DriveUnavailable`](ServiceError::DriveUnavailable) once the
    /// device is gone.
    pub fn open_drive_filesystem(&self, id: i32) -> Result<DriveFileSystem> {
        let id = InterfaceId(id);
        log::debug!("OpenDriveFileSystem (interface {id})");
        self.manager.poll();
        self.ensure_valid(id)?;

        let mount_name = self
            .manager
            .mount_name_of(id)
            .ok_or(ServiceError::DriveUnavailable)?;

        Ok(DriveFileSystem::new(self.manager.clone(), id, mount_name))
    }

    /// Vendor/product identity of a drive, for operator tooling.
    pub fn drive_identity(&self, id: i32) -> Result<Option<(String, String)>> {
        let id = InterfaceId(id);
        self.manager.poll();
        self.ensure_valid(id)?;

        let scsi = self
            .manager
            .scsi_of(id)
            .ok_or(ServiceError::DriveUnavailable)?;
        let scsi = scsi.lock().unwrap();
        Ok(scsi
            .identity()
            .map(|identity| (identity.vendor(), identity.product())))
    }
}
