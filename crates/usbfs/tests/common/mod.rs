//! Shared fixtures: FAT-formatted RAM images and a bridge over the
//! scripted bus.
#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use fatfs::{FatType, FormatVolumeOptions};
use usbfs::{DriveManager, FsService};
use usbfs_scsi::ScsiOptions;
use usbfs_scsi::transport::mock::{MockDeviceConfig, MockTransport};

pub fn fat_image(fat_type: FatType, size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size];
    fatfs::format_volume(
        &mut Cursor::new(&mut data),
        FormatVolumeOptions::new().fat_type(fat_type),
    )
    .expect("formatting RAM image");
    data
}

pub fn fat_image_clustered(fat_type: FatType, size: usize, bytes_per_cluster: u32) -> Vec<u8> {
    let mut data = vec![0u8; size];
    fatfs::format_volume(
        &mut Cursor::new(&mut data),
        FormatVolumeOptions::new()
            .fat_type(fat_type)
            .bytes_per_cluster(bytes_per_cluster),
    )
    .expect("formatting RAM image");
    data
}

pub fn fat16_device() -> MockDeviceConfig {
    MockDeviceConfig::single_lun(fat_image(FatType::Fat16, 4 << 20))
}

pub fn fat12_device() -> MockDeviceConfig {
    MockDeviceConfig::single_lun(fat_image(FatType::Fat12, 256 << 10))
}

pub fn fast_scsi() -> ScsiOptions {
    ScsiOptions {
        ready_attempts: 16,
        ready_backoff: Duration::from_millis(1),
    }
}

pub fn bridge() -> (MockTransport, Arc<DriveManager>, FsService) {
    let transport = MockTransport::new();
    let manager = DriveManager::new(Arc::new(transport.clone()), fast_scsi());
    let service = FsService::new(manager.clone());
    (transport, manager, service)
}

/// List drives through the service and return the reported ids.
pub fn list_ids(service: &FsService) -> Vec<i32> {
    let mut out = [0i32; usbfs::MAX_DRIVES + 4];
    let count = service.list_mounted_drives(&mut out) as usize;
    out[..count].to_vec()
}
