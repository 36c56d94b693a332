//! End-to-end scenarios over the full stack: service → manager → drive →
//! FAT → SCSI → bulk-only transport → scripted bus.

mod common;

use std::time::{Duration, Instant};

use fatfs::FatType;
use usbfs::fs::OpenMode;
use usbfs::{MAX_DRIVES, ServiceError};
use usbfs_fat::EntryKind;
use usbfs_scsi::transport::mock::{MockDeviceConfig, MockLunConfig};

use common::{bridge, fat12_device, fat16_device, fat_image, fat_image_clustered, list_ids};

#[test]
fn cold_boot_lists_no_drives() {
    let (_transport, _manager, service) = bridge();

    let mut out = [-1i32; 8];
    assert_eq!(service.list_mounted_drives(&mut out), 0);
    assert_eq!(out, [-1i32; 8]);
}

#[test]
fn fat32_device_mounts_and_reports_its_type() {
    let (transport, _manager, service) = bridge();
    transport.plug(MockDeviceConfig::single_lun(fat_image(
        FatType::Fat32,
        64 << 20,
    )));

    let ids = list_ids(&service);
    assert_eq!(ids.len(), 1);
    assert_eq!(service.get_drive_fs_type(ids[0]).unwrap(), 3);
}

#[test]
fn fat16_device_reports_its_type() {
    let (transport, _manager, service) = bridge();
    transport.plug(fat16_device());

    let ids = list_ids(&service);
    assert_eq!(service.get_drive_fs_type(ids[0]).unwrap(), 2);
}

#[test]
fn unknown_interface_id_is_rejected() {
    let (transport, _manager, service) = bridge();
    transport.plug(fat16_device());
    let _ = list_ids(&service);

    assert_eq!(
        service.get_drive_fs_type(9999),
        Err(ServiceError::InvalidDriveInterfaceId)
    );
    assert_eq!(
        service.get_drive_label(9999),
        Err(ServiceError::InvalidDriveInterfaceId)
    );
}

#[test]
fn label_set_get_roundtrip() {
    let (transport, _manager, service) = bridge();
    transport.plug(fat16_device());
    let id = list_ids(&service)[0];

    service.set_drive_label(id, "HELLO").unwrap();
    assert_eq!(service.get_drive_label(id).unwrap(), "HELLO");

    // Truncated to the FAT maximum of 11 characters.
    service.set_drive_label(id, "ABCDEFGHIJKLMNO").unwrap();
    assert_eq!(service.get_drive_label(id).unwrap(), "ABCDEFGHIJK");

    // Empty input clears the label.
    service.set_drive_label(id, "").unwrap();
    assert_eq!(service.get_drive_label(id).unwrap(), "");
}

#[test]
fn hot_unplug_fails_open_file_and_empties_the_list() {
    let (transport, _manager, service) = bridge();
    let addr = transport.plug(fat16_device());
    let id = list_ids(&service)[0];

    let fs = service.open_drive_filesystem(id).unwrap();
    fs.create_file("/data.bin", 0).unwrap();
    let file = fs
        .open_file("/data.bin", OpenMode::READ | OpenMode::WRITE)
        .unwrap();
    file.write(0, b"hello").unwrap();

    transport.unplug(addr);

    let mut buf = [0u8; 5];
    assert_eq!(file.read(0, &mut buf), Err(ServiceError::DriveUnavailable));
    assert!(list_ids(&service).is_empty());

    // Teardown closed everything exactly once.
    let stats = transport.stats(addr);
    assert_eq!(stats.interface_releases, 1);
    assert_eq!(stats.in_endpoint_closes, 1);
    assert_eq!(stats.out_endpoint_closes, 1);
}

#[test]
fn multi_lun_device_falls_back_to_the_second_unit() {
    let (transport, _manager, service) = bridge();
    transport.plug(MockDeviceConfig::with_luns(vec![
        MockLunConfig::never_ready(),
        MockLunConfig::ram_disk(fat_image(FatType::Fat16, 4 << 20)),
    ]));

    let ids = list_ids(&service);
    assert_eq!(ids.len(), 1);
    assert_eq!(service.get_drive_fs_type(ids[0]).unwrap(), 2);

    // Prove the mounted unit actually works.
    let fs = service.open_drive_filesystem(ids[0]).unwrap();
    fs.create_file("/probe.txt", 16).unwrap();
    assert_eq!(fs.get_entry_type("/probe.txt").unwrap(), EntryKind::File);
}

#[test]
fn slot_exhaustion_releases_the_refused_device() {
    let (transport, manager, service) = bridge();

    for _ in 0..MAX_DRIVES {
        transport.plug(fat12_device());
    }
    manager.poll();
    assert_eq!(manager.drive_count(), MAX_DRIVES);

    let extra = transport.plug(fat12_device());
    manager.poll();
    assert_eq!(manager.drive_count(), MAX_DRIVES);

    // Acquired once, probed, given back whole.
    let stats = transport.stats(extra);
    assert_eq!(stats.interface_releases, 1);
    assert_eq!(stats.in_endpoint_closes, 1);
    assert_eq!(stats.out_endpoint_closes, 1);
    assert!(!stats.acquired);

    transport.unplug(extra);
    assert_eq!(list_ids(&service).len(), MAX_DRIVES);
}

#[test]
fn write_then_read_roundtrip() {
    let (transport, _manager, service) = bridge();
    transport.plug(fat16_device());
    let id = list_ids(&service)[0];
    let fs = service.open_drive_filesystem(id).unwrap();

    let data: Vec<u8> = (0..8000u32).map(|i| (i * 7 % 256) as u8).collect();

    fs.create_file("/blob.bin", 0).unwrap();
    let file = fs.open_file("/blob.bin", OpenMode::WRITE).unwrap();
    assert_eq!(file.write(0, &data).unwrap(), data.len());
    drop(file);

    let file = fs.open_file("/blob.bin", OpenMode::READ).unwrap();
    assert_eq!(file.get_size().unwrap(), data.len() as u64);
    let mut back = vec![0u8; data.len()];
    assert_eq!(file.read(0, &mut back).unwrap(), data.len());
    assert_eq!(back, data);

    // Mode flags are enforced.
    assert!(file.write(0, b"nope").is_err());
}

#[test]
fn repeated_polls_are_idempotent() {
    let (transport, manager, service) = bridge();
    transport.plug(fat16_device());

    for _ in 0..3 {
        manager.poll();
    }
    assert_eq!(manager.drive_count(), 1);

    let (assignments, used) = manager.slot_assignments();
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].1, 0);
    assert_eq!(used, vec![0]);

    let ids = list_ids(&service);
    assert_eq!(ids.len(), 1);
}

#[test]
fn free_space_drops_by_roughly_the_file_size() {
    let (transport, _manager, service) = bridge();
    transport.plug(MockDeviceConfig::single_lun(fat_image_clustered(
        FatType::Fat16,
        8 << 20,
        4096,
    )));
    let id = list_ids(&service)[0];
    let fs = service.open_drive_filesystem(id).unwrap();

    let total = fs.get_total_space().unwrap();
    let before = fs.get_free_space().unwrap();
    assert!(before <= total);

    const SIZE: u64 = 64 * 1024;
    fs.create_file("/big.bin", SIZE).unwrap();

    let after = fs.get_free_space().unwrap();
    let delta = before - after;
    assert!(delta >= SIZE - 4095, "freed {delta} for {SIZE}");
    assert!(delta <= SIZE + 4095, "freed {delta} for {SIZE}");
    assert_eq!(fs.get_total_space().unwrap(), total);
}

#[test]
fn directory_tree_create_and_recursive_delete() {
    let (transport, _manager, service) = bridge();
    transport.plug(fat16_device());
    let id = list_ids(&service)[0];
    let fs = service.open_drive_filesystem(id).unwrap();

    fs.create_directory("/a").unwrap();
    fs.create_directory("/a/b").unwrap();
    fs.create_file("/a/f1.bin", 32).unwrap();
    fs.create_file("/a/b/f2.bin", 32).unwrap();

    assert_eq!(fs.get_entry_type("/a").unwrap(), EntryKind::Directory);
    assert_eq!(fs.get_entry_type("/a/f1.bin").unwrap(), EntryKind::File);

    // Deleting a populated directory non-recursively is refused...
    assert!(fs.delete_directory("/a").is_err());

    // ...cleaning empties it but keeps the directory...
    fs.clean_directory_recursively("/a").unwrap();
    assert_eq!(fs.get_entry_type("/a").unwrap(), EntryKind::Directory);
    let dir = fs.open_directory("/a").unwrap();
    assert_eq!(dir.entry_count().unwrap(), 0);

    // ...and the recursive delete takes the directory with it.
    fs.create_directory("/a/c").unwrap();
    fs.create_file("/a/c/f3.bin", 8).unwrap();
    fs.delete_directory_recursively("/a").unwrap();
    assert_eq!(fs.get_entry_type("/a"), Err(ServiceError::PathNotFound));
}

#[test]
fn rename_applies_to_files_and_directories() {
    let (transport, _manager, service) = bridge();
    transport.plug(fat16_device());
    let id = list_ids(&service)[0];
    let fs = service.open_drive_filesystem(id).unwrap();

    fs.create_file("/x.txt", 4).unwrap();
    fs.rename_file("/x.txt", "/y.txt").unwrap();
    assert_eq!(fs.get_entry_type("/x.txt"), Err(ServiceError::PathNotFound));
    assert_eq!(fs.get_entry_type("/y.txt").unwrap(), EntryKind::File);

    fs.create_directory("/old").unwrap();
    fs.rename_directory("/old", "/new").unwrap();
    assert_eq!(fs.get_entry_type("/new").unwrap(), EntryKind::Directory);

    fs.create_file("/z.txt", 0).unwrap();
    assert_eq!(
        fs.rename_file("/z.txt", "/y.txt"),
        Err(ServiceError::PathAlreadyExists)
    );
}

#[test]
fn set_size_truncates_on_shrink_and_extends_on_growth() {
    let (transport, _manager, service) = bridge();
    transport.plug(fat16_device());
    let id = list_ids(&service)[0];
    let fs = service.open_drive_filesystem(id).unwrap();

    fs.create_file("/t.bin", 0).unwrap();
    let file = fs
        .open_file("/t.bin", OpenMode::READ | OpenMode::WRITE)
        .unwrap();

    let data: Vec<u8> = (0..100u8).collect();
    file.write(0, &data).unwrap();

    file.set_size(40).unwrap();
    assert_eq!(file.get_size().unwrap(), 40);
    let mut back = vec![0u8; 64];
    assert_eq!(file.read(0, &mut back).unwrap(), 40);
    assert_eq!(&back[..40], &data[..40]);

    file.set_size(60).unwrap();
    assert_eq!(file.get_size().unwrap(), 60);
    let mut back = vec![0u8; 60];
    file.read(0, &mut back).unwrap();
    assert_eq!(&back[..40], &data[..40]);
    assert!(back[40..].iter().all(|&b| b == 0));
}

#[test]
fn append_mode_ignores_the_offset() {
    let (transport, _manager, service) = bridge();
    transport.plug(fat16_device());
    let id = list_ids(&service)[0];
    let fs = service.open_drive_filesystem(id).unwrap();

    fs.create_file("/log.txt", 0).unwrap();
    let file = fs
        .open_file("/log.txt", OpenMode::READ | OpenMode::APPEND)
        .unwrap();
    file.write(0, b"one").unwrap();
    file.write(0, b"two").unwrap();

    let mut back = [0u8; 6];
    assert_eq!(file.read(0, &mut back).unwrap(), 6);
    assert_eq!(&back, b"onetwo");
}

#[test]
fn file_timestamp_has_only_a_modification_time() {
    let (transport, _manager, service) = bridge();
    transport.plug(fat16_device());
    let id = list_ids(&service)[0];
    let fs = service.open_drive_filesystem(id).unwrap();

    fs.create_file("/stamp.bin", 1).unwrap();
    let ts = fs.get_file_timestamp("/stamp.bin").unwrap();

    assert!(ts.is_valid);
    assert_eq!(ts.created, 0);
    assert_eq!(ts.accessed, 0);
    // Not before the FAT epoch (1980-01-01).
    assert!(ts.modified >= 315_532_800);
}

#[test]
fn directory_reads_stream_through_a_cursor() {
    let (transport, _manager, service) = bridge();
    transport.plug(fat16_device());
    let id = list_ids(&service)[0];
    let fs = service.open_drive_filesystem(id).unwrap();

    fs.create_directory("/d").unwrap();
    for name in ["a.bin", "b.bin", "c.bin"] {
        fs.create_file(&format!("/d/{name}"), 4).unwrap();
    }

    let dir = fs.open_directory("/d").unwrap();
    assert_eq!(dir.read_entries(2).unwrap().len(), 2);
    assert_eq!(dir.read_entries(2).unwrap().len(), 1);
    assert!(dir.read_entries(2).unwrap().is_empty());

    let dir = fs.open_directory("/d").unwrap();
    assert_eq!(dir.entry_count().unwrap(), 3);
    assert_eq!(dir.entry_count().unwrap(), 0);
}

#[test]
fn open_file_validates_kind_and_existence() {
    let (transport, _manager, service) = bridge();
    transport.plug(fat16_device());
    let id = list_ids(&service)[0];
    let fs = service.open_drive_filesystem(id).unwrap();

    assert_eq!(
        fs.open_file("/missing.bin", OpenMode::READ).err(),
        Some(ServiceError::PathNotFound)
    );

    fs.create_directory("/dir").unwrap();
    assert_eq!(
        fs.open_file("/dir", OpenMode::READ).err(),
        Some(ServiceError::PathNotFound)
    );
    assert_eq!(
        fs.open_directory("/missing").err(),
        Some(ServiceError::PathNotFound)
    );

    fs.create_file("/f", 0).unwrap();
    assert_eq!(
        fs.create_file("/f", 0),
        Err(ServiceError::PathAlreadyExists)
    );
}

#[test]
fn reconciler_thread_mounts_and_removes_on_events() {
    let (transport, manager, _service) = bridge();
    manager.start();

    let addr = transport.plug(fat16_device());
    wait_until(|| manager.drive_count() == 1);

    transport.unplug(addr);
    wait_until(|| manager.drive_count() == 0);

    manager.shutdown();
    let stats = transport.stats(addr);
    assert_eq!(stats.interface_releases, 1);
    assert_eq!(stats.in_endpoint_closes, 1);
    assert_eq!(stats.out_endpoint_closes, 1);
}

#[test]
fn shutdown_tears_down_live_drives_exactly_once() {
    let (transport, manager, _service) = bridge();
    manager.start();

    let addr = transport.plug(fat16_device());
    wait_until(|| manager.drive_count() == 1);

    manager.shutdown();
    assert_eq!(manager.drive_count(), 0);

    let stats = transport.stats(addr);
    assert_eq!(stats.interface_releases, 1);
    assert_eq!(stats.in_endpoint_closes, 1);
    assert_eq!(stats.out_endpoint_closes, 1);

    // A second shutdown is a no-op.
    manager.shutdown();
    let stats = transport.stats(addr);
    assert_eq!(stats.interface_releases, 1);
}

#[test]
fn misconfigured_device_is_configured_and_reset() {
    let (transport, manager, _service) = bridge();

    let mut config = fat16_device();
    config.active_configuration = 0; // enumerated unconfigured
    let addr = transport.plug(config);

    manager.poll();
    assert_eq!(manager.drive_count(), 1);

    let stats = transport.stats(addr);
    assert_eq!(stats.set_configuration_count, 1);
    assert!(stats.bulk_resets >= 1);
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}
