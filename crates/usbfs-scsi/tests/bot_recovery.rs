//! Bulk-only transport and block-device behavior against the scripted bus.

use std::sync::Arc;
use std::time::Duration;

use usbfs_scsi::bot::BulkOnlyTransport;
use usbfs_scsi::transport::mock::{FaultPlan, MockDeviceConfig, MockLunConfig, MockTransport};
use usbfs_scsi::transport::{InterfaceFilter, UsbTransport};
use usbfs_scsi::{ScsiBlockDevice, ScsiError, ScsiOptions};

fn fast_opts() -> ScsiOptions {
    ScsiOptions {
        ready_attempts: 16,
        ready_backoff: Duration::from_millis(1),
    }
}

/// Acquire the first available interface and bind its endpoint pair.
fn open_first(transport: &MockTransport) -> BulkOnlyTransport {
    let filter = InterfaceFilter::mass_storage_bulk_only();
    let descs = transport.enumerate_available(&filter).unwrap();
    let desc = descs.first().expect("a device should be available");

    let iface = transport.acquire(desc).unwrap();
    let in_ep = transport
        .open_endpoint(iface, &desc.input_endpoints[0])
        .unwrap();
    let out_ep = transport
        .open_endpoint(iface, &desc.output_endpoints[0])
        .unwrap();

    BulkOnlyTransport::new(
        Arc::new(transport.clone()),
        iface,
        desc.interface_number,
        in_ep,
        out_ep,
    )
}

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[test]
fn setup_reads_identity_and_geometry() {
    let transport = MockTransport::new();
    transport.plug(MockDeviceConfig::single_lun(vec![0u8; 256 * 1024]));

    let bot = open_first(&transport);
    let device = ScsiBlockDevice::new(bot, 0, fast_opts());

    assert!(device.ok());
    assert_eq!(device.block_size(), 512);
    assert_eq!(device.block_count(), 512);
    assert_eq!(device.capacity_bytes(), 256 * 1024);

    let identity = device.identity().expect("inquiry data cached");
    assert_eq!(identity.vendor(), "MOCKBUS");
    assert_eq!(identity.product(), "SCRIPTED DISK");
}

#[test]
fn spin_up_retries_until_ready() {
    let transport = MockTransport::new();
    let mut lun = MockLunConfig::ram_disk(vec![0u8; 64 * 1024]);
    lun.ready_after = 5;
    transport.plug(MockDeviceConfig::with_luns(vec![lun]));

    let bot = open_first(&transport);
    let device = ScsiBlockDevice::new(bot, 0, fast_opts());
    assert!(device.ok());
}

#[test]
fn never_ready_unit_is_not_ok() {
    let transport = MockTransport::new();
    transport.plug(MockDeviceConfig::with_luns(vec![MockLunConfig::never_ready()]));

    let bot = open_first(&transport);
    let device = ScsiBlockDevice::new(bot, 0, fast_opts());
    assert!(!device.ok());
}

#[test]
fn non_disk_unit_is_rejected() {
    let transport = MockTransport::new();
    let mut lun = MockLunConfig::ram_disk(vec![0u8; 64 * 1024]);
    lun.device_type = 0x05; // CD-ROM
    transport.plug(MockDeviceConfig::with_luns(vec![lun]));

    let bot = open_first(&transport);
    let device = ScsiBlockDevice::new(bot, 0, fast_opts());
    assert!(!device.ok());
}

#[test]
fn sector_roundtrip_splits_large_transfers() {
    let transport = MockTransport::new();
    let addr = transport.plug(MockDeviceConfig::single_lun(vec![0u8; 128 * 1024]));

    let bot = open_first(&transport);
    let mut device = ScsiBlockDevice::new(bot, 0, fast_opts());
    assert!(device.ok());

    // 96 KiB spans three 32 KiB bounce-buffer transactions.
    let data = patterned(96 * 1024, 7);
    device.write_sectors(3, 192, &data).unwrap();

    let mut back = vec![0u8; data.len()];
    device.read_sectors(3, 192, &mut back).unwrap();
    assert_eq!(back, data);

    let disk = transport.snapshot_disk(addr, 0);
    assert_eq!(&disk[3 * 512..3 * 512 + data.len()], &data[..]);
}

#[test]
fn out_of_range_requests_are_rejected() {
    let transport = MockTransport::new();
    transport.plug(MockDeviceConfig::single_lun(vec![0u8; 64 * 1024]));

    let bot = open_first(&transport);
    let mut device = ScsiBlockDevice::new(bot, 0, fast_opts());

    let mut buf = vec![0u8; 512];
    assert!(matches!(
        device.read_sectors(128, 1, &mut buf),
        Err(ScsiError::OutOfRange)
    ));
    assert!(matches!(
        device.read_sectors(0, 1, &mut [0u8; 100]),
        Err(ScsiError::BadBufferSize)
    ));
}

#[test]
fn csw_stall_is_cleared_and_retried() {
    let transport = MockTransport::new();
    let addr = transport.plug(MockDeviceConfig::single_lun(vec![0u8; 64 * 1024]));

    let bot = open_first(&transport);
    let mut device = ScsiBlockDevice::new(bot, 0, fast_opts());
    assert!(device.ok());

    transport.inject_faults(
        addr,
        FaultPlan {
            stall_csw_once: true,
            ..FaultPlan::default()
        },
    );

    let mut buf = vec![0u8; 512];
    device.read_sectors(0, 1, &mut buf).unwrap();
    assert!(device.ok());
}

#[test]
fn data_stall_still_collects_status() {
    let transport = MockTransport::new();
    let addr = transport.plug(MockDeviceConfig::single_lun(vec![0u8; 64 * 1024]));

    let bot = open_first(&transport);
    let mut device = ScsiBlockDevice::new(bot, 0, fast_opts());

    transport.inject_faults(
        addr,
        FaultPlan {
            stall_data_in_once: true,
            ..FaultPlan::default()
        },
    );

    // The stalled data phase costs us the payload but not the transport:
    // the command fails cleanly and the next one runs without recovery.
    let mut buf = vec![0u8; 512];
    assert!(matches!(
        device.read_sectors(0, 1, &mut buf),
        Err(ScsiError::CommandFailed { .. })
    ));
    assert!(device.ok());
    device.read_sectors(0, 1, &mut buf).unwrap();
}

#[test]
fn phase_error_triggers_reset_recovery() {
    let transport = MockTransport::new();
    let addr = transport.plug(MockDeviceConfig::single_lun(vec![0u8; 64 * 1024]));

    let bot = open_first(&transport);
    let mut device = ScsiBlockDevice::new(bot, 0, fast_opts());

    transport.inject_faults(
        addr,
        FaultPlan {
            phase_error_once: true,
            ..FaultPlan::default()
        },
    );

    let mut buf = vec![0u8; 512];
    assert!(matches!(
        device.read_sectors(0, 1, &mut buf),
        Err(ScsiError::CommandFailed { .. })
    ));

    // Reset recovery ran; the transport is usable again.
    let resets = transport.stats(addr).bulk_resets;
    assert!(resets >= 1);
    device.read_sectors(0, 1, &mut buf).unwrap();
    assert!(device.ok());
}

#[test]
fn stalled_get_max_lun_reads_as_single_lun() {
    let transport = MockTransport::new();
    let mut config = MockDeviceConfig::with_luns(vec![
        MockLunConfig::ram_disk(vec![0u8; 64 * 1024]),
        MockLunConfig::ram_disk(vec![0u8; 64 * 1024]),
    ]);
    config.stall_get_max_lun = true;
    transport.plug(config);

    let bot = open_first(&transport);
    assert_eq!(bot.get_max_lun(), 1);
}

#[test]
fn get_max_lun_reports_unit_count() {
    let transport = MockTransport::new();
    transport.plug(MockDeviceConfig::with_luns(vec![
        MockLunConfig::ram_disk(vec![0u8; 64 * 1024]),
        MockLunConfig::ram_disk(vec![0u8; 64 * 1024]),
    ]));

    let bot = open_first(&transport);
    assert_eq!(bot.get_max_lun(), 2);
}

#[test]
fn unplug_surfaces_disconnect_and_poisons_the_device() {
    let transport = MockTransport::new();
    let addr = transport.plug(MockDeviceConfig::single_lun(vec![0u8; 64 * 1024]));

    let bot = open_first(&transport);
    let mut device = ScsiBlockDevice::new(bot, 0, fast_opts());
    assert!(device.ok());

    transport.unplug(addr);

    let mut buf = vec![0u8; 512];
    assert!(device.read_sectors(0, 1, &mut buf).is_err());
    assert!(!device.ok());
}
