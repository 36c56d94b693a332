//! Byte-granular slot I/O over the scripted bus.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use usbfs_fat::{SlotIo, SlotTable};
use usbfs_scsi::bot::BulkOnlyTransport;
use usbfs_scsi::transport::mock::{MockDeviceConfig, MockTransport};
use usbfs_scsi::transport::{InterfaceFilter, UsbTransport};
use usbfs_scsi::{ScsiBlockDevice, ScsiOptions};

fn block_device(transport: &MockTransport) -> ScsiBlockDevice {
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

    let bot = BulkOnlyTransport::new(
        Arc::new(transport.clone()),
        iface,
        desc.interface_number,
        in_ep,
        out_ep,
    );
    ScsiBlockDevice::new(
        bot,
        0,
        ScsiOptions {
            ready_attempts: 16,
            ready_backoff: Duration::from_millis(1),
        },
    )
}

fn bound_slot(transport: &MockTransport) -> (Arc<SlotTable>, Arc<Mutex<ScsiBlockDevice>>) {
    let device = Arc::new(Mutex::new(block_device(transport)));
    let table = Arc::new(SlotTable::new());
    table.bind(0, &device);
    (table, device)
}

#[test]
fn unaligned_write_read_roundtrip() {
    let transport = MockTransport::new();
    let addr = transport.plug(MockDeviceConfig::single_lun(vec![0u8; 64 * 1024]));
    let (table, _device) = bound_slot(&transport);

    let mut io = SlotIo::new(table.clone(), 0);

    // Straddles three sectors, starting mid-sector.
    let data: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
    io.seek(SeekFrom::Start(300)).unwrap();
    io.write_all(&data).unwrap();

    let mut io = SlotIo::new(table, 0);
    io.seek(SeekFrom::Start(300)).unwrap();
    let mut back = vec![0u8; data.len()];
    io.read_exact(&mut back).unwrap();
    assert_eq!(back, data);

    // Bytes outside the window stay zero.
    let disk = transport.snapshot_disk(addr, 0);
    assert!(disk[..300].iter().all(|&b| b == 0));
    assert_eq!(&disk[300..300 + data.len()], &data[..]);
    assert!(disk[300 + data.len()..2048].iter().all(|&b| b == 0));
}

#[test]
fn reads_and_writes_clamp_at_end_of_disk() {
    let transport = MockTransport::new();
    transport.plug(MockDeviceConfig::single_lun(vec![0u8; 8 * 512]));
    let (table, _device) = bound_slot(&transport);

    let mut io = SlotIo::new(table, 0);
    let end = io.seek(SeekFrom::End(0)).unwrap();
    assert_eq!(end, 8 * 512);

    assert_eq!(io.write(&[1, 2, 3]).unwrap(), 0);
    let mut buf = [0u8; 4];
    assert_eq!(io.read(&mut buf).unwrap(), 0);

    // Seeking past the end clamps instead of failing.
    assert_eq!(io.seek(SeekFrom::Start(1 << 30)).unwrap(), 8 * 512);
}

#[test]
fn cleared_slot_answers_with_parameter_error() {
    let transport = MockTransport::new();
    transport.plug(MockDeviceConfig::single_lun(vec![0u8; 8 * 512]));
    let (table, _device) = bound_slot(&transport);

    let mut io = SlotIo::new(table.clone(), 0);
    io.write_all(&[0xAB; 512]).unwrap();

    table.clear(0);
    let mut buf = [0u8; 16];
    let err = io.read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
}

#[test]
fn dead_device_reference_is_detected() {
    let transport = MockTransport::new();
    transport.plug(MockDeviceConfig::single_lun(vec![0u8; 8 * 512]));
    let (table, device) = bound_slot(&transport);

    // Dropping the owner leaves a dead weak binding behind; the upgrade
    // on access is the validation.
    drop(device);
    let mut io = SlotIo::new(table, 0);
    let err = io.read(&mut [0u8; 16]).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
}
