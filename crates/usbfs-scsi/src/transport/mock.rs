//! In-memory scripted USB bus.
//!
//! `MockTransport` implements [`UsbTransport`] over a bus of fake
//! bulk-only mass-storage devices whose logical units are RAM disks. The
//! devices speak real CBW/CSW framing and answer the control requests the
//! upper layers issue (Get Max LUN, bulk-only reset, endpoint status and
//! halt clearing, configuration and alternate-setting selection), so the
//! whole stack from the drive manager down runs unmodified against it.
//!
//! Fault injection covers the recovery paths: endpoint stalls in the data
//! and status phases, phase errors, units that never spin up. Plug and
//! unplug signal the registered wake events the way a real backend does,
//! and per-device counters record interface releases and endpoint closes
//! so tests can assert the exactly-once teardown contract.

use std::sync::{Arc, Mutex};

use super::{
    BulkData, ControlData, ControlRequest, EndpointDescriptor, EndpointSession,
    FEATURE_ENDPOINT_HALT, InterfaceDescriptor, InterfaceFilter, InterfaceId, InterfaceSession,
    MASS_STORAGE_BULK_ONLY, MASS_STORAGE_SCSI_COMMANDS, REQUEST_CLEAR_FEATURE,
    REQUEST_GET_CONFIGURATION, REQUEST_GET_STATUS, REQUEST_SET_CONFIGURATION,
    REQUEST_SET_INTERFACE, TransportError, TransportWake, USB_CLASS_MASS_STORAGE, UsbTransport,
};
use crate::bot::{REQUEST_BULK_ONLY_RESET, REQUEST_GET_MAX_LUN};
use crate::commands::cbw::{CBW_LEN, CBW_SIGNATURE, CSW_LEN, CSW_SIGNATURE};

const MOCK_IN_EP: u8 = 0x81;
const MOCK_OUT_EP: u8 = 0x02;

/// One logical unit of a scripted device.
pub struct MockLunConfig {
    /// Backing store; its length must be a multiple of `block_size`.
    pub disk: Vec<u8>,
    pub block_size: u32,
    /// TEST UNIT READY attempts that fail before the unit reports ready.
    /// `u32::MAX` means the unit never becomes ready.
    pub ready_after: u32,
    /// INQUIRY peripheral device type byte.
    pub device_type: u8,
}

impl MockLunConfig {
    /// A ready direct-access unit over the given image.
    pub fn ram_disk(disk: Vec<u8>) -> Self {
        Self {
            disk,
            block_size: 512,
            ready_after: 0,
            device_type: 0x00,
        }
    }

    /// A unit that never finishes spinning up; its drive fails setup.
    pub fn never_ready() -> Self {
        Self {
            disk: vec![0; 512 * 16],
            block_size: 512,
            ready_after: u32::MAX,
            device_type: 0x00,
        }
    }
}

/// Injectable one-shot protocol faults.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultPlan {
    /// Stall the IN endpoint on the next CSW read (exercises the
    /// clear-halt-and-retry path).
    pub stall_csw_once: bool,
    /// Stall the IN endpoint instead of the next data-in phase.
    pub stall_data_in_once: bool,
    /// Answer the next command with a phase-error CSW.
    pub phase_error_once: bool,
}

/// A scripted device as plugged into the mock bus.
pub struct MockDeviceConfig {
    pub luns: Vec<MockLunConfig>,
    /// bConfigurationValue advertised in the descriptor.
    pub configuration_value: u8,
    /// Configuration the device claims to be in when asked; when it
    /// differs from the descriptor the host must SET_CONFIGURATION.
    pub active_configuration: u8,
    /// bAlternateSetting advertised in the descriptor.
    pub alternate_setting: u8,
    /// STALL the Get Max LUN request (hosts must assume a single LUN).
    pub stall_get_max_lun: bool,
    pub faults: FaultPlan,
}

impl MockDeviceConfig {
    pub fn single_lun(disk: Vec<u8>) -> Self {
        Self {
            luns: vec![MockLunConfig::ram_disk(disk)],
            ..Self::empty()
        }
    }

    pub fn with_luns(luns: Vec<MockLunConfig>) -> Self {
        Self {
            luns,
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            luns: Vec::new(),
            configuration_value: 1,
            active_configuration: 1,
            alternate_setting: 0,
            stall_get_max_lun: false,
            faults: FaultPlan::default(),
        }
    }
}

/// Teardown counters for asserting resource lifecycle invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockDeviceStats {
    pub plugged: bool,
    pub acquired: bool,
    pub interface_releases: u32,
    pub in_endpoint_closes: u32,
    pub out_endpoint_closes: u32,
    pub bulk_resets: u32,
    pub set_configuration_count: u32,
    pub set_interface_count: u32,
}

struct MockLun {
    disk: Vec<u8>,
    block_size: u32,
    not_ready_left: u32,
    device_type: u8,
}

struct ParsedCbw {
    tag: u32,
    data_len: u32,
    dir_in: bool,
    lun: u8,
    cdb: [u8; 16],
}

enum BotPhase {
    Idle,
    DataIn { data: Vec<u8>, csw: [u8; CSW_LEN] },
    DataOut { cbw: ParsedCbw, buf: Vec<u8> },
    Status { csw: [u8; CSW_LEN] },
}

struct MockDevice {
    address: u8,
    plugged: bool,
    acquired: Option<InterfaceId>,
    interface_number: u8,
    configuration_value: u8,
    active_configuration: u8,
    alternate_setting: u8,
    stall_get_max_lun: bool,
    in_open: bool,
    out_open: bool,
    in_halted: bool,
    out_halted: bool,
    stats: MockDeviceStats,
    faults: FaultPlan,
    bot: BotPhase,
    luns: Vec<MockLun>,
}

impl MockDevice {
    fn descriptor(&self) -> InterfaceDescriptor {
        InterfaceDescriptor {
            bus_number: 0,
            device_address: self.address,
            interface_number: self.interface_number,
            configuration_value: self.configuration_value,
            alternate_setting: self.alternate_setting,
            class_code: USB_CLASS_MASS_STORAGE,
            sub_class_code: MASS_STORAGE_SCSI_COMMANDS,
            protocol_code: MASS_STORAGE_BULK_ONLY,
            input_endpoints: vec![EndpointDescriptor {
                address: MOCK_IN_EP,
                max_packet_size: 512,
            }],
            output_endpoints: vec![EndpointDescriptor {
                address: MOCK_OUT_EP,
                max_packet_size: 512,
            }],
        }
    }

    fn build_csw(tag: u32, residue: u32, status: u8) -> [u8; CSW_LEN] {
        let mut csw = [0u8; CSW_LEN];
        csw[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        csw[4..8].copy_from_slice(&tag.to_le_bytes());
        csw[8..12].copy_from_slice(&residue.to_le_bytes());
        csw[12] = status;
        csw
    }

    /// Run a SCSI command against one of our LUNs. Returns the data-in
    /// payload and the CSW status byte.
    fn execute(&mut self, cbw: &ParsedCbw, data_out: &[u8]) -> (Vec<u8>, u8) {
        if self.faults.phase_error_once {
            self.faults.phase_error_once = false;
            return (Vec::new(), 0x02);
        }

        let Some(lun) = self.luns.get_mut(cbw.lun as usize) else {
            return (Vec::new(), 0x01);
        };

        let cdb = &cbw.cdb;
        match cdb[0] {
            // TEST UNIT READY
            0x00 => {
                if lun.not_ready_left > 0 {
                    if lun.not_ready_left != u32::MAX {
                        lun.not_ready_left -= 1;
                    }
                    (Vec::new(), 0x01)
                } else {
                    (Vec::new(), 0x00)
                }
            }
            // INQUIRY
            0x12 => {
                let mut data = vec![0u8; 36];
                data[0] = lun.device_type;
                data[1] = 0x80;
                data[4] = 31;
                data[8..16].copy_from_slice(b"MOCKBUS ");
                data[16..32].copy_from_slice(b"SCRIPTED DISK   ");
                data[32..36].copy_from_slice(b"0.01");
                data.truncate(cbw.data_len as usize);
                (data, 0x00)
            }
            // READ CAPACITY (10)
            0x25 => {
                let blocks = lun.disk.len() as u64 / lun.block_size as u64;
                let last = blocks.saturating_sub(1);
                let last32 = if last > u32::MAX as u64 {
                    u32::MAX
                } else {
                    last as u32
                };
                let mut data = Vec::with_capacity(8);
                data.extend_from_slice(&last32.to_be_bytes());
                data.extend_from_slice(&lun.block_size.to_be_bytes());
                (data, 0x00)
            }
            // SERVICE ACTION IN (16) / READ CAPACITY (16)
            0x9E if cdb[1] & 0x1F == 0x10 => {
                let blocks = lun.disk.len() as u64 / lun.block_size as u64;
                let mut data = vec![0u8; 32];
                data[0..8].copy_from_slice(&blocks.saturating_sub(1).to_be_bytes());
                data[8..12].copy_from_slice(&lun.block_size.to_be_bytes());
                data.truncate(cbw.data_len as usize);
                (data, 0x00)
            }
            // READ (10)
            0x28 => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as usize;
                let count = u16::from_be_bytes([cdb[7], cdb[8]]) as usize;
                let bs = lun.block_size as usize;
                let start = lba * bs;
                let end = start + count * bs;
                if end > lun.disk.len() {
                    return (Vec::new(), 0x01);
                }
                (lun.disk[start..end].to_vec(), 0x00)
            }
            // WRITE (10)
            0x2A => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as usize;
                let count = u16::from_be_bytes([cdb[7], cdb[8]]) as usize;
                let bs = lun.block_size as usize;
                let start = lba * bs;
                let end = start + count * bs;
                if end > lun.disk.len() || data_out.len() != count * bs {
                    return (Vec::new(), 0x01);
                }
                lun.disk[start..end].copy_from_slice(data_out);
                (Vec::new(), 0x00)
            }
            _ => (Vec::new(), 0x01),
        }
    }

    fn finish_command(&mut self, cbw: ParsedCbw, data_out: &[u8]) {
        let (data_in, status) = self.execute(&cbw, data_out);
        let actual = if cbw.dir_in {
            data_in.len()
        } else {
            data_out.len()
        };
        let residue = cbw.data_len.saturating_sub(actual as u32);
        let csw = Self::build_csw(cbw.tag, residue, status);

        let expects_data_in = cbw.dir_in && cbw.data_len > 0;

        if expects_data_in && status == 0x00 && !data_in.is_empty() {
            if self.faults.stall_data_in_once {
                // The payload never made it out; report the command failed.
                self.faults.stall_data_in_once = false;
                self.in_halted = true;
                self.bot = BotPhase::Status {
                    csw: Self::build_csw(cbw.tag, cbw.data_len, 0x01),
                };
            } else {
                self.bot = BotPhase::DataIn { data: data_in, csw };
            }
            return;
        }

        // Nothing to serve in an expected data-in phase (failed command
        // or phase error): stall the IN pipe the host is about to read,
        // the way real hardware reports it.
        if expects_data_in {
            self.in_halted = true;
        }
        self.bot = BotPhase::Status { csw };
    }

    fn handle_bulk_out(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        if self.out_halted {
            return Err(TransportError::Stall);
        }

        match std::mem::replace(&mut self.bot, BotPhase::Idle) {
            BotPhase::Idle => {
                if buf.len() != CBW_LEN
                    || u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) != CBW_SIGNATURE
                {
                    self.out_halted = true;
                    return Err(TransportError::Stall);
                }

                let mut cdb = [0u8; 16];
                cdb.copy_from_slice(&buf[15..31]);
                let cbw = ParsedCbw {
                    tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
                    data_len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
                    dir_in: buf[12] & 0x80 != 0,
                    lun: buf[13],
                    cdb,
                };

                if !cbw.dir_in && cbw.data_len > 0 {
                    self.bot = BotPhase::DataOut {
                        cbw,
                        buf: Vec::new(),
                    };
                } else {
                    self.finish_command(cbw, &[]);
                }
                Ok(CBW_LEN)
            }
            BotPhase::DataOut { cbw, buf: mut got } => {
                got.extend_from_slice(buf);
                if got.len() >= cbw.data_len as usize {
                    let data = got;
                    self.finish_command(cbw, &data);
                } else {
                    self.bot = BotPhase::DataOut { cbw, buf: got };
                }
                Ok(buf.len())
            }
            other => {
                // Host wrote while we owed it data or status.
                self.bot = other;
                self.out_halted = true;
                Err(TransportError::Stall)
            }
        }
    }

    fn handle_bulk_in(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.in_halted {
            return Err(TransportError::Stall);
        }

        match std::mem::replace(&mut self.bot, BotPhase::Idle) {
            BotPhase::DataIn { data, csw } => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                self.bot = BotPhase::Status { csw };
                Ok(n)
            }
            BotPhase::Status { csw } => {
                if self.faults.stall_csw_once {
                    self.faults.stall_csw_once = false;
                    self.in_halted = true;
                    self.bot = BotPhase::Status { csw };
                    return Err(TransportError::Stall);
                }
                let n = csw.len().min(buf.len());
                buf[..n].copy_from_slice(&csw[..n]);
                Ok(n)
            }
            other => {
                self.bot = other;
                self.in_halted = true;
                Err(TransportError::Stall)
            }
        }
    }

    fn handle_control(
        &mut self,
        req: ControlRequest,
        data: ControlData<'_>,
    ) -> Result<usize, TransportError> {
        match (req.request_type, req.request) {
            // Get Max LUN (class, interface, device-to-host)
            (0xA1, REQUEST_GET_MAX_LUN) => {
                if self.stall_get_max_lun {
                    return Err(TransportError::Stall);
                }
                let ControlData::In(buf) = data else {
                    return Err(TransportError::Protocol("Get Max LUN without in-buffer"));
                };
                buf[0] = (self.luns.len().max(1) - 1) as u8;
                Ok(1)
            }
            // Bulk-Only Mass Storage Reset (class, interface, host-to-device)
            (0x21, REQUEST_BULK_ONLY_RESET) => {
                self.bot = BotPhase::Idle;
                self.stats.bulk_resets += 1;
                Ok(0)
            }
            // Endpoint GET_STATUS
            (0x82, REQUEST_GET_STATUS) => {
                let ControlData::In(buf) = data else {
                    return Err(TransportError::Protocol("GET_STATUS without in-buffer"));
                };
                let halted = if req.index as u8 == MOCK_IN_EP {
                    self.in_halted
                } else {
                    self.out_halted
                };
                buf[0] = halted as u8;
                if buf.len() > 1 {
                    buf[1] = 0;
                }
                Ok(2)
            }
            // Endpoint CLEAR_FEATURE(ENDPOINT_HALT)
            (0x02, REQUEST_CLEAR_FEATURE) if req.value == FEATURE_ENDPOINT_HALT => {
                if req.index as u8 == MOCK_IN_EP {
                    self.in_halted = false;
                } else {
                    self.out_halted = false;
                }
                Ok(0)
            }
            // Device GET_CONFIGURATION
            (0x80, REQUEST_GET_CONFIGURATION) => {
                let ControlData::In(buf) = data else {
                    return Err(TransportError::Protocol(
                        "GET_CONFIGURATION without in-buffer",
                    ));
                };
                buf[0] = self.active_configuration;
                Ok(1)
            }
            // Device SET_CONFIGURATION
            (0x00, REQUEST_SET_CONFIGURATION) => {
                self.active_configuration = req.value as u8;
                self.stats.set_configuration_count += 1;
                Ok(0)
            }
            // Interface SET_INTERFACE
            (0x01, REQUEST_SET_INTERFACE) => {
                self.alternate_setting = req.value as u8;
                self.stats.set_interface_count += 1;
                Ok(0)
            }
            _ => Err(TransportError::Protocol("unhandled control request")),
        }
    }
}

struct MockBus {
    next_iface_id: i32,
    next_address: u8,
    devices: Vec<MockDevice>,
}

impl MockBus {
    fn device_by_iface(&mut self, id: InterfaceId) -> Option<&mut MockDevice> {
        self.devices.iter_mut().find(|d| d.acquired == Some(id))
    }

    fn device_by_address(&mut self, address: u8) -> Option<&mut MockDevice> {
        self.devices.iter_mut().find(|d| d.address == address)
    }
}

struct MockShared {
    bus: Mutex<MockBus>,
    wake: Mutex<Option<TransportWake>>,
}

/// [`UsbTransport`] over a scripted in-memory bus. Cloning shares the bus.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MockShared {
                bus: Mutex::new(MockBus {
                    next_iface_id: 1,
                    next_address: 1,
                    devices: Vec::new(),
                }),
                wake: Mutex::new(None),
            }),
        }
    }

    /// Plug a device into the bus, returning its address. Signals the
    /// available-event if a wake registration is in place.
    pub fn plug(&self, config: MockDeviceConfig) -> u8 {
        let address = {
            let mut bus = self.shared.bus.lock().unwrap();
            let address = bus.next_address;
            bus.next_address += 1;
            bus.devices.push(MockDevice {
                address,
                plugged: true,
                acquired: None,
                interface_number: 0,
                configuration_value: config.configuration_value,
                active_configuration: config.active_configuration,
                alternate_setting: config.alternate_setting,
                stall_get_max_lun: config.stall_get_max_lun,
                in_open: false,
                out_open: false,
                in_halted: false,
                out_halted: false,
                stats: MockDeviceStats {
                    plugged: true,
                    acquired: false,
                    interface_releases: 0,
                    in_endpoint_closes: 0,
                    out_endpoint_closes: 0,
                    bulk_resets: 0,
                    set_configuration_count: 0,
                    set_interface_count: 0,
                },
                faults: config.faults,
                bot: BotPhase::Idle,
                luns: config
                    .luns
                    .into_iter()
                    .map(|lun| MockLun {
                        disk: lun.disk,
                        block_size: lun.block_size,
                        not_ready_left: lun.ready_after,
                        device_type: lun.device_type,
                    })
                    .collect(),
            });
            address
        };

        if let Some(wake) = &*self.shared.wake.lock().unwrap() {
            wake.available.signal();
        }
        address
    }

    /// Yank a device. Pending transfers fail with `Disconnected`; the
    /// interface disappears from the acquired set immediately.
    pub fn unplug(&self, address: u8) {
        {
            let mut bus = self.shared.bus.lock().unwrap();
            if let Some(device) = bus.device_by_address(address) {
                device.plugged = false;
                device.stats.plugged = false;
            }
        }

        if let Some(wake) = &*self.shared.wake.lock().unwrap() {
            wake.state_change.signal();
        }
    }

    /// Interface id currently bound to a device address, if acquired.
    pub fn interface_id_of(&self, address: u8) -> Option<InterfaceId> {
        let mut bus = self.shared.bus.lock().unwrap();
        bus.device_by_address(address).and_then(|d| d.acquired)
    }

    /// Lifecycle counters for assertions.
    pub fn stats(&self, address: u8) -> MockDeviceStats {
        let mut bus = self.shared.bus.lock().unwrap();
        let device = bus
            .device_by_address(address)
            .expect("no mock device at address");
        let mut stats = device.stats;
        stats.acquired = device.acquired.is_some();
        stats
    }

    /// Copy of a LUN's backing image.
    pub fn snapshot_disk(&self, address: u8, lun: usize) -> Vec<u8> {
        let mut bus = self.shared.bus.lock().unwrap();
        bus.device_by_address(address)
            .and_then(|d| d.luns.get(lun))
            .map(|l| l.disk.clone())
            .expect("no such mock lun")
    }

    /// Arm one-shot faults on a live device.
    pub fn inject_faults(&self, address: u8, faults: FaultPlan) {
        let mut bus = self.shared.bus.lock().unwrap();
        if let Some(device) = bus.device_by_address(address) {
            device.faults = faults;
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn enumerate_available(
        &self,
        filter: &InterfaceFilter,
    ) -> Result<Vec<InterfaceDescriptor>, TransportError> {
        let bus = self.shared.bus.lock().unwrap();
        Ok(bus
            .devices
            .iter()
            .filter(|d| d.plugged && d.acquired.is_none())
            .map(|d| d.descriptor())
            .filter(|desc| filter.matches(desc))
            .collect())
    }

    fn enumerate_acquired(&self) -> Result<Vec<InterfaceId>, TransportError> {
        let bus = self.shared.bus.lock().unwrap();
        Ok(bus
            .devices
            .iter()
            .filter(|d| d.plugged)
            .filter_map(|d| d.acquired)
            .collect())
    }

    fn acquire(&self, desc: &InterfaceDescriptor) -> Result<InterfaceSession, TransportError> {
        let mut bus = self.shared.bus.lock().unwrap();
        let id = InterfaceId(bus.next_iface_id);
        let device = bus
            .device_by_address(desc.device_address)
            .ok_or(TransportError::Disconnected)?;
        if !device.plugged {
            return Err(TransportError::Disconnected);
        }
        if device.acquired.is_some() {
            return Err(TransportError::InvalidSession);
        }
        device.acquired = Some(id);
        bus.next_iface_id += 1;
        Ok(InterfaceSession { id })
    }

    fn release_interface(&self, iface: InterfaceSession) {
        let mut bus = self.shared.bus.lock().unwrap();
        if let Some(device) = bus.device_by_iface(iface.id) {
            device.acquired = None;
            device.stats.interface_releases += 1;
        }
    }

    fn open_endpoint(
        &self,
        iface: InterfaceSession,
        desc: &EndpointDescriptor,
    ) -> Result<EndpointSession, TransportError> {
        let mut bus = self.shared.bus.lock().unwrap();
        let device = bus
            .device_by_iface(iface.id)
            .ok_or(TransportError::InvalidSession)?;
        if !device.plugged {
            return Err(TransportError::Disconnected);
        }
        match desc.address {
            MOCK_IN_EP => device.in_open = true,
            MOCK_OUT_EP => device.out_open = true,
            _ => return Err(TransportError::InvalidSession),
        }
        Ok(EndpointSession {
            interface: iface.id,
            address: desc.address,
        })
    }

    fn close_endpoint(&self, ep: EndpointSession) {
        let mut bus = self.shared.bus.lock().unwrap();
        if let Some(device) = bus.device_by_iface(ep.interface) {
            match ep.address {
                MOCK_IN_EP => {
                    device.in_open = false;
                    device.stats.in_endpoint_closes += 1;
                }
                MOCK_OUT_EP => {
                    device.out_open = false;
                    device.stats.out_endpoint_closes += 1;
                }
                _ => {}
            }
        }
    }

    fn control_transfer(
        &self,
        iface: InterfaceSession,
        req: ControlRequest,
        data: ControlData<'_>,
    ) -> Result<usize, TransportError> {
        let mut bus = self.shared.bus.lock().unwrap();
        let device = bus
            .device_by_iface(iface.id)
            .ok_or(TransportError::InvalidSession)?;
        if !device.plugged {
            return Err(TransportError::Disconnected);
        }
        device.handle_control(req, data)
    }

    fn bulk_transfer(
        &self,
        ep: EndpointSession,
        data: BulkData<'_>,
    ) -> Result<usize, TransportError> {
        let mut bus = self.shared.bus.lock().unwrap();
        let device = bus
            .device_by_iface(ep.interface)
            .ok_or(TransportError::InvalidSession)?;
        if !device.plugged {
            return Err(TransportError::Disconnected);
        }
        match data {
            BulkData::Out(buf) => {
                debug_assert_eq!(ep.address, MOCK_OUT_EP);
                if !device.out_open {
                    return Err(TransportError::InvalidSession);
                }
                device.handle_bulk_out(buf)
            }
            BulkData::In(buf) => {
                debug_assert_eq!(ep.address, MOCK_IN_EP);
                if !device.in_open {
                    return Err(TransportError::InvalidSession);
                }
                device.handle_bulk_in(buf)
            }
        }
    }

    fn register_wake(&self, wake: TransportWake) {
        let has_available = {
            let bus = self.shared.bus.lock().unwrap();
            bus.devices
                .iter()
                .any(|d| d.plugged && d.acquired.is_none() && wake.filter.matches(&d.descriptor()))
        };
        if has_available {
            wake.available.signal();
        }
        *self.shared.wake.lock().unwrap() = Some(wake);
    }
}
