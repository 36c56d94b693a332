//! libusb backend for [`UsbTransport`].
//!
//! Acquiring an interface opens the device, enables kernel-driver
//! auto-detach and claims the interface. Hot-plug wakes are produced by a
//! background poll thread comparing bus snapshots, since libusb hot-plug
//! callbacks are not available on every platform.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext, TransferType};

use super::{
    BulkData, ControlData, ControlRequest, EndpointDescriptor, EndpointSession,
    InterfaceDescriptor, InterfaceFilter, InterfaceId, InterfaceSession, REQUEST_DIR_IN,
    TransportError, TransportWake, UsbTransport,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

struct AcquiredInterface {
    handle: Arc<DeviceHandle<GlobalContext>>,
    bus_number: u8,
    device_address: u8,
    interface_number: u8,
    open_endpoints: Vec<u8>,
}

struct HostState {
    next_id: i32,
    interfaces: HashMap<InterfaceId, AcquiredInterface>,
}

struct Poller {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// [`UsbTransport`] over libusb (`rusb`, global context).
pub struct RusbTransport {
    state: Mutex<HostState>,
    timeout: Duration,
    poll_interval: Duration,
    poller: Mutex<Option<Poller>>,
}

impl RusbTransport {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(HostState {
                next_id: 1,
                interfaces: HashMap::new(),
            }),
            timeout: DEFAULT_TIMEOUT,
            poll_interval,
            poller: Mutex::new(None),
        }
    }

    fn map_err(err: rusb::Error) -> TransportError {
        match err {
            rusb::Error::Pipe => TransportError::Stall,
            rusb::Error::NoDevice | rusb::Error::NotFound => TransportError::Disconnected,
            rusb::Error::Timeout => TransportError::Timeout,
            other => TransportError::Host(other),
        }
    }

    fn device_present(bus_number: u8, device_address: u8) -> bool {
        let Ok(devices) = rusb::devices() else {
            return false;
        };
        devices
            .iter()
            .any(|d| d.bus_number() == bus_number && d.address() == device_address)
    }

    /// Snapshot of matching, unacquired interfaces on the bus. Also used by
    /// the poll thread, which passes the acquired-location set explicitly.
    fn scan_available(
        filter: &InterfaceFilter,
        acquired_locations: &[(u8, u8, u8)],
    ) -> Result<Vec<InterfaceDescriptor>, TransportError> {
        let mut found = Vec::new();
        let devices = rusb::devices().map_err(Self::map_err)?;

        for device in devices.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };

            for cfg_idx in 0..desc.num_configurations() {
                let Ok(config) = device.config_descriptor(cfg_idx) else {
                    continue;
                };

                for interface in config.interfaces() {
                    for interface_desc in interface.descriptors() {
                        if interface_desc.class_code() != filter.class_code
                            || interface_desc.sub_class_code() != filter.sub_class_code
                            || interface_desc.protocol_code() != filter.protocol_code
                        {
                            continue;
                        }

                        let location = (
                            device.bus_number(),
                            device.address(),
                            interface_desc.interface_number(),
                        );
                        if acquired_locations.contains(&location) {
                            continue;
                        }

                        let mut input_endpoints = Vec::new();
                        let mut output_endpoints = Vec::new();
                        for endpoint in interface_desc.endpoint_descriptors() {
                            if endpoint.transfer_type() != TransferType::Bulk {
                                continue;
                            }
                            let ep = EndpointDescriptor {
                                address: endpoint.address(),
                                max_packet_size: endpoint.max_packet_size(),
                            };
                            match endpoint.direction() {
                                rusb::Direction::In => input_endpoints.push(ep),
                                rusb::Direction::Out => output_endpoints.push(ep),
                            }
                        }

                        found.push(InterfaceDescriptor {
                            bus_number: device.bus_number(),
                            device_address: device.address(),
                            interface_number: interface_desc.interface_number(),
                            configuration_value: config.number(),
                            alternate_setting: interface_desc.setting_number(),
                            class_code: interface_desc.class_code(),
                            sub_class_code: interface_desc.sub_class_code(),
                            protocol_code: interface_desc.protocol_code(),
                            input_endpoints,
                            output_endpoints,
                        });
                    }
                }
            }
        }

        Ok(found)
    }

    fn acquired_locations(&self) -> Vec<(u8, u8, u8)> {
        self.state
            .lock()
            .unwrap()
            .interfaces
            .values()
            .map(|i| (i.bus_number, i.device_address, i.interface_number))
            .collect()
    }
}

impl Default for RusbTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for RusbTransport {
    fn enumerate_available(
        &self,
        filter: &InterfaceFilter,
    ) -> Result<Vec<InterfaceDescriptor>, TransportError> {
        Self::scan_available(filter, &self.acquired_locations())
    }

    fn enumerate_acquired(&self) -> Result<Vec<InterfaceId>, TransportError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .interfaces
            .iter()
            .filter(|(_, iface)| Self::device_present(iface.bus_number, iface.device_address))
            .map(|(&id, _)| id)
            .collect())
    }

    fn acquire(&self, desc: &InterfaceDescriptor) -> Result<InterfaceSession, TransportError> {
        let devices = rusb::devices().map_err(Self::map_err)?;
        let device = devices
            .iter()
            .find(|d| d.bus_number() == desc.bus_number && d.address() == desc.device_address)
            .ok_or(TransportError::Disconnected)?;

        let handle = device.open().map_err(|err| {
            if err == rusb::Error::Access {
                log::error!("insufficient permissions to open usb device");
            }
            Self::map_err(err)
        })?;

        handle.set_auto_detach_kernel_driver(true).ok();
        handle
            .set_active_configuration(desc.configuration_value)
            .ok();

        if let Err(err) = handle.claim_interface(desc.interface_number) {
            if err == rusb::Error::NotSupported {
                log::error!(
                    "interface not supported on device; on Windows a libusb-compatible driver (e.g. via Zadig) is likely required"
                );
            }
            return Err(Self::map_err(err));
        }

        let mut state = self.state.lock().unwrap();
        let id = InterfaceId(state.next_id);
        state.next_id += 1;
        state.interfaces.insert(
            id,
            AcquiredInterface {
                handle: Arc::new(handle),
                bus_number: desc.bus_number,
                device_address: desc.device_address,
                interface_number: desc.interface_number,
                open_endpoints: Vec::new(),
            },
        );

        log::debug!(
            "acquired interface {} (bus {:03} addr {:03} if {})",
            id,
            desc.bus_number,
            desc.device_address,
            desc.interface_number
        );
        Ok(InterfaceSession { id })
    }

    fn release_interface(&self, iface: InterfaceSession) {
        let mut state = self.state.lock().unwrap();
        if let Some(acquired) = state.interfaces.remove(&iface.id) {
            acquired
                .handle
                .release_interface(acquired.interface_number)
                .ok();
            log::debug!("released interface {}", iface.id);
        } else {
            log::warn!("release of unknown interface {}", iface.id);
        }
    }

    fn open_endpoint(
        &self,
        iface: InterfaceSession,
        desc: &EndpointDescriptor,
    ) -> Result<EndpointSession, TransportError> {
        let mut state = self.state.lock().unwrap();
        let acquired = state
            .interfaces
            .get_mut(&iface.id)
            .ok_or(TransportError::InvalidSession)?;
        acquired.open_endpoints.push(desc.address);
        Ok(EndpointSession {
            interface: iface.id,
            address: desc.address,
        })
    }

    fn close_endpoint(&self, ep: EndpointSession) {
        let mut state = self.state.lock().unwrap();
        if let Some(acquired) = state.interfaces.get_mut(&ep.interface)
            && let Some(pos) = acquired.open_endpoints.iter().position(|&a| a == ep.address)
        {
            acquired.open_endpoints.remove(pos);
        }
    }

    fn control_transfer(
        &self,
        iface: InterfaceSession,
        req: ControlRequest,
        data: ControlData<'_>,
    ) -> Result<usize, TransportError> {
        let handle = {
            let state = self.state.lock().unwrap();
            state
                .interfaces
                .get(&iface.id)
                .ok_or(TransportError::InvalidSession)?
                .handle
                .clone()
        };

        let result = match data {
            ControlData::In(buf) => handle.read_control(
                req.request_type,
                req.request,
                req.value,
                req.index,
                buf,
                self.timeout,
            ),
            ControlData::Out(buf) => handle.write_control(
                req.request_type,
                req.request,
                req.value,
                req.index,
                buf,
                self.timeout,
            ),
            ControlData::None => {
                debug_assert_eq!(req.request_type & REQUEST_DIR_IN, 0);
                handle.write_control(
                    req.request_type,
                    req.request,
                    req.value,
                    req.index,
                    &[],
                    self.timeout,
                )
            }
        };

        result.map_err(Self::map_err)
    }

    fn bulk_transfer(
        &self,
        ep: EndpointSession,
        data: BulkData<'_>,
    ) -> Result<usize, TransportError> {
        let handle = {
            let state = self.state.lock().unwrap();
            state
                .interfaces
                .get(&ep.interface)
                .ok_or(TransportError::InvalidSession)?
                .handle
                .clone()
        };

        let result = match data {
            BulkData::In(buf) => handle.read_bulk(ep.address, buf, self.timeout),
            BulkData::Out(buf) => handle.write_bulk(ep.address, buf, self.timeout),
        };

        result.map_err(Self::map_err)
    }

    fn register_wake(&self, wake: TransportWake) {
        let mut poller = self.poller.lock().unwrap();
        if let Some(old) = poller.take() {
            old.stop.store(true, Ordering::Relaxed);
            old.thread.join().ok();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let interval = self.poll_interval;
        let thread_stop = stop.clone();

        // The poller only needs bus snapshots, not our session table:
        // anything we have acquired is invisible to other hosts anyway and
        // is excluded by location when it matters.
        let thread = std::thread::Builder::new()
            .name("usbfs-hotplug".into())
            .spawn(move || {
                let mut last_seen: Vec<(u8, u8)> = Vec::new();
                let mut first = true;
                while !thread_stop.load(Ordering::Relaxed) {
                    let seen: Vec<(u8, u8)> = Self::scan_available(&wake.filter, &[])
                        .unwrap_or_default()
                        .iter()
                        .map(|d| (d.bus_number, d.device_address))
                        .collect();

                    let arrivals = seen.iter().any(|loc| !last_seen.contains(loc));
                    let departures = last_seen.iter().any(|loc| !seen.contains(loc));

                    if departures {
                        wake.state_change.signal();
                    }
                    // Signal once at startup if something is already there,
                    // matching the create-event-then-signal host behavior.
                    if arrivals || (first && !seen.is_empty()) {
                        wake.available.signal();
                    }

                    last_seen = seen;
                    first = false;
                    std::thread::sleep(interval);
                }
            })
            .expect("spawning hot-plug poll thread");

        *poller = Some(Poller { stop, thread });
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.lock().unwrap().take() {
            poller.stop.store(true, Ordering::Relaxed);
            poller.thread.join().ok();
        }
    }
}
