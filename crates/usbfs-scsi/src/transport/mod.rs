//! Host USB transport abstraction.
//!
//! Everything above this module (the bulk-only transport, the SCSI block
//! device, the drive manager) talks to the host USB driver exclusively
//! through the [`UsbTransport`] trait:
//!
//! - [`transport::host`](crate::transport::host) backs it with libusb via
//!   `rusb` and is what the daemon runs against.
//! - [`transport::mock`](crate::transport::mock) is an in-memory scripted
//!   bus used by the test suites.
//!
//! Interface and endpoint sessions are plain ids handed out by the
//! backend. They are *not* RAII guards: closing is explicit and must
//! happen exactly once, because the drive teardown path decides whether
//! the interface acquisition survives a failed mount (see the drive
//! manager's LUN fallback).

use thiserror::Error;

use crate::transport::event::EventHandle;

pub mod event;
pub mod host;
pub mod mock;
pub mod xfer_mem;

/// bInterfaceClass for mass-storage devices.
pub const USB_CLASS_MASS_STORAGE: u8 = 0x08;
/// bInterfaceSubClass for the SCSI transparent command set.
pub const MASS_STORAGE_SCSI_COMMANDS: u8 = 0x06;
/// bInterfaceProtocol for the Bulk-Only Transport.
pub const MASS_STORAGE_BULK_ONLY: u8 = 0x50;

/// bmRequestType direction bit (device-to-host).
pub const REQUEST_DIR_IN: u8 = 0x80;
/// bmRequestType type field: standard request.
pub const REQUEST_TYPE_STANDARD: u8 = 0x00;
/// bmRequestType type field: class request.
pub const REQUEST_TYPE_CLASS: u8 = 0x20;
/// bmRequestType recipient: device.
pub const REQUEST_RECIPIENT_DEVICE: u8 = 0x00;
/// bmRequestType recipient: interface.
pub const REQUEST_RECIPIENT_INTERFACE: u8 = 0x01;
/// bmRequestType recipient: endpoint.
pub const REQUEST_RECIPIENT_ENDPOINT: u8 = 0x02;

/// Standard request codes used by this crate.
pub const REQUEST_GET_STATUS: u8 = 0x00;
pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const REQUEST_GET_CONFIGURATION: u8 = 0x08;
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_SET_INTERFACE: u8 = 0x0B;
/// wValue for CLEAR_FEATURE selecting ENDPOINT_HALT.
pub const FEATURE_ENDPOINT_HALT: u16 = 0x00;

/// Identifier the backend assigns to an acquired interface.
///
/// Stable for the lifetime of the acquisition and never reused while the
/// acquisition is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId(pub i32);

impl std::fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle for an acquired interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSession {
    pub id: InterfaceId,
}

/// Handle for an open endpoint on an acquired interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSession {
    pub interface: InterfaceId,
    /// bEndpointAddress, direction bit included.
    pub address: u8,
}

impl EndpointSession {
    pub fn is_in(&self) -> bool {
        self.address & REQUEST_DIR_IN != 0
    }
}

/// Bulk endpoint descriptor, as much of it as the upper layers need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// bEndpointAddress, direction bit included.
    pub address: u8,
    pub max_packet_size: u16,
}

/// Descriptor of a not-yet-acquired mass-storage interface.
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    /// Bus number the device sits on (backend-specific, zero on the mock).
    pub bus_number: u8,
    /// Device address on that bus; keys [`UsbTransport::acquire`].
    pub device_address: u8,
    pub interface_number: u8,
    /// bConfigurationValue of the configuration this interface belongs to.
    pub configuration_value: u8,
    /// bAlternateSetting of this interface descriptor.
    pub alternate_setting: u8,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
    /// Bulk IN endpoints, descriptor order.
    pub input_endpoints: Vec<EndpointDescriptor>,
    /// Bulk OUT endpoints, descriptor order.
    pub output_endpoints: Vec<EndpointDescriptor>,
}

/// Enumeration filter over interface class/subclass/protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceFilter {
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
}

impl InterfaceFilter {
    /// The filter every consumer of this crate actually uses: bulk-only
    /// mass storage speaking the SCSI transparent command set.
    pub fn mass_storage_bulk_only() -> Self {
        Self {
            class_code: USB_CLASS_MASS_STORAGE,
            sub_class_code: MASS_STORAGE_SCSI_COMMANDS,
            protocol_code: MASS_STORAGE_BULK_ONLY,
        }
    }

    pub fn matches(&self, desc: &InterfaceDescriptor) -> bool {
        desc.class_code == self.class_code
            && desc.sub_class_code == self.sub_class_code
            && desc.protocol_code == self.protocol_code
    }
}

/// Setup packet for a control transfer; the data stage travels separately
/// as [`ControlData`].
#[derive(Debug, Clone, Copy)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Data stage of a control transfer.
pub enum ControlData<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

/// Payload of a bulk transfer; the variant encodes the direction.
pub enum BulkData<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

impl BulkData<'_> {
    pub fn len(&self) -> usize {
        match self {
            BulkData::In(buf) => buf.len(),
            BulkData::Out(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wake sinks a backend signals on hot-plug activity.
///
/// `available` fires when an interface matching `filter` shows up (and once
/// at registration if one is already present); `state_change` fires when
/// the set of acquired interfaces changes underneath us, typically because
/// a device was yanked. `state_change` is manual-reset: the waiter clears
/// it after waking.
pub struct TransportWake {
    pub state_change: EventHandle,
    pub available: EventHandle,
    pub filter: InterfaceFilter,
}

/// Errors surfaced by a transport backend.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The endpoint returned a STALL handshake. Recoverable; the caller is
    /// expected to clear the halt.
    #[error("endpoint stalled")]
    Stall,
    /// The device is gone from the bus.
    #[error("device disconnected")]
    Disconnected,
    /// The transfer timed out.
    #[error("transfer timed out")]
    Timeout,
    /// The session id does not name a live interface or endpoint.
    #[error("no such interface or endpoint session")]
    InvalidSession,
    /// Wire-level protocol violation (bad CSW signature, tag mismatch, ...).
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Any other host-side failure.
    #[error("usb host error: {0}")]
    Host(#[from] rusb::Error),
}

/// Contract with the host USB driver.
///
/// All operations are synchronous from the caller's view. Backends must be
/// callable from multiple threads; serialization of bulk traffic per
/// endpoint pair is the *caller's* job (the drive layer does it with its
/// filesystem lock).
pub trait UsbTransport: Send + Sync {
    /// List interfaces matching `filter` that are plugged in and not
    /// currently acquired.
    fn enumerate_available(
        &self,
        filter: &InterfaceFilter,
    ) -> Result<Vec<InterfaceDescriptor>, TransportError>;

    /// List the ids of interfaces this transport has acquired and whose
    /// devices are still present on the bus.
    fn enumerate_acquired(&self) -> Result<Vec<InterfaceId>, TransportError>;

    fn acquire(&self, desc: &InterfaceDescriptor) -> Result<InterfaceSession, TransportError>;

    /// Release an acquired interface. Must be called exactly once per
    /// successful [`acquire`](Self::acquire).
    fn release_interface(&self, iface: InterfaceSession);

    fn open_endpoint(
        &self,
        iface: InterfaceSession,
        desc: &EndpointDescriptor,
    ) -> Result<EndpointSession, TransportError>;

    /// Close an open endpoint. Must be called exactly once per successful
    /// [`open_endpoint`](Self::open_endpoint).
    fn close_endpoint(&self, ep: EndpointSession);

    /// Issue a control transfer on the interface's default pipe. Returns
    /// the number of data-stage bytes transferred.
    fn control_transfer(
        &self,
        iface: InterfaceSession,
        req: ControlRequest,
        data: ControlData<'_>,
    ) -> Result<usize, TransportError>;

    /// Issue a bulk transfer. Returns the number of bytes transferred. On
    /// failure the endpoint may be halted; the caller decides whether to
    /// clear it.
    fn bulk_transfer(&self, ep: EndpointSession, data: BulkData<'_>)
    -> Result<usize, TransportError>;

    /// Install the hot-plug wake sinks. Replaces any previous registration.
    fn register_wake(&self, wake: TransportWake);
}
