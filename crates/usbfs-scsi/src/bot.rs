//! USB Mass Storage Bulk-Only Transport (BOT).
//!
//! Frames SCSI command blocks into CBW/CSW exchanges over a bulk endpoint
//! pair and recovers from protocol stalls. One [`BulkOnlyTransport`] is
//! bound to a single acquired interface and its endpoint pair; callers
//! must serialize transactions per endpoint pair (the drive layer does so
//! with its filesystem lock).

use std::sync::Arc;

use crate::commands::CommandBlock;
use crate::commands::cbw::{CBW_LEN, CSW_LEN, Cbw, Csw, CswStatus, Direction};
use crate::transport::xfer_mem::XferBuf;
use crate::transport::{
    BulkData, ControlData, ControlRequest, EndpointSession, FEATURE_ENDPOINT_HALT, InterfaceSession,
    REQUEST_CLEAR_FEATURE, REQUEST_DIR_IN, REQUEST_GET_CONFIGURATION, REQUEST_GET_STATUS,
    REQUEST_RECIPIENT_DEVICE, REQUEST_RECIPIENT_ENDPOINT, REQUEST_RECIPIENT_INTERFACE,
    REQUEST_SET_CONFIGURATION, REQUEST_SET_INTERFACE, REQUEST_TYPE_CLASS, REQUEST_TYPE_STANDARD,
    TransportError, UsbTransport,
};

/// Class-specific request: Bulk-Only Mass Storage Reset.
pub const REQUEST_BULK_ONLY_RESET: u8 = 0xFF;
/// Class-specific request: Get Max LUN.
pub const REQUEST_GET_MAX_LUN: u8 = 0xFE;
/// Highest LUN count a bulk-only device can report.
pub const USB_MAX_LUN: u8 = 16;

/// Data phase of a BOT transaction; the variant encodes the direction.
pub enum BotData<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

impl BotData<'_> {
    fn len(&self) -> usize {
        match self {
            BotData::None => 0,
            BotData::In(buf) => buf.len(),
            BotData::Out(buf) => buf.len(),
        }
    }

    fn direction(&self) -> Direction {
        match self {
            BotData::In(_) => Direction::In,
            BotData::None | BotData::Out(_) => Direction::Out,
        }
    }
}

/// Bulk-Only Transport over one interface's endpoint pair.
pub struct BulkOnlyTransport {
    transport: Arc<dyn UsbTransport>,
    iface: InterfaceSession,
    in_ep: EndpointSession,
    out_ep: EndpointSession,
    interface_number: u8,
    next_tag: u32,
}

impl BulkOnlyTransport {
    pub fn new(
        transport: Arc<dyn UsbTransport>,
        iface: InterfaceSession,
        interface_number: u8,
        in_ep: EndpointSession,
        out_ep: EndpointSession,
    ) -> Self {
        Self {
            transport,
            iface,
            in_ep,
            out_ep,
            interface_number,
            next_tag: 1,
        }
    }

    pub fn interface(&self) -> InterfaceSession {
        self.iface
    }

    pub fn endpoints(&self) -> (EndpointSession, EndpointSession) {
        (self.in_ep, self.out_ep)
    }

    /// Perform the `Get Max LUN` class request, returning the number of
    /// logical units on the interface.
    ///
    /// Devices with a single LUN frequently STALL this request or answer
    /// with the wrong length; both cases are reported as one LUN.
    pub fn get_max_lun(&self) -> u8 {
        let mut buf = XferBuf::new(1);
        let req = ControlRequest {
            request_type: REQUEST_DIR_IN | REQUEST_TYPE_CLASS | REQUEST_RECIPIENT_INTERFACE,
            request: REQUEST_GET_MAX_LUN,
            value: 0,
            index: self.interface_number as u16,
        };

        match self
            .transport
            .control_transfer(self.iface, req, ControlData::In(&mut buf[..1]))
        {
            Ok(1) if buf[0] < USB_MAX_LUN => buf[0] + 1,
            Ok(_) => 1,
            Err(_) => 1,
        }
    }

    /// Bulk-Only Mass Storage Reset followed by halt clearing on both
    /// endpoints (IN first). Required after a phase error and after
    /// changing the device configuration or alternate setting.
    pub fn reset_recovery(&self) -> Result<(), TransportError> {
        log::debug!("interface {}: bulk-only reset recovery", self.iface.id);

        let req = ControlRequest {
            request_type: REQUEST_TYPE_CLASS | REQUEST_RECIPIENT_INTERFACE,
            request: REQUEST_BULK_ONLY_RESET,
            value: 0,
            index: self.interface_number as u16,
        };
        self.transport
            .control_transfer(self.iface, req, ControlData::None)?;

        self.clear_halt(self.in_ep).ok();
        self.clear_halt(self.out_ep).ok();

        Ok(())
    }

    /// Clear an endpoint halt, but only if the endpoint actually reports
    /// the `Halted` status bit.
    pub fn clear_halt(&self, ep: EndpointSession) -> Result<(), TransportError> {
        if !self.endpoint_halted(ep) {
            return Ok(());
        }

        let req = ControlRequest {
            request_type: REQUEST_TYPE_STANDARD | REQUEST_RECIPIENT_ENDPOINT,
            request: REQUEST_CLEAR_FEATURE,
            value: FEATURE_ENDPOINT_HALT,
            index: ep.address as u16,
        };
        self.transport
            .control_transfer(self.iface, req, ControlData::None)?;

        log::debug!(
            "interface {}: cleared halt on endpoint {:#04x}",
            self.iface.id,
            ep.address
        );
        Ok(())
    }

    fn endpoint_halted(&self, ep: EndpointSession) -> bool {
        let mut status = XferBuf::new(1);
        let req = ControlRequest {
            request_type: REQUEST_DIR_IN | REQUEST_TYPE_STANDARD | REQUEST_RECIPIENT_ENDPOINT,
            request: REQUEST_GET_STATUS,
            value: 0,
            index: ep.address as u16,
        };

        match self
            .transport
            .control_transfer(self.iface, req, ControlData::In(&mut status[..2]))
        {
            Ok(2) => status[0] & 0x01 != 0,
            _ => false,
        }
    }

    /// Execute one BOT transaction: CBW, optional data phase, CSW.
    ///
    /// Transport-level trouble is recovered locally as far as the
    /// protocol allows: a stalled data phase gets its endpoint halt
    /// cleared and the status is still collected; a failed CSW read is
    /// retried once after clearing the IN halt; a second failure or a
    /// phase error triggers a full reset recovery.
    pub fn transact(
        &mut self,
        lun: u8,
        cmd: &impl CommandBlock,
        data: BotData<'_>,
    ) -> Result<CswStatus, TransportError> {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        let direction = data.direction();

        // 1. Command phase.
        let cbw = Cbw::new(tag, data.len() as u32, direction, lun, cmd);
        let wire = cbw.to_bytes();
        match self
            .transport
            .bulk_transfer(self.out_ep, BulkData::Out(&wire))
        {
            Ok(CBW_LEN) => {}
            Ok(_) => {
                self.reset_recovery().ok();
                return Err(TransportError::Protocol("short CBW write"));
            }
            Err(err) => {
                self.clear_halt(self.out_ep).ok();
                return Err(err);
            }
        }

        // 2. Data phase. A stall here is not fatal; the device still owes
        // us a CSW saying what it thinks happened.
        let data_result = match data {
            BotData::None => Ok(0),
            BotData::In(buf) => self.transport.bulk_transfer(self.in_ep, BulkData::In(buf)),
            BotData::Out(buf) => self.transport.bulk_transfer(self.out_ep, BulkData::Out(buf)),
        };
        if let Err(err) = data_result {
            let ep = match direction {
                Direction::In => self.in_ep,
                Direction::Out => self.out_ep,
            };
            log::debug!(
                "interface {}: data phase failed ({err}), clearing endpoint {:#04x}",
                self.iface.id,
                ep.address
            );
            self.clear_halt(ep).ok();
            if matches!(err, TransportError::Disconnected) {
                return Err(err);
            }
        }

        // 3. Status phase, one retry after clearing the IN halt.
        let csw = match self.read_csw() {
            Ok(csw) => csw,
            Err(first) => {
                log::debug!(
                    "interface {}: CSW read failed ({first}), retrying once",
                    self.iface.id
                );
                self.clear_halt(self.in_ep).ok();
                match self.read_csw() {
                    Ok(csw) => csw,
                    Err(err) => {
                        self.reset_recovery().ok();
                        return Err(err);
                    }
                }
            }
        };

        // 4. Validate and map.
        let csw = match Csw::parse(&csw, tag) {
            Ok(csw) => csw,
            Err(err) => {
                self.reset_recovery().ok();
                return Err(err);
            }
        };

        if csw.status == CswStatus::PhaseError {
            self.reset_recovery().ok();
        }

        Ok(csw.status)
    }

    fn read_csw(&self) -> Result<[u8; CSW_LEN], TransportError> {
        let mut buf = [0u8; CSW_LEN];
        let n = self
            .transport
            .bulk_transfer(self.in_ep, BulkData::In(&mut buf))?;
        if n != CSW_LEN {
            return Err(TransportError::Protocol("short CSW read"));
        }
        Ok(buf)
    }
}

/// `GET_CONFIGURATION` standard device request. A failure reads as
/// configuration 0, which callers treat as "needs configuring".
pub fn get_configuration(transport: &dyn UsbTransport, iface: InterfaceSession) -> u8 {
    let mut buf = XferBuf::new(1);
    let req = ControlRequest {
        request_type: REQUEST_DIR_IN | REQUEST_TYPE_STANDARD | REQUEST_RECIPIENT_DEVICE,
        request: REQUEST_GET_CONFIGURATION,
        value: 0,
        index: 0,
    };

    match transport.control_transfer(iface, req, ControlData::In(&mut buf[..1])) {
        Ok(1) => buf[0],
        _ => 0,
    }
}

/// `SET_CONFIGURATION` standard device request.
pub fn set_configuration(
    transport: &dyn UsbTransport,
    iface: InterfaceSession,
    configuration: u8,
) -> Result<(), TransportError> {
    let req = ControlRequest {
        request_type: REQUEST_TYPE_STANDARD | REQUEST_RECIPIENT_DEVICE,
        request: REQUEST_SET_CONFIGURATION,
        value: configuration as u16,
        index: 0,
    };
    transport
        .control_transfer(iface, req, ControlData::None)
        .map(|_| ())
}

/// `SET_INTERFACE` standard interface request (alternate setting select).
pub fn set_interface(
    transport: &dyn UsbTransport,
    iface: InterfaceSession,
    interface_number: u8,
    alternate_setting: u8,
) -> Result<(), TransportError> {
    let req = ControlRequest {
        request_type: REQUEST_TYPE_STANDARD | REQUEST_RECIPIENT_INTERFACE,
        request: REQUEST_SET_INTERFACE,
        value: alternate_setting as u16,
        index: interface_number as u16,
    };
    transport
        .control_transfer(iface, req, ControlData::None)
        .map(|_| ())
}
