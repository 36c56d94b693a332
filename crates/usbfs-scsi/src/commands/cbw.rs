use crate::commands::CommandBlock;
use crate::transport::TransportError;

/// Magic signature identifying a valid CBW (`'USBC'` little-endian).
pub const CBW_SIGNATURE: u32 = 0x43425355;
/// Magic signature identifying a valid CSW (`'USBS'` little-endian).
pub const CSW_SIGNATURE: u32 = 0x53425355;

/// Wire size of a Command Block Wrapper.
pub const CBW_LEN: usize = 31;
/// Wire size of a Command Status Wrapper.
pub const CSW_LEN: usize = 13;

/// USB Mass Storage Bulk-Only Transport **Command Block Wrapper (CBW)**.
///
/// A CBW is a 31-byte structure sent from host to device over the
/// bulk-OUT endpoint. It wraps a SCSI command descriptor block (CDB)
/// together with transfer length, data direction, target LUN, and a
/// host-supplied tag the device echoes back in the status wrapper.
#[allow(non_snake_case)]
pub struct Cbw {
    /// Must always be `0x43425355` (`'USBC'`).
    pub dCBWSignature: u32,
    /// Host-assigned tag echoed back in CSW (status).
    pub dCBWTag: u32,
    /// Number of data bytes expected in the data phase.
    pub dCBWDataTransferLength: u32,
    /// Direction flag: `0x80` = IN (device→host), `0x00` = OUT (host→device).
    pub bmCBWFlags: u8,
    /// Logical Unit Number the command addresses.
    pub bCBWLUN: u8,
    /// Length of the command block in bytes (1–16).
    pub bCBWCBLength: u8,
    /// Command Block (SCSI CDB), zero-padded to 16 bytes.
    pub CBWCB: [u8; 16],
}

/// Direction of data phase for a CBW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device → Host transfer (e.g. READ).
    In,
    /// Host → Device transfer (e.g. WRITE).
    Out,
}

impl Cbw {
    /// Construct a new CBW for a given SCSI command.
    ///
    /// - `tag`: host-assigned identifier, echoed in the CSW.
    /// - `data_len`: number of bytes expected in the data phase.
    /// - `direction`: transfer direction.
    /// - `lun`: target logical unit.
    /// - `cmd`: the SCSI command implementing [`CommandBlock`].
    pub fn new<T: CommandBlock>(
        tag: u32,
        data_len: u32,
        direction: Direction,
        lun: u8,
        cmd: &T,
    ) -> Self {
        let cmd_bytes = cmd.to_bytes();
        let cmd_len = cmd.len();
        assert!(
            (1..=16).contains(&cmd_len),
            "command block length out of range"
        );

        Self {
            dCBWSignature: CBW_SIGNATURE,
            dCBWTag: tag,
            dCBWDataTransferLength: data_len,
            bmCBWFlags: match direction {
                Direction::In => 0x80,
                Direction::Out => 0x00,
            },
            bCBWLUN: lun,
            bCBWCBLength: cmd_len,
            CBWCB: cmd_bytes,
        }
    }

    /// Serialize into exactly 31 bytes (the CBW wire format).
    ///
    /// This buffer is sent over the bulk-OUT endpoint prior to any data
    /// or status stage.
    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut buf = [0u8; CBW_LEN];

        buf[0..4].copy_from_slice(&self.dCBWSignature.to_le_bytes());
        buf[4..8].copy_from_slice(&self.dCBWTag.to_le_bytes());
        buf[8..12].copy_from_slice(&self.dCBWDataTransferLength.to_le_bytes());
        buf[12] = self.bmCBWFlags;
        buf[13] = self.bCBWLUN;
        buf[14] = self.bCBWCBLength;
        buf[15..31].copy_from_slice(&self.CBWCB);

        buf
    }
}

/// Command outcome reported by a CSW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CswStatus {
    /// `bCSWStatus` 0x00: command completed successfully.
    Passed,
    /// `bCSWStatus` 0x01: command failed; sense data describes why.
    Failed,
    /// `bCSWStatus` 0x02: host/device disagree about the transfer; a
    /// reset recovery is required before further traffic.
    PhaseError,
}

/// USB Mass Storage Bulk-Only Transport **Command Status Wrapper (CSW)**.
///
/// 13 bytes read from the bulk-IN endpoint after the (optional) data
/// phase. The signature and echoed tag authenticate it as the status for
/// the CBW the host just sent.
#[derive(Debug, Clone, Copy)]
pub struct Csw {
    pub tag: u32,
    /// Difference between requested and actually processed data bytes.
    pub data_residue: u32,
    pub status: CswStatus,
}

impl Csw {
    /// Parse and validate a wire CSW against the tag of the CBW it answers.
    pub fn parse(buf: &[u8; CSW_LEN], expected_tag: u32) -> Result<Self, TransportError> {
        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if signature != CSW_SIGNATURE {
            return Err(TransportError::Protocol("bad CSW signature"));
        }

        let tag = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if tag != expected_tag {
            return Err(TransportError::Protocol("CSW tag mismatch"));
        }

        let data_residue = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let status = match buf[12] {
            0x00 => CswStatus::Passed,
            0x01 => CswStatus::Failed,
            0x02 => CswStatus::PhaseError,
            _ => return Err(TransportError::Protocol("unknown CSW status")),
        };

        Ok(Self {
            tag,
            data_residue,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::read10::Read10Command;

    #[test]
    fn cbw_wire_layout() {
        let cmd = Read10Command::new(0, 0x11223344, 8);
        let cbw = Cbw::new(0xDEADBEEF, 4096, Direction::In, 2, &cmd);
        let bytes = cbw.to_bytes();

        assert_eq!(&bytes[0..4], &CBW_SIGNATURE.to_le_bytes());
        assert_eq!(&bytes[4..8], &0xDEADBEEFu32.to_le_bytes());
        assert_eq!(&bytes[8..12], &4096u32.to_le_bytes());
        assert_eq!(bytes[12], 0x80);
        assert_eq!(bytes[13], 2);
        assert_eq!(bytes[14], 10);
        assert_eq!(bytes[15], 0x28);
    }

    #[test]
    fn csw_roundtrip() {
        let mut wire = [0u8; CSW_LEN];
        wire[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        wire[4..8].copy_from_slice(&7u32.to_le_bytes());
        wire[8..12].copy_from_slice(&512u32.to_le_bytes());
        wire[12] = 0x01;

        let csw = Csw::parse(&wire, 7).unwrap();
        assert_eq!(csw.tag, 7);
        assert_eq!(csw.data_residue, 512);
        assert_eq!(csw.status, CswStatus::Failed);
    }

    #[test]
    fn csw_rejects_bad_signature_and_tag() {
        let mut wire = [0u8; CSW_LEN];
        wire[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        wire[4..8].copy_from_slice(&7u32.to_le_bytes());

        assert!(matches!(
            Csw::parse(&wire, 8),
            Err(TransportError::Protocol("CSW tag mismatch"))
        ));

        wire[0] = 0;
        assert!(matches!(
            Csw::parse(&wire, 7),
            Err(TransportError::Protocol("bad CSW signature"))
        ));
    }
}
