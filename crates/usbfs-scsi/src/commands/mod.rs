//! SCSI Command Blocks (CDBs).
//!
//! One submodule per command of the transparent command set subset this
//! crate speaks (INQUIRY, TEST UNIT READY, READ CAPACITY(10/16), READ(10),
//! WRITE(10)). All implement the [`CommandBlock`] trait and are framed into
//! Bulk-Only Transport wrappers by [`cbw`].

pub mod cbw;
pub mod inquiry;
pub mod read_capacity;
pub mod read10;
pub mod test_unit_ready;
pub mod write10;

/// Trait for any SCSI Command Block (CDB).
///
/// A `CommandBlock` encapsulates the fixed 16-byte array that represents a
/// SCSI command. All commands must specify their encoded bytes and
/// effective length (which may be shorter than 16).
pub trait CommandBlock {
    /// Return the command descriptor block (CDB) as a fixed 16-byte array.
    ///
    /// Unused trailing bytes should be zeroed.
    fn to_bytes(&self) -> [u8; 16];

    /// Return the effective length of the command (number of meaningful
    /// bytes in the CDB).
    fn len(&self) -> u8;
}
