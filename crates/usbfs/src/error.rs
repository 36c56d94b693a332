//! Client-visible error taxonomy.
//!
//! Codes live in one module: 8001–8003 for the drive lifecycle, 8004–8009
//! for the path family, and unmapped FAT statuses surfaced as
//! `8100 + status` so the original cause stays recoverable from logs.

use thiserror::Error;
use usbfs_fat::FatError;

/// Base for the opaque FAT status range.
const FAT_CODE_BASE: u32 = 8100;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceError {
    /// The id does not name a currently mounted drive.
    #[error("invalid drive interface id")]
    InvalidDriveInterfaceId,
    /// The id was valid at entry but the interface has since disappeared.
    #[error("drive no longer available")]
    DriveUnavailable,
    /// SCSI setup, FAT mount, or mount-slot exhaustion during mounting.
    #[error("drive initialization failed")]
    DriveInitFailure,
    #[error("path not found")]
    PathNotFound,
    #[error("path already exists")]
    PathAlreadyExists,
    #[error("invalid path")]
    InvalidPath,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation not supported by the volume")]
    UnsupportedOperation,
    #[error("not implemented")]
    NotImplemented,
    /// Unmapped FAT status, carried verbatim.
    #[error("filesystem error (fat status {0})")]
    Fat(u8),
}

impl ServiceError {
    /// Wire result code.
    pub fn code(&self) -> u32 {
        match self {
            ServiceError::InvalidDriveInterfaceId => 8001,
            ServiceError::DriveUnavailable => 8002,
            ServiceError::DriveInitFailure => 8003,
            ServiceError::PathNotFound => 8004,
            ServiceError::PathAlreadyExists => 8005,
            ServiceError::InvalidPath => 8006,
            ServiceError::InvalidArgument => 8007,
            ServiceError::UnsupportedOperation => 8008,
            ServiceError::NotImplemented => 8009,
            ServiceError::Fat(status) => FAT_CODE_BASE + *status as u32,
        }
    }
}

impl From<FatError> for ServiceError {
    fn from(err: FatError) -> Self {
        match err {
            FatError::NotFound | FatError::NoPath | FatError::InvalidName => {
                ServiceError::PathNotFound
            }
            FatError::AlreadyExists => ServiceError::PathAlreadyExists,
            FatError::InvalidDrive => ServiceError::InvalidPath,
            FatError::InvalidParameter => ServiceError::InvalidArgument,
            FatError::WriteProtected => ServiceError::UnsupportedOperation,
            FatError::NotReady => ServiceError::DriveUnavailable,
            other => ServiceError::Fat(other.raw()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_codes_are_stable() {
        assert_eq!(ServiceError::InvalidDriveInterfaceId.code(), 8001);
        assert_eq!(ServiceError::DriveUnavailable.code(), 8002);
        assert_eq!(ServiceError::DriveInitFailure.code(), 8003);
    }

    #[test]
    fn fat_statuses_map_one_for_one() {
        assert_eq!(
            ServiceError::from(FatError::NotFound),
            ServiceError::PathNotFound
        );
        assert_eq!(
            ServiceError::from(FatError::NoPath),
            ServiceError::PathNotFound
        );
        assert_eq!(
            ServiceError::from(FatError::InvalidName),
            ServiceError::PathNotFound
        );
        assert_eq!(
            ServiceError::from(FatError::AlreadyExists),
            ServiceError::PathAlreadyExists
        );
        assert_eq!(
            ServiceError::from(FatError::InvalidDrive),
            ServiceError::InvalidPath
        );
        assert_eq!(
            ServiceError::from(FatError::InvalidParameter),
            ServiceError::InvalidArgument
        );
        assert_eq!(
            ServiceError::from(FatError::WriteProtected),
            ServiceError::UnsupportedOperation
        );
    }

    #[test]
    fn unmapped_statuses_stay_recoverable() {
        let err = ServiceError::from(FatError::DiskError);
        assert_eq!(err, ServiceError::Fat(1));
        assert_eq!(err.code(), 8101);
        assert_eq!(ServiceError::from(FatError::Denied).code(), 8107);
    }
}
