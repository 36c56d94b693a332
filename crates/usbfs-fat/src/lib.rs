#![doc = include_str!("../README.md")]

use thiserror::Error;

pub mod slots;
pub mod volume;

pub use slots::{SlotIo, SlotTable};
pub use volume::{FatfsMounter, FatfsVolume};

/// Maximum number of simultaneously mounted volumes (the FAT layer's
/// volume capacity); also the size of the mount-slot table.
pub const MAX_VOLUMES: usize = 10;

/// Volume labels are at most 11 characters on FAT.
pub const MAX_LABEL_LEN: usize = 11;

/// Format the mount name for a slot: `"<slot>:"`.
pub fn format_mount_name(slot: usize) -> String {
    format!("{slot}:")
}

/// Split a mount-prefixed path (`"3:/dir/file"`) into its slot and the
/// volume-local remainder (`"/dir/file"`).
pub fn split_mount_path(path: &str) -> Result<(usize, &str), FatError> {
    let (digits, rest) = path.split_once(':').ok_or(FatError::InvalidDrive)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FatError::InvalidDrive);
    }
    let slot: usize = digits.parse().map_err(|_| FatError::InvalidDrive)?;
    if slot >= MAX_VOLUMES {
        return Err(FatError::InvalidDrive);
    }
    Ok((slot, rest))
}

/// Filesystem variant of a mounted volume, using the FAT layer's
/// traditional `fs_type` byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FsType {
    Unknown = 0,
    Fat12 = 1,
    Fat16 = 2,
    Fat32 = 3,
    ExFat = 4,
}

impl FsType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Result of a path lookup.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub kind: EntryKind,
    pub size: u64,
    /// Modification time as POSIX seconds. FAT stores no creation or
    /// access times, and no timestamp at all for the root directory.
    pub modified_unix: u64,
}

/// One entry of a directory listing.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// Errors of the FAT layer, mirroring the traditional FAT status set so
/// unmapped statuses stay numerically recoverable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatError {
    #[error("low-level disk error")]
    DiskError,
    #[error("internal filesystem error")]
    InternalError,
    #[error("drive not ready")]
    NotReady,
    #[error("no such file")]
    NotFound,
    #[error("no such path")]
    NoPath,
    #[error("invalid path name")]
    InvalidName,
    #[error("access denied")]
    Denied,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("invalid object")]
    InvalidObject,
    #[error("volume is write protected")]
    WriteProtected,
    #[error("invalid drive prefix")]
    InvalidDrive,
    #[error("volume not enabled")]
    NotEnabled,
    #[error("no FAT filesystem found")]
    NoFilesystem,
    #[error("operation timed out")]
    Timeout,
    #[error("object locked")]
    Locked,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("invalid parameter")]
    InvalidParameter,
}

impl FatError {
    /// Numeric status in the traditional FAT layer numbering; used to
    /// surface unmapped statuses as offset opaque codes.
    pub fn raw(&self) -> u8 {
        match self {
            FatError::DiskError => 1,
            FatError::InternalError => 2,
            FatError::NotReady => 3,
            FatError::NotFound => 4,
            FatError::NoPath => 5,
            FatError::InvalidName => 6,
            FatError::Denied => 7,
            FatError::AlreadyExists => 8,
            FatError::InvalidObject => 9,
            FatError::WriteProtected => 10,
            FatError::InvalidDrive => 11,
            FatError::NotEnabled => 12,
            FatError::NoFilesystem => 13,
            FatError::Timeout => 15,
            FatError::Locked => 16,
            FatError::TooManyOpenFiles => 18,
            FatError::InvalidParameter => 19,
        }
    }
}

/// A mounted FAT volume.
///
/// All path arguments carry the mount-name prefix of the volume's slot
/// (`"<slot>:/dir/file"`); a mismatched prefix is an
/// [`InvalidDrive`](FatError::InvalidDrive) error. Implementations are
/// not required to be reentrant; callers serialize access per volume.
pub trait FatVolume: Send {
    fn fs_type(&self) -> FsType;

    /// Current volume label, trimmed.
    fn label(&mut self) -> Result<String, FatError>;

    /// Set or clear the volume label. `spec` is `"<slot>:LABEL"`; a bare
    /// `"<slot>:"` clears the label.
    fn set_label(&mut self, spec: &str) -> Result<(), FatError>;

    /// Create a new file of the given size (zero-filled). Fails with
    /// [`AlreadyExists`](FatError::AlreadyExists) if the path is taken.
    fn create_file(&mut self, path: &str, size: u64) -> Result<(), FatError>;

    fn remove_file(&mut self, path: &str) -> Result<(), FatError>;

    fn create_dir(&mut self, path: &str) -> Result<(), FatError>;

    /// Remove an empty directory.
    fn remove_dir(&mut self, path: &str) -> Result<(), FatError>;

    /// Rename or move a file or directory.
    fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), FatError>;

    fn stat(&mut self, path: &str) -> Result<Metadata, FatError>;

    /// List a directory, dot entries excluded.
    fn read_dir(&mut self, path: &str) -> Result<Vec<EntryInfo>, FatError>;

    /// Read up to `buf.len()` bytes at `offset`; short reads past the end
    /// of file are not an error.
    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FatError>;

    /// Write at `offset` (or at end-of-file when `append`), zero-filling
    /// any gap between the current end and `offset`.
    fn write_at(
        &mut self,
        path: &str,
        offset: u64,
        data: &[u8],
        append: bool,
    ) -> Result<usize, FatError>;

    /// Resize a file: truncates on shrink, zero-extends on growth.
    fn set_len(&mut self, path: &str, size: u64) -> Result<(), FatError>;

    /// Free space in bytes.
    fn free_space(&mut self) -> Result<u64, FatError>;

    /// Total data space in bytes.
    fn total_space(&mut self) -> Result<u64, FatError>;
}

/// Mounts volumes for the drive layer; swapped out in tests.
pub trait VolumeMounter: Send + Sync {
    fn mount(&self, slot: usize) -> Result<Box<dyn FatVolume>, FatError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_name_formatting() {
        assert_eq!(format_mount_name(0), "0:");
        assert_eq!(format_mount_name(7), "7:");
    }

    #[test]
    fn split_mount_path_accepts_prefixed_paths() {
        assert_eq!(split_mount_path("0:/a/b").unwrap(), (0, "/a/b"));
        assert_eq!(split_mount_path("9:").unwrap(), (9, ""));
        assert_eq!(split_mount_path("3:LABEL").unwrap(), (3, "LABEL"));
    }

    #[test]
    fn split_mount_path_rejects_bad_prefixes() {
        assert_eq!(split_mount_path("/a/b"), Err(FatError::InvalidDrive));
        assert_eq!(split_mount_path(":x"), Err(FatError::InvalidDrive));
        assert_eq!(split_mount_path("x:/a"), Err(FatError::InvalidDrive));
        assert_eq!(split_mount_path("10:/a"), Err(FatError::InvalidDrive));
        assert_eq!(split_mount_path("12345678901234567890:/a"), Err(FatError::InvalidDrive));
    }
}
