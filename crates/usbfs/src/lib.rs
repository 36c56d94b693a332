#![doc = include_str!("../README.md")]

pub mod drive;
pub mod error;
pub mod fs;
pub mod manager;
pub mod service;

pub use error::{Result, ServiceError};
pub use manager::DriveManager;
pub use service::{CommandId, FsService, SERVICE_NAME, ServerOptions};

/// Maximum number of simultaneously mounted drives (the FAT layer's
/// volume capacity).
pub const MAX_DRIVES: usize = usbfs_fat::MAX_VOLUMES;
