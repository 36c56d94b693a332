//! `fatfs`-backed [`FatVolume`] implementation.
//!
//! A [`FatfsVolume`] owns a `fatfs::FileSystem` whose storage is a
//! [`SlotIo`] over the volume's mount slot, so every sector it touches is
//! pulled through the slot table and the SCSI layer underneath. File
//! operations are open-per-call: the RPC surface above addresses bytes by
//! explicit offset, so nothing needs to hold a `fatfs` handle across
//! calls.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use fatfs::{FatType, FsOptions};

use crate::slots::{SlotIo, SlotTable};
use crate::{
    EntryInfo, EntryKind, FatError, FatVolume, FsType, MAX_LABEL_LEN, Metadata, VolumeMounter,
    split_mount_path,
};

/// Offset of the volume-label field in a FAT12/FAT16 boot sector.
const BPB_LABEL_OFFSET_FAT16: u64 = 0x2B;
/// Offset of the volume-label field in a FAT32 boot sector.
const BPB_LABEL_OFFSET_FAT32: u64 = 0x47;

const ZERO_CHUNK: usize = 4096;

fn map_io_err(err: io::Error) -> FatError {
    match err.kind() {
        io::ErrorKind::NotFound => FatError::NotFound,
        io::ErrorKind::AlreadyExists => FatError::AlreadyExists,
        io::ErrorKind::InvalidInput => FatError::InvalidParameter,
        io::ErrorKind::InvalidData => FatError::NoFilesystem,
        io::ErrorKind::PermissionDenied => FatError::Denied,
        io::ErrorKind::UnexpectedEof => FatError::DiskError,
        io::ErrorKind::WriteZero => FatError::DiskError,
        _ => FatError::DiskError,
    }
}

/// Days from 1970-01-01 to the given civil date (proleptic Gregorian).
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let mp = if month > 2 { month - 3 } else { month + 9 };
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

/// FAT timestamp (1980-biased date, 2-second granularity) to POSIX
/// seconds. Dates before the epoch collapse to zero.
pub fn fat_datetime_to_unix(dt: &fatfs::DateTime) -> u64 {
    let days = days_from_civil(dt.date.year as i64, dt.date.month as i64, dt.date.day as i64);
    if days < 0 {
        return 0;
    }
    days as u64 * 86_400
        + dt.time.hour as u64 * 3_600
        + dt.time.min as u64 * 60
        + dt.time.sec as u64
}

/// Mounts [`FatfsVolume`]s over a shared slot table.
pub struct FatfsMounter {
    table: Arc<SlotTable>,
}

impl FatfsMounter {
    pub fn new(table: Arc<SlotTable>) -> Self {
        Self { table }
    }
}

impl VolumeMounter for FatfsMounter {
    fn mount(&self, slot: usize) -> Result<Box<dyn FatVolume>, FatError> {
        let volume = FatfsVolume::mount(self.table.clone(), slot)?;
        Ok(Box::new(volume))
    }
}

/// A FAT filesystem mounted over one slot.
pub struct FatfsVolume {
    fs: fatfs::FileSystem<SlotIo>,
    table: Arc<SlotTable>,
    slot: usize,
    /// Labels written through us; the boot sector is patched on write but
    /// the mounted filesystem caches the label it read at mount time.
    label_override: Option<String>,
}

// `fatfs::FsOptions` stores its OEM code-page converter and time provider as
// `&'static dyn Trait` without a `Sync` bound, so the compiler can't see that
// the default converters (stateless, used via `FsOptions::new()` above) are
// actually safe to share across threads. Assert it manually.
unsafe impl Send for FatfsVolume {}

impl FatfsVolume {
    /// Mount the device currently bound to `slot`.
    ///
    /// No caching layer sits between `fatfs` and the sector I/O: every
    /// filesystem access goes straight to the device.
    pub fn mount(table: Arc<SlotTable>, slot: usize) -> Result<Self, FatError> {
        let io = SlotIo::new(table.clone(), slot);
        let fs = fatfs::FileSystem::new(io, FsOptions::new()).map_err(|err| {
            log::warn!("slot {slot}: FAT mount failed: {err}");
            map_io_err(err)
        })?;

        log::debug!(
            "slot {slot}: mounted {:?} volume, label {:?}",
            fs.fat_type(),
            fs.volume_label()
        );

        Ok(Self {
            fs,
            table,
            slot,
            label_override: None,
        })
    }

    /// Strip and validate the mount prefix of `path`, returning the
    /// volume-local remainder without its leading separators.
    fn local<'a>(&self, path: &'a str) -> Result<&'a str, FatError> {
        let (slot, rest) = split_mount_path(path)?;
        if slot != self.slot {
            return Err(FatError::InvalidDrive);
        }
        Ok(rest.trim_start_matches('/'))
    }

    fn find_entry(&self, local: &str) -> Result<Metadata, FatError> {
        if local.is_empty() {
            // The root directory exists but carries no timestamp.
            return Ok(Metadata {
                kind: EntryKind::Directory,
                size: 0,
                modified_unix: 0,
            });
        }

        let (parent, name) = local.rsplit_once('/').unwrap_or(("", local));

        let root = self.fs.root_dir();
        let dir = if parent.is_empty() {
            root
        } else {
            self.fs.root_dir().open_dir(parent).map_err(map_io_err)?
        };

        for entry in dir.iter() {
            let entry = entry.map_err(map_io_err)?;
            if entry.file_name().eq_ignore_ascii_case(name) {
                return Ok(Metadata {
                    kind: if entry.is_dir() {
                        EntryKind::Directory
                    } else {
                        EntryKind::File
                    },
                    size: entry.len(),
                    modified_unix: fat_datetime_to_unix(&entry.modified()),
                });
            }
        }

        Err(FatError::NotFound)
    }

    fn zero_extend<W: Write>(mut writer: W, mut remaining: u64) -> Result<(), FatError> {
        let zeros = [0u8; ZERO_CHUNK];
        while remaining > 0 {
            let chunk = remaining.min(ZERO_CHUNK as u64) as usize;
            writer.write_all(&zeros[..chunk]).map_err(map_io_err)?;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    fn label_sector_offset(&self) -> u64 {
        match self.fs.fat_type() {
            FatType::Fat32 => BPB_LABEL_OFFSET_FAT32,
            _ => BPB_LABEL_OFFSET_FAT16,
        }
    }
}

impl FatVolume for FatfsVolume {
    fn fs_type(&self) -> FsType {
        match self.fs.fat_type() {
            FatType::Fat12 => FsType::Fat12,
            FatType::Fat16 => FsType::Fat16,
            FatType::Fat32 => FsType::Fat32,
        }
    }

    fn label(&mut self) -> Result<String, FatError> {
        if let Some(label) = &self.label_override {
            return Ok(label.clone());
        }
        Ok(self.fs.volume_label().trim_end().to_string())
    }

    fn set_label(&mut self, spec: &str) -> Result<(), FatError> {
        let label = self.local(spec)?;
        let label: String = label
            .chars()
            .take(MAX_LABEL_LEN)
            .map(|c| c.to_ascii_uppercase())
            .collect();

        // The filesystem caches the boot sector it mounted from, so the
        // label field is patched through a second view of the same slot.
        let mut field = [b' '; MAX_LABEL_LEN];
        if label.is_empty() {
            field[..7].copy_from_slice(b"NO NAME");
        } else {
            let bytes = label.as_bytes();
            field[..bytes.len()].copy_from_slice(bytes);
        }

        let mut io = SlotIo::new(self.table.clone(), self.slot);
        io.seek(SeekFrom::Start(self.label_sector_offset()))
            .map_err(map_io_err)?;
        io.write_all(&field).map_err(map_io_err)?;

        self.label_override = Some(label);
        Ok(())
    }

    fn create_file(&mut self, path: &str, size: u64) -> Result<(), FatError> {
        let local = self.local(path)?.to_string();
        if self.find_entry(&local).is_ok() {
            return Err(FatError::AlreadyExists);
        }

        let root = self.fs.root_dir();
        let mut file = root.create_file(&local).map_err(map_io_err)?;
        if size > 0 {
            Self::zero_extend(&mut file, size)?;
        }
        file.flush().map_err(map_io_err)?;
        Ok(())
    }

    fn remove_file(&mut self, path: &str) -> Result<(), FatError> {
        let local = self.local(path)?.to_string();
        let meta = self.find_entry(&local)?;
        if meta.kind != EntryKind::File {
            return Err(FatError::Denied);
        }
        self.fs.root_dir().remove(&local).map_err(map_io_err)
    }

    fn create_dir(&mut self, path: &str) -> Result<(), FatError> {
        let local = self.local(path)?.to_string();
        if self.find_entry(&local).is_ok() {
            return Err(FatError::AlreadyExists);
        }
        self.fs
            .root_dir()
            .create_dir(&local)
            .map(|_| ())
            .map_err(map_io_err)
    }

    fn remove_dir(&mut self, path: &str) -> Result<(), FatError> {
        let local = self.local(path)?.to_string();
        let meta = self.find_entry(&local)?;
        if meta.kind != EntryKind::Directory {
            return Err(FatError::Denied);
        }
        self.fs.root_dir().remove(&local).map_err(map_io_err)
    }

    fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), FatError> {
        let old_local = self.local(old_path)?.to_string();
        let new_local = self.local(new_path)?.to_string();

        self.find_entry(&old_local)?;
        if self.find_entry(&new_local).is_ok() {
            return Err(FatError::AlreadyExists);
        }

        let root = self.fs.root_dir();
        let dst = self.fs.root_dir();
        root.rename(&old_local, &dst, &new_local).map_err(map_io_err)
    }

    fn stat(&mut self, path: &str) -> Result<Metadata, FatError> {
        let local = self.local(path)?.to_string();
        self.find_entry(&local)
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<EntryInfo>, FatError> {
        let local = self.local(path)?.to_string();

        let root = self.fs.root_dir();
        let dir = if local.is_empty() {
            root
        } else {
            let meta = self.find_entry(&local)?;
            if meta.kind != EntryKind::Directory {
                return Err(FatError::NoPath);
            }
            self.fs.root_dir().open_dir(&local).map_err(map_io_err)?
        };

        let mut entries = Vec::new();
        for entry in dir.iter() {
            let entry = entry.map_err(map_io_err)?;
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            entries.push(EntryInfo {
                kind: if entry.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                size: entry.len(),
                name,
            });
        }
        Ok(entries)
    }

    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FatError> {
        let local = self.local(path)?.to_string();

        let root = self.fs.root_dir();
        let mut file = root.open_file(&local).map_err(map_io_err)?;

        let len = file.seek(SeekFrom::End(0)).map_err(map_io_err)?;
        if offset >= len {
            return Ok(0);
        }
        file.seek(SeekFrom::Start(offset)).map_err(map_io_err)?;

        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..]).map_err(map_io_err)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn write_at(
        &mut self,
        path: &str,
        offset: u64,
        data: &[u8],
        append: bool,
    ) -> Result<usize, FatError> {
        let local = self.local(path)?.to_string();

        let root = self.fs.root_dir();
        let mut file = root.open_file(&local).map_err(map_io_err)?;

        let len = file.seek(SeekFrom::End(0)).map_err(map_io_err)?;
        let start = if append { len } else { offset };
        if start > len {
            // Zero-fill the gap between the current end and the offset.
            Self::zero_extend(&mut file, start - len)?;
        } else {
            file.seek(SeekFrom::Start(start)).map_err(map_io_err)?;
        }

        file.write_all(data).map_err(map_io_err)?;
        file.flush().map_err(map_io_err)?;
        Ok(data.len())
    }

    fn set_len(&mut self, path: &str, size: u64) -> Result<(), FatError> {
        let local = self.local(path)?.to_string();

        let root = self.fs.root_dir();
        let mut file = root.open_file(&local).map_err(map_io_err)?;

        let len = file.seek(SeekFrom::End(0)).map_err(map_io_err)?;
        if size < len {
            file.seek(SeekFrom::Start(size)).map_err(map_io_err)?;
            file.truncate().map_err(map_io_err)?;
        } else if size > len {
            Self::zero_extend(&mut file, size - len)?;
        }
        file.flush().map_err(map_io_err)?;
        Ok(())
    }

    fn free_space(&mut self) -> Result<u64, FatError> {
        let stats = self.fs.stats().map_err(map_io_err)?;
        Ok(stats.free_clusters() as u64 * stats.cluster_size() as u64)
    }

    fn total_space(&mut self) -> Result<u64, FatError> {
        let stats = self.fs.stats().map_err(map_io_err)?;
        Ok(stats.total_clusters() as u64 * stats.cluster_size() as u64)
    }
}
