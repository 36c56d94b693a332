//! Mount-slot dispatch for disk I/O.
//!
//! The FAT layer addresses storage by mount slot, not by device. The
//! [`SlotTable`] maps each slot to the block device mounted there via a
//! weak reference: bindings are written when a drive mounts and cleared
//! when it unmounts, and every disk-I/O access re-validates the reference
//! by upgrading it. A cleared or dead slot answers with a parameter
//! error, which is what the FAT layer expects from a vanished medium.
//!
//! [`SlotIo`] turns the sector interface of the bound device into the
//! byte-granular `Read`/`Write`/`Seek` the `fatfs` crate consumes,
//! including read-modify-write for accesses that straddle sector
//! boundaries.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, Weak};

use usbfs_scsi::{ScsiBlockDevice, ScsiError};

use crate::MAX_VOLUMES;

/// Weak slot → block-device lookup table.
pub struct SlotTable {
    slots: Mutex<Vec<Option<Weak<Mutex<ScsiBlockDevice>>>>>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(vec![None; MAX_VOLUMES]),
        }
    }

    /// Bind a slot to a device. Existing bindings are replaced.
    pub fn bind(&self, slot: usize, device: &Arc<Mutex<ScsiBlockDevice>>) {
        if let Some(entry) = self.slots.lock().unwrap().get_mut(slot) {
            *entry = Some(Arc::downgrade(device));
        }
    }

    /// Clear a slot binding.
    pub fn clear(&self, slot: usize) {
        if let Some(entry) = self.slots.lock().unwrap().get_mut(slot) {
            *entry = None;
        }
    }

    /// Resolve a slot to its device, if still alive. The upgrade is the
    /// validation: a racing unmount leaves a dead weak reference behind,
    /// never a dangling one.
    pub fn device(&self, slot: usize) -> Option<Arc<Mutex<ScsiBlockDevice>>> {
        let weak = self.slots.lock().unwrap().get(slot)?.clone()?;
        weak.upgrade()
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte-addressed I/O over the device bound to one mount slot.
pub struct SlotIo {
    table: Arc<SlotTable>,
    slot: usize,
    pos: u64,
}

impl SlotIo {
    pub fn new(table: Arc<SlotTable>, slot: usize) -> Self {
        Self {
            table,
            slot,
            pos: 0,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    fn device(&self) -> io::Result<Arc<Mutex<ScsiBlockDevice>>> {
        self.table
            .device(self.slot)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no drive bound to slot"))
    }
}

fn scsi_io_err(err: ScsiError) -> io::Error {
    io::Error::other(err)
}

fn lock_err() -> io::Error {
    io::Error::other("block device lock poisoned")
}

impl Read for SlotIo {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let device = self.device()?;
        let mut device = device.lock().map_err(|_| lock_err())?;

        // Clamp at end-of-disk
        let remaining_on_disk = device.capacity_bytes().saturating_sub(self.pos);
        if remaining_on_disk == 0 {
            return Ok(0);
        }
        let want = out.len().min(remaining_on_disk as usize);

        let bs = device.block_size() as usize;
        let start_lba = self.pos / bs as u64;
        let offset_in_block = (self.pos % bs as u64) as usize;
        let total_blocks = (offset_in_block + want).div_ceil(bs);

        // Stage the covering sector range, then copy the byte window out.
        let mut tmp = vec![0u8; total_blocks * bs];
        device
            .read_sectors(start_lba, total_blocks as u32, &mut tmp)
            .map_err(scsi_io_err)?;

        out[..want].copy_from_slice(&tmp[offset_in_block..offset_in_block + want]);
        self.pos += want as u64;
        Ok(want)
    }
}

impl Write for SlotIo {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }

        let device = self.device()?;
        let mut device = device.lock().map_err(|_| lock_err())?;

        // Clamp at end-of-disk
        let remaining_on_disk = device.capacity_bytes().saturating_sub(self.pos);
        if remaining_on_disk == 0 {
            return Ok(0);
        }
        let want = src.len().min(remaining_on_disk as usize);

        let bs = device.block_size() as usize;
        let mut cur_lba = self.pos / bs as u64;
        let mut offset_in_block = (self.pos % bs as u64) as usize;

        let mut written = 0;
        while written < want {
            let chunk_left = want - written;

            // Unaligned head or a sub-sector tail: read-modify-write one
            // sector.
            if offset_in_block != 0 || chunk_left < bs {
                let mut tmp = vec![0u8; bs];
                device
                    .read_sectors(cur_lba, 1, &mut tmp)
                    .map_err(scsi_io_err)?;

                let copy_len = (bs - offset_in_block).min(chunk_left);
                tmp[offset_in_block..offset_in_block + copy_len]
                    .copy_from_slice(&src[written..written + copy_len]);

                device.write_sectors(cur_lba, 1, &tmp).map_err(scsi_io_err)?;

                written += copy_len;
                self.pos += copy_len as u64;
                cur_lba += 1;
                offset_in_block = 0;
                continue;
            }

            // Aligned whole sectors go out directly from the source.
            let whole_blocks = chunk_left / bs;
            let byte_len = whole_blocks * bs;
            device
                .write_sectors(
                    cur_lba,
                    whole_blocks as u32,
                    &src[written..written + byte_len],
                )
                .map_err(scsi_io_err)?;

            written += byte_len;
            self.pos += byte_len as u64;
            cur_lba += whole_blocks as u64;
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SlotIo {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let device = self.device()?;
        let disk = {
            let device = device.lock().map_err(|_| lock_err())?;
            device.capacity_bytes() as i128
        };

        let cur = self.pos as i128;
        let dst: i128 = match pos {
            SeekFrom::Start(o) => o as i128,
            SeekFrom::End(off) => disk + off as i128,
            SeekFrom::Current(off) => cur + off as i128,
        };
        if dst < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.pos = dst.min(disk) as u64; // clamp to end
        Ok(self.pos)
    }
}
