//! Sector-addressed view of one logical unit.
//!
//! [`ScsiBlockDevice`] owns the bulk-only transport for its LUN and caches
//! the geometry learned during setup. Setup runs exactly once, at
//! construction; a unit that never becomes ready is kept around in a
//! not-OK state so the caller can decide to fall back to another LUN.

use std::time::Duration;

use thiserror::Error;

use crate::bot::{BotData, BulkOnlyTransport};
use crate::commands::cbw::CswStatus;
use crate::commands::inquiry::{
    INQUIRY_DATA_LEN, InquiryCommand, InquiryData, PeripheralDeviceType,
};
use crate::commands::read_capacity::{
    READ_CAPACITY_16_DATA_LEN, ReadCapacity10Command, ReadCapacity10Data, ReadCapacity16Command,
    ReadCapacity16Data,
};
use crate::commands::read10::Read10Command;
use crate::commands::test_unit_ready::TestUnitReadyCommand;
use crate::commands::write10::Write10Command;
use crate::transport::TransportError;
use crate::transport::xfer_mem::{XFER_MEM_MAX_MULTIPLIER, XferBuf};

/// Smallest logical block size this crate accepts.
pub const MIN_BLOCK_SIZE: u32 = 512;
/// Largest logical block size this crate accepts.
pub const MAX_BLOCK_SIZE: u32 = 4096;

/// Errors from block-device setup and sector I/O.
#[derive(Error, Debug)]
pub enum ScsiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The device reported CHECK CONDITION (or a phase error) for a
    /// command we cannot proceed without.
    #[error("scsi command {op} failed")]
    CommandFailed { op: &'static str },
    /// The unit never answered TEST UNIT READY with success.
    #[error("unit not ready after spin-up retries")]
    NotReady,
    /// INQUIRY reported something other than a direct-access device.
    #[error("unsupported peripheral device type {0:#04x}")]
    UnsupportedDevice(u8),
    /// Reported logical block size outside 512..=4096.
    #[error("unsupported logical block size {0}")]
    BadBlockSize(u32),
    /// Request beyond the addressable range of the unit or the command set.
    #[error("sector range out of bounds")]
    OutOfRange,
    /// Buffer length does not match `count * block_size`.
    #[error("buffer size does not match sector count")]
    BadBufferSize,
}

/// Setup tuning knobs; defaults match typical thumb-drive spin-up times.
#[derive(Debug, Clone, Copy)]
pub struct ScsiOptions {
    /// TEST UNIT READY attempts before giving up on the unit.
    pub ready_attempts: u32,
    /// Pause between TEST UNIT READY attempts.
    pub ready_backoff: Duration,
}

impl Default for ScsiOptions {
    fn default() -> Self {
        Self {
            ready_attempts: 16,
            ready_backoff: Duration::from_millis(50),
        }
    }
}

/// SCSI transparent-command-set block device over one LUN.
pub struct ScsiBlockDevice {
    bot: BulkOnlyTransport,
    lun: u8,
    block_size: u32,
    block_count: u64,
    ok: bool,
    identity: Option<InquiryData>,
    /// Aligned bounce buffer for the data stage.
    xfer: XferBuf,
}

impl ScsiBlockDevice {
    /// Bind a LUN and run the setup sequence. The returned device is
    /// always constructed; check [`ok`](Self::ok) before mounting.
    pub fn new(bot: BulkOnlyTransport, lun: u8, options: ScsiOptions) -> Self {
        let mut device = Self {
            bot,
            lun,
            block_size: 0,
            block_count: 0,
            ok: false,
            identity: None,
            xfer: XferBuf::new(XFER_MEM_MAX_MULTIPLIER),
        };

        match device.setup(options) {
            Ok(()) => {
                device.ok = true;
                if let Some(identity) = &device.identity {
                    log::info!(
                        "interface {} lun {}: {} {} rev {}, {} blocks of {} bytes",
                        device.bot.interface().id,
                        lun,
                        identity.vendor(),
                        identity.product(),
                        identity.revision(),
                        device.block_count,
                        device.block_size,
                    );
                }
            }
            Err(err) => {
                log::warn!(
                    "interface {} lun {}: setup failed: {err}",
                    device.bot.interface().id,
                    lun
                );
            }
        }

        device
    }

    fn setup(&mut self, options: ScsiOptions) -> Result<(), ScsiError> {
        // Spin-up: poll TEST UNIT READY with a short back-off.
        let mut ready = false;
        for attempt in 0..options.ready_attempts {
            let status = self
                .bot
                .transact(self.lun, &TestUnitReadyCommand::new(), BotData::None)?;
            if status == CswStatus::Passed {
                ready = true;
                break;
            }
            log::debug!(
                "interface {} lun {}: unit not ready (attempt {})",
                self.bot.interface().id,
                self.lun,
                attempt + 1
            );
            std::thread::sleep(options.ready_backoff);
        }
        if !ready {
            return Err(ScsiError::NotReady);
        }

        // Identify; only direct-access devices are usable as drives.
        let inquiry = InquiryCommand::new(INQUIRY_DATA_LEN as u8);
        let status = self.bot.transact(
            self.lun,
            &inquiry,
            BotData::In(&mut self.xfer[..INQUIRY_DATA_LEN]),
        )?;
        if status != CswStatus::Passed {
            return Err(ScsiError::CommandFailed { op: "INQUIRY" });
        }
        let identity = InquiryData::parse(&self.xfer[..INQUIRY_DATA_LEN])
            .ok_or(ScsiError::CommandFailed { op: "INQUIRY" })?;
        if identity.peripheral_device_type != PeripheralDeviceType::SbcDirectAccessDevice {
            return Err(ScsiError::UnsupportedDevice(
                identity.peripheral_device_type.raw(),
            ));
        }
        self.identity = Some(identity);

        // Geometry, with the 64-bit fallback for large units.
        let status = self.bot.transact(
            self.lun,
            &ReadCapacity10Command::new(self.lun),
            BotData::In(&mut self.xfer[..8]),
        )?;
        if status != CswStatus::Passed {
            return Err(ScsiError::CommandFailed {
                op: "READ CAPACITY(10)",
            });
        }
        let cap10 = ReadCapacity10Data::parse(&self.xfer[..8]).ok_or(ScsiError::CommandFailed {
            op: "READ CAPACITY(10)",
        })?;

        let (last_lba, block_size) = if cap10.is_overflow_sentinel() {
            let status = self.bot.transact(
                self.lun,
                &ReadCapacity16Command::new(),
                BotData::In(&mut self.xfer[..READ_CAPACITY_16_DATA_LEN]),
            )?;
            if status != CswStatus::Passed {
                return Err(ScsiError::CommandFailed {
                    op: "READ CAPACITY(16)",
                });
            }
            let cap16 = ReadCapacity16Data::parse(&self.xfer[..READ_CAPACITY_16_DATA_LEN]).ok_or(
                ScsiError::CommandFailed {
                    op: "READ CAPACITY(16)",
                },
            )?;
            (cap16.last_logical_block_address, cap16.block_length_bytes)
        } else {
            (
                cap10.last_logical_block_address as u64,
                cap10.block_length_bytes,
            )
        };

        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(ScsiError::BadBlockSize(block_size));
        }

        self.block_size = block_size;
        self.block_count = last_lba + 1;
        Ok(())
    }

    /// False once setup failed or a transport error persisted through
    /// reset recovery; the drive manager removes not-OK devices at the
    /// next reconcile.
    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Total capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.block_count * self.block_size as u64
    }

    pub fn identity(&self) -> Option<&InquiryData> {
        self.identity.as_ref()
    }

    /// Largest sector count per BOT transaction with the current geometry.
    fn max_blocks_per_transfer(&self) -> u32 {
        (self.xfer.len() as u32 / self.block_size).max(1)
    }

    fn check_range(&self, lba: u64, count: u32, buf_len: usize) -> Result<(), ScsiError> {
        if buf_len as u64 != count as u64 * self.block_size as u64 {
            return Err(ScsiError::BadBufferSize);
        }
        let end = lba
            .checked_add(count as u64)
            .ok_or(ScsiError::OutOfRange)?;
        if end > self.block_count || end > u32::MAX as u64 + 1 {
            // READ(10)/WRITE(10) address 32-bit LBAs only.
            return Err(ScsiError::OutOfRange);
        }
        Ok(())
    }

    /// Read `count` sectors starting at `lba` into `out`.
    ///
    /// Transfers exceeding one BOT data phase are split into multiple
    /// transactions with contiguous LBAs; success means every transaction
    /// passed.
    pub fn read_sectors(&mut self, lba: u64, count: u32, out: &mut [u8]) -> Result<(), ScsiError> {
        self.check_range(lba, count, out.len())?;

        let bs = self.block_size as usize;
        let max_blocks = self.max_blocks_per_transfer();
        let lun = self.lun;
        let Self { bot, ok, xfer, .. } = self;

        let mut cur_lba = lba as u32;
        let mut done = 0u32;
        while done < count {
            let chunk = (count - done).min(max_blocks) as u16;
            let chunk_bytes = chunk as usize * bs;

            let cmd = Read10Command::new(lun, cur_lba, chunk);
            let status = bot
                .transact(lun, &cmd, BotData::In(&mut xfer[..chunk_bytes]))
                .inspect_err(|_| *ok = false)?;
            if status != CswStatus::Passed {
                return Err(ScsiError::CommandFailed { op: "READ(10)" });
            }

            let offset = done as usize * bs;
            out[offset..offset + chunk_bytes].copy_from_slice(&xfer[..chunk_bytes]);

            cur_lba += chunk as u32;
            done += chunk as u32;
        }

        Ok(())
    }

    /// Write `count` sectors starting at `lba` from `data`, splitting the
    /// same way as [`read_sectors`](Self::read_sectors).
    pub fn write_sectors(&mut self, lba: u64, count: u32, data: &[u8]) -> Result<(), ScsiError> {
        self.check_range(lba, count, data.len())?;

        let bs = self.block_size as usize;
        let max_blocks = self.max_blocks_per_transfer();
        let lun = self.lun;
        let Self { bot, ok, xfer, .. } = self;

        let mut cur_lba = lba as u32;
        let mut done = 0u32;
        while done < count {
            let chunk = (count - done).min(max_blocks) as u16;
            let chunk_bytes = chunk as usize * bs;

            let offset = done as usize * bs;
            xfer[..chunk_bytes].copy_from_slice(&data[offset..offset + chunk_bytes]);

            let cmd = Write10Command::new(lun, cur_lba, chunk);
            let status = bot
                .transact(lun, &cmd, BotData::Out(&xfer[..chunk_bytes]))
                .inspect_err(|_| *ok = false)?;
            if status != CswStatus::Passed {
                return Err(ScsiError::CommandFailed { op: "WRITE(10)" });
            }

            cur_lba += chunk as u32;
            done += chunk as u32;
        }

        Ok(())
    }
}
