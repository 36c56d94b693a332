//! One drive: an acquired interface, one logical unit, one mount slot.

use std::sync::{Arc, Mutex};

use usbfs_fat::{FatVolume, SlotTable, VolumeMounter, format_mount_name};
use usbfs_scsi::bot::BulkOnlyTransport;
use usbfs_scsi::transport::{EndpointSession, InterfaceId, InterfaceSession, UsbTransport};
use usbfs_scsi::{ScsiBlockDevice, ScsiOptions};

use crate::error::{Result, ServiceError};
use crate::manager::SlotAllocator;

/// State guarded by the per-drive filesystem lock.
pub(crate) struct MountState {
    /// Valid exactly while the drive is mounted.
    pub volume: Option<Box<dyn FatVolume>>,
}

/// A single (interface, LUN) binding with its transport sessions, SCSI
/// context and mount slot.
///
/// Locking: the drive is owned by the manager and mutated under the
/// manager lock; the FAT volume is guarded by the drive's own `fs` lock
/// so volume I/O never runs under the manager lock.
pub struct Drive {
    iface: InterfaceSession,
    in_ep: EndpointSession,
    out_ep: EndpointSession,
    lun: u8,
    scsi: Arc<Mutex<ScsiBlockDevice>>,
    fs: Arc<Mutex<MountState>>,
    mount_slot: Option<usize>,
    disposed: bool,
}

impl Drive {
    /// Bind the endpoint pair and run SCSI setup for `lun`. No other I/O
    /// happens at construction.
    pub(crate) fn new(
        transport: Arc<dyn UsbTransport>,
        iface: InterfaceSession,
        interface_number: u8,
        in_ep: EndpointSession,
        out_ep: EndpointSession,
        lun: u8,
        scsi_opts: ScsiOptions,
    ) -> Self {
        let bot = BulkOnlyTransport::new(transport, iface, interface_number, in_ep, out_ep);
        let scsi = ScsiBlockDevice::new(bot, lun, scsi_opts);

        Self {
            iface,
            in_ep,
            out_ep,
            lun,
            scsi: Arc::new(Mutex::new(scsi)),
            fs: Arc::new(Mutex::new(MountState { volume: None })),
            mount_slot: None,
            disposed: false,
        }
    }

    pub fn interface_id(&self) -> InterfaceId {
        self.iface.id
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    pub fn is_mounted(&self) -> bool {
        self.mount_slot.is_some()
    }

    pub fn mount_slot(&self) -> Option<usize> {
        self.mount_slot
    }

    pub fn mount_name(&self) -> Option<String> {
        self.mount_slot.map(format_mount_name)
    }

    pub fn scsi_ok(&self) -> bool {
        self.scsi.lock().unwrap().ok()
    }

    pub(crate) fn scsi_handle(&self) -> Arc<Mutex<ScsiBlockDevice>> {
        self.scsi.clone()
    }

    /// Handle to the fs-lock'd mount state; cloned by lookups so the
    /// manager lock can be released before the volume lock is taken.
    pub(crate) fn fs_state(&self) -> Arc<Mutex<MountState>> {
        self.fs.clone()
    }

    /// Mount the drive. Idempotent: a mounted drive reports success.
    ///
    /// The slot binding is published before the FAT mount runs, because
    /// mounting already pulls sectors through the slot dispatch.
    pub(crate) fn mount(
        &mut self,
        slots: &mut SlotAllocator,
        table: &SlotTable,
        mounter: &dyn VolumeMounter,
    ) -> Result<()> {
        if self.mount_slot.is_some() {
            return Ok(());
        }

        if !self.scsi_ok() {
            return Err(ServiceError::DriveInitFailure);
        }

        let Some(slot) = slots.claim() else {
            log::warn!(
                "interface {} lun {}: no free mount slot",
                self.iface.id,
                self.lun
            );
            return Err(ServiceError::DriveInitFailure);
        };

        table.bind(slot, &self.scsi);
        match mounter.mount(slot) {
            Ok(volume) => {
                self.fs.lock().unwrap().volume = Some(volume);
                self.mount_slot = Some(slot);
                log::info!(
                    "interface {} lun {}: mounted as \"{}\"",
                    self.iface.id,
                    self.lun,
                    format_mount_name(slot)
                );
                Ok(())
            }
            Err(err) => {
                table.clear(slot);
                slots.release(slot);
                log::warn!(
                    "interface {} lun {}: mount failed: {err}",
                    self.iface.id,
                    self.lun
                );
                Err(err.into())
            }
        }
    }

    /// Unmount the drive. A drive that is not mounted is left alone.
    ///
    /// The volume is dropped (and flushed) under the fs lock while the
    /// slot is still bound; only a quiesced drive gives its slot back.
    pub(crate) fn unmount(&mut self, slots: &mut SlotAllocator, table: &SlotTable) {
        let Some(slot) = self.mount_slot.take() else {
            return;
        };

        self.fs.lock().unwrap().volume = None;
        table.clear(slot);
        slots.release(slot);

        log::info!(
            "interface {} lun {}: unmounted \"{}\"",
            self.iface.id,
            self.lun,
            format_mount_name(slot)
        );
    }

    /// Tear down the transport side of the drive, exactly once.
    ///
    /// `close_usb = false` keeps the endpoint and interface sessions open;
    /// the manager uses it when a LUN failed to mount but the interface
    /// must survive for the next LUN attempt.
    pub(crate) fn dispose(&mut self, transport: &dyn UsbTransport, close_usb: bool) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if close_usb {
            transport.close_endpoint(self.out_ep);
            transport.close_endpoint(self.in_ep);
            transport.release_interface(self.iface);
        }
    }
}
