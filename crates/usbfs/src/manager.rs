//! Process-wide drive registry and hot-plug reconciler.
//!
//! The manager owns every live [`Drive`], the mount-slot allocator and
//! the background reconciler thread. Reconciliation runs under the
//! manager lock; client lookups resolve a drive and clone its fs-lock
//! handle under the manager lock, then release it before any FAT or USB
//! work starts (see [`DriveManager::with_volume`]).

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use usbfs_fat::{FatError, FatVolume, FatfsMounter, MAX_VOLUMES, SlotTable, VolumeMounter};
use usbfs_scsi::bot::{self, BulkOnlyTransport};
use usbfs_scsi::transport::event::{EventHandle, EventSet};
use usbfs_scsi::transport::{InterfaceFilter, InterfaceId, TransportWake, UsbTransport};
use usbfs_scsi::{ScsiBlockDevice, ScsiOptions};

use crate::drive::Drive;
use crate::error::{Result, ServiceError};

const EV_STATE_CHANGE: u32 = 1 << 0;
const EV_AVAILABLE: u32 = 1 << 1;
const EV_EXIT: u32 = 1 << 2;
const EV_ALL: u32 = EV_STATE_CHANGE | EV_AVAILABLE | EV_EXIT;

/// First-free-fit mount-slot allocator. Only touched under the manager
/// lock.
pub(crate) struct SlotAllocator {
    used: [bool; MAX_VOLUMES],
}

impl SlotAllocator {
    fn new() -> Self {
        Self {
            used: [false; MAX_VOLUMES],
        }
    }

    pub(crate) fn claim(&mut self) -> Option<usize> {
        let slot = self.used.iter().position(|used| !used)?;
        self.used[slot] = true;
        Some(slot)
    }

    pub(crate) fn release(&mut self, slot: usize) {
        if let Some(used) = self.used.get_mut(slot) {
            *used = false;
        }
    }

    fn used_slots(&self) -> Vec<usize> {
        self.used
            .iter()
            .enumerate()
            .filter_map(|(slot, used)| used.then_some(slot))
            .collect()
    }
}

struct ManagerState {
    drives: Vec<Drive>,
    slots: SlotAllocator,
    initialized: bool,
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    transport: Arc<dyn UsbTransport>,
    mounter: Box<dyn VolumeMounter>,
    table: Arc<SlotTable>,
    filter: InterfaceFilter,
    scsi_opts: ScsiOptions,
    state: Mutex<ManagerState>,
    events: EventSet,
    state_change: EventHandle,
    exit: EventHandle,
}

/// Registry of live drives plus the reconciler that keeps it in sync
/// with the bus.
pub struct DriveManager {
    shared: Arc<Shared>,
}

impl DriveManager {
    /// Manager over the given transport, mounting FAT volumes through a
    /// fresh slot table.
    pub fn new(transport: Arc<dyn UsbTransport>, scsi_opts: ScsiOptions) -> Arc<Self> {
        let table = Arc::new(SlotTable::new());
        let mounter = Box::new(FatfsMounter::new(table.clone()));
        Self::with_mounter(transport, table, mounter, scsi_opts)
    }

    /// Manager with an explicit slot table and volume mounter.
    pub fn with_mounter(
        transport: Arc<dyn UsbTransport>,
        table: Arc<SlotTable>,
        mounter: Box<dyn VolumeMounter>,
        scsi_opts: ScsiOptions,
    ) -> Arc<Self> {
        let events = EventSet::new();
        let state_change = events.handle(EV_STATE_CHANGE);
        let exit = events.handle(EV_EXIT);

        Arc::new(Self {
            shared: Arc::new(Shared {
                transport,
                mounter,
                table,
                filter: InterfaceFilter::mass_storage_bulk_only(),
                scsi_opts,
                state: Mutex::new(ManagerState {
                    drives: Vec::new(),
                    slots: SlotAllocator::new(),
                    initialized: false,
                    worker: None,
                }),
                events,
                state_change,
                exit,
            }),
        })
    }

    /// Start the reconciler thread and hook up the hot-plug wake events.
    /// Idempotent.
    pub fn start(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.initialized {
            return;
        }

        self.shared.exit.clear();
        self.shared.transport.register_wake(TransportWake {
            state_change: self.shared.state_change.clone(),
            available: self.shared.events.auto_handle(EV_AVAILABLE),
            filter: self.shared.filter,
        });

        let shared = self.shared.clone();
        let worker = std::thread::Builder::new()
            .name("usbfs-reconciler".into())
            .spawn(move || reconciler_loop(shared))
            .expect("spawning reconciler thread");

        state.worker = Some(worker);
        state.initialized = true;
        log::info!("drive manager started");
    }

    /// Stop the reconciler and tear down every drive in order. Idempotent.
    pub fn shutdown(&self) {
        let worker = {
            let mut state = self.shared.state.lock().unwrap();
            if !state.initialized {
                return;
            }
            state.worker.take()
        };

        self.shared.exit.signal();
        if let Some(worker) = worker {
            worker.join().ok();
        }

        let mut state = self.shared.state.lock().unwrap();
        let ManagerState { drives, slots, .. } = &mut *state;
        for mut drive in drives.drain(..) {
            drive.unmount(slots, &self.shared.table);
            drive.dispose(self.shared.transport.as_ref(), true);
        }
        state.initialized = false;
        log::info!("drive manager stopped");
    }

    /// Run a reconcile pass synchronously. Called from every RPC entry
    /// point so clients observe fresh plug state without waiting for the
    /// reconciler thread.
    pub fn poll(&self) {
        self.shared.reconcile();
    }

    pub fn drive_count(&self) -> usize {
        self.shared.state.lock().unwrap().drives.len()
    }

    /// Interface ids of live drives, in acquisition order.
    pub fn interface_ids(&self) -> Vec<InterfaceId> {
        self.shared
            .state
            .lock()
            .unwrap()
            .drives
            .iter()
            .map(|d| d.interface_id())
            .collect()
    }

    /// True iff a drive with this id is registered *and* the host still
    /// lists the interface as acquired.
    pub fn is_drive_valid(&self, id: InterfaceId) -> bool {
        let state = self.shared.state.lock().unwrap();
        if !state.drives.iter().any(|d| d.interface_id() == id) {
            return false;
        }
        self.shared
            .transport
            .enumerate_acquired()
            .map(|acquired| acquired.contains(&id))
            .unwrap_or(false)
    }

    pub fn mount_name_of(&self, id: InterfaceId) -> Option<String> {
        self.shared
            .state
            .lock()
            .unwrap()
            .drives
            .iter()
            .find(|d| d.interface_id() == id)
            .and_then(|d| d.mount_name())
    }

    /// `(interface id, mount slot)` pairs of every mounted drive, plus
    /// the allocator's view of used slots, for consistency checks.
    pub fn slot_assignments(&self) -> (Vec<(InterfaceId, usize)>, Vec<usize>) {
        let state = self.shared.state.lock().unwrap();
        let assigned = state
            .drives
            .iter()
            .filter_map(|d| d.mount_slot().map(|slot| (d.interface_id(), slot)))
            .collect();
        (assigned, state.slots.used_slots())
    }

    /// Block-device handle of a drive, for identity queries.
    pub(crate) fn scsi_of(&self, id: InterfaceId) -> Option<Arc<Mutex<ScsiBlockDevice>>> {
        self.shared
            .state
            .lock()
            .unwrap()
            .drives
            .iter()
            .find(|d| d.interface_id() == id)
            .map(|d| d.scsi_handle())
    }

    /// Run `f` against the drive's mounted volume.
    ///
    /// Two-phase locking: the drive is resolved and its fs-lock handle
    /// cloned under the manager lock; the manager lock is released before
    /// the volume lock is taken, so slow FAT/USB work never blocks the
    /// registry.
    pub fn with_volume<R>(
        &self,
        id: InterfaceId,
        f: impl FnOnce(&mut dyn FatVolume) -> std::result::Result<R, FatError>,
    ) -> Result<R> {
        let fs = {
            let state = self.shared.state.lock().unwrap();
            state
                .drives
                .iter()
                .find(|d| d.interface_id() == id)
                .ok_or(ServiceError::DriveUnavailable)?
                .fs_state()
        };

        let mut guard = fs.lock().unwrap();
        let volume = guard
            .volume
            .as_mut()
            .ok_or(ServiceError::DriveUnavailable)?;
        f(volume.as_mut()).map_err(Into::into)
    }
}

impl Drop for DriveManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reconciler_loop(shared: Arc<Shared>) {
    loop {
        let fired = shared.events.wait_any(EV_ALL);
        if fired & EV_EXIT != 0 {
            break;
        }
        // The state-change event is not auto-reset; clear it by hand.
        if fired & EV_STATE_CHANGE != 0 {
            shared.state_change.clear();
        }
        shared.reconcile();
    }
}

impl Shared {
    /// One reconcile pass: drop drives whose interfaces vanished, then
    /// acquire and mount whatever new interfaces match the filter.
    fn reconcile(&self) {
        let mut state = self.state.lock().unwrap();
        let ManagerState { drives, slots, .. } = &mut *state;

        self.removal_pass(drives, slots);
        self.addition_pass(drives, slots);
    }

    fn removal_pass(&self, drives: &mut Vec<Drive>, slots: &mut SlotAllocator) {
        if drives.is_empty() {
            return;
        }
        let Ok(acquired) = self.transport.enumerate_acquired() else {
            return;
        };

        let mut kept = Vec::with_capacity(drives.len());
        for mut drive in drives.drain(..) {
            if acquired.contains(&drive.interface_id()) {
                kept.push(drive);
            } else {
                log::info!(
                    "interface {} disappeared, tearing down its drive",
                    drive.interface_id()
                );
                drive.unmount(slots, &self.table);
                drive.dispose(self.transport.as_ref(), true);
            }
        }
        *drives = kept;
    }

    fn addition_pass(&self, drives: &mut Vec<Drive>, slots: &mut SlotAllocator) {
        let Ok(available) = self.transport.enumerate_available(&self.filter) else {
            return;
        };

        for desc in available {
            let Ok(iface) = self.transport.acquire(&desc) else {
                continue;
            };

            // First non-empty descriptor of each direction.
            let (Some(in_desc), Some(out_desc)) = (
                desc.input_endpoints.first().copied(),
                desc.output_endpoints.first().copied(),
            ) else {
                self.transport.release_interface(iface);
                continue;
            };

            let Ok(in_ep) = self.transport.open_endpoint(iface, &in_desc) else {
                self.transport.release_interface(iface);
                continue;
            };
            let Ok(out_ep) = self.transport.open_endpoint(iface, &out_desc) else {
                self.transport.close_endpoint(in_ep);
                self.transport.release_interface(iface);
                continue;
            };

            // Some devices enumerate unconfigured or on a non-zero
            // alternate setting; fix both, then reset the transport so
            // the endpoints start clean.
            let mut needs_reset = false;
            let current = bot::get_configuration(self.transport.as_ref(), iface);
            if current != desc.configuration_value
                && bot::set_configuration(
                    self.transport.as_ref(),
                    iface,
                    desc.configuration_value,
                )
                .is_ok()
            {
                needs_reset = true;
            }
            if desc.alternate_setting != 0
                && bot::set_interface(
                    self.transport.as_ref(),
                    iface,
                    desc.interface_number,
                    desc.alternate_setting,
                )
                .is_ok()
            {
                needs_reset = true;
            }

            let probe = BulkOnlyTransport::new(
                self.transport.clone(),
                iface,
                desc.interface_number,
                in_ep,
                out_ep,
            );
            if needs_reset {
                probe.reset_recovery().ok();
            }

            let lun_count = probe.get_max_lun();
            log::debug!("interface {}: {lun_count} logical unit(s)", iface.id);

            // First LUN that mounts wins; failed attempts keep the
            // interface alive for the next LUN.
            let mut mounted = false;
            for lun in 0..lun_count {
                let drive = Drive::new(
                    self.transport.clone(),
                    iface,
                    desc.interface_number,
                    in_ep,
                    out_ep,
                    lun,
                    self.scsi_opts,
                );
                drives.push(drive);

                let idx = drives.len() - 1;
                let attempt = drives[idx].mount(slots, &self.table, self.mounter.as_ref());
                match attempt {
                    Ok(()) => {
                        mounted = true;
                        break;
                    }
                    Err(err) => {
                        log::debug!("interface {} lun {lun}: not mountable: {err}", iface.id);
                        if let Some(mut failed) = drives.pop() {
                            failed.dispose(self.transport.as_ref(), false);
                        }
                    }
                }
            }

            if !mounted {
                log::info!("interface {}: no mountable logical unit", iface.id);
                self.transport.close_endpoint(out_ep);
                self.transport.close_endpoint(in_ep);
                self.transport.release_interface(iface);
            }
        }
    }
}
