//! Bridges a virtualized USB host controller (an emulated xHCI/eHCI front-end)
//! to real host USB devices through [`nusb`].
//!
//! [`PortMapper`] is the entry point: one instance owns every attached
//! [`DeviceState`], the Completion Dispatcher thread that drives outstanding
//! transfers to completion, and the Hotplug Watcher thread that reports
//! arrivals/departures. Devices and in-flight requests are addressed through
//! generation-checked handles ([`DeviceHandle`], [`RequestHandle`]) rather
//! than raw pointers, so a stale handle from a torn-down device is rejected
//! instead of resolving to whatever since reused its slot.

mod block;
mod callbacks;
mod control;
mod descriptor_patch;
mod device;
mod dispatcher;
mod endpoint;
mod error;
mod handles;
mod hotplug;
mod path;
mod topology;
mod xfer;

use std::sync::Arc;

use futures_util::future::abortable;
use log::{debug, warn};

pub use block::{Block, BlockStat, BlockType};
pub use callbacks::{Callbacks, EndpointLocks};
pub use control::SetupPacket;
pub use error::{Error, XferStatus};
pub use handles::{DeviceHandle, RequestHandle};
pub use path::{DeviceKind, DevicePath, NativeDeviceInfo};
pub use xfer::{Xfer, XferHandle};

use device::DeviceState;
use dispatcher::{Dispatcher, PendingTransfer};
use endpoint::EpType;
use handles::Registry;
use hotplug::HotplugWatcher;
use xfer::{pack_out, prepare, submit_bulk_or_int_in, submit_bulk_or_int_out, submit_iso_in, PrepareOutcome, RequestEntry, RequestOutcome};

/// Which field an `info()` call reads off a device (§6 `usb_dev_info`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKind {
    Version,
    Speed,
    Bus,
    Port,
    Vid,
    Pid,
}

/// Lifecycle/IO failures distinct from a per-transfer [`XferStatus`]: these
/// mean the call itself couldn't be carried out, not that the device
/// answered with a protocol error.
#[derive(Debug)]
pub enum PortMapperError {
    UnknownDevice,
    Transport(Error),
}

impl From<Error> for PortMapperError {
    fn from(e: Error) -> PortMapperError {
        PortMapperError::Transport(e)
    }
}

/// Top-level handle for the whole bridge. Construct with [`PortMapper::sys_init`],
/// tear down with [`PortMapper::sys_deinit`].
pub struct PortMapper {
    callbacks: Arc<dyn Callbacks>,
    devices: Arc<Registry<DeviceState>>,
    requests: Arc<Registry<RequestEntry>>,
    locks: Arc<EndpointLocks>,
    dispatcher: Dispatcher,
    hotplug: Option<HotplugWatcher>,
}

impl PortMapper {
    /// §4.1/§6 `sys_init`. Runs the initial Topology Scan and dispatches
    /// `connected` for every attachable device found (root hubs themselves
    /// are never surfaced), then starts the Completion Dispatcher and
    /// Hotplug Watcher background threads.
    ///
    /// `log_level` is accepted for ABI-compatibility with the original
    /// call signature but otherwise unused: this crate logs through the
    /// `log` facade, whose filtering is owned by whatever logger the host
    /// process installs, not by a library deep in the call stack.
    pub fn sys_init(callbacks: Arc<dyn Callbacks>, log_level: log::LevelFilter) -> PortMapper {
        debug!("sys_init (log_level={log_level:?} forwarded to nothing; host owns the log filter)");

        for info in topology::scan() {
            if info.kind != DeviceKind::RootHub {
                callbacks.connected(&info);
            }
        }

        let locks = Arc::new(EndpointLocks::new());
        let requests = Arc::new(Registry::new());
        let dispatcher = Dispatcher::start(callbacks.clone(), locks.clone(), requests.clone());

        let hotplug = match HotplugWatcher::start(callbacks.clone()) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("hotplug watcher failed to start, continuing without live arrival/departure events: {e}");
                None
            }
        };

        PortMapper {
            callbacks,
            devices: Arc::new(Registry::new()),
            requests,
            locks,
            dispatcher,
            hotplug,
        }
    }

    /// §6 `sys_deinit`. Consuming `self` stops the Hotplug Watcher and
    /// Completion Dispatcher threads (their `Drop` impls close the channel
    /// and join), then drops every still-attached `DeviceState`.
    pub fn sys_deinit(self) {
        drop(self);
    }

    /// §4.3 `init`: opens the device and returns a handle for it.
    pub fn init(&self, info: NativeDeviceInfo) -> Result<DeviceHandle, PortMapperError> {
        let state = DeviceState::open(info)?;
        let (index, generation) = self.devices.insert(state);
        Ok(DeviceHandle::new(index, generation))
    }

    /// §4.3 `deinit`: releases the device. A stale or already-removed handle
    /// is a silent no-op, matching the rest of the handle surface.
    pub fn deinit(&self, device: DeviceHandle) {
        if let Some(state) = self.devices.remove(device.index(), device.generation()) {
            state.close();
        }
    }

    /// §4.3 `reset`.
    pub fn reset(&self, device: DeviceHandle) -> Result<(), PortMapperError> {
        match self.devices.with_mut(device.index(), device.generation(), DeviceState::reset) {
            Some(result) => result.map_err(PortMapperError::from),
            None => Err(PortMapperError::UnknownDevice),
        }
    }

    /// §4.6/§6 `data`: submits the prepared span of `xfer` as a bulk,
    /// interrupt or isochronous-IN transfer and hands the resulting future
    /// to the Completion Dispatcher. Returns [`XferStatus::Pending`] once
    /// the transfer is in flight; the eventual outcome arrives through
    /// [`Callbacks::notify`].
    pub fn data(&self, device: DeviceHandle, xfer: &XferHandle, dir_in: bool, epctx: u8) -> XferStatus {
        let ep = match self
            .devices
            .get(device.index(), device.generation(), |s| s.endpoints.slot(dir_in, epctx).copied())
        {
            Some(Some(ep)) => ep,
            _ => return XferStatus::IoError,
        };

        if matches!(ep.ty, EpType::Iso) && !dir_in {
            // isochronous OUT has no transport-library entry point to submit
            // through (nusb exposes isochronous_in but not an OUT
            // counterpart); reject rather than silently dropping data.
            warn!("isochronous OUT is not supported on endpoint {epctx:#04x}");
            return XferStatus::IoError;
        }

        let interface = match self.devices.get(device.index(), device.generation(), |s| s.interface.clone()) {
            Some(Some(iface)) => iface,
            _ => return XferStatus::IoError,
        };

        let is_iso = matches!(ep.ty, EpType::Iso);
        let is_interrupt = matches!(ep.ty, EpType::Int);

        let prepared = {
            let mut guard = xfer.lock().unwrap();
            match prepare(&mut guard, &ep, is_iso) {
                PrepareOutcome::Rejected => return XferStatus::IoError,
                PrepareOutcome::ImmediateComplete => return XferStatus::Normal,
                PrepareOutcome::Ready(p) => p,
            }
        };

        let blk_head = prepared.blk_head;
        let blk_tail = prepared.blk_tail;

        let future: std::pin::Pin<Box<dyn std::future::Future<Output = RequestOutcome> + Send>> = if dir_in {
            match ep.ty {
                EpType::Iso => Box::pin(submit_iso_in(&interface, epctx, ep.packet_size() as usize, prepared)),
                _ => Box::pin(submit_bulk_or_int_in(&interface, epctx, is_interrupt, prepared)),
            }
        } else {
            // Safety: every Part/Full block in `prepared`'s span came from
            // this same `xfer`, just unlocked above; nothing else touches
            // the block ring between `prepare` and `pack_out`.
            let payload = unsafe { pack_out(&xfer.lock().unwrap(), &prepared) };
            Box::pin(submit_bulk_or_int_out(&interface, epctx, is_interrupt, prepared, payload))
        };

        self.submit(device, xfer, blk_head, blk_tail, future)
    }

    /// §4.5/§6 `request`: a synchronous control transfer, up to 300ms,
    /// blocking the calling context the same way the original ABI's
    /// `usb_dev_request` did. `block`, if present, is the optional data
    /// stage: `Some` for any request with `wLength > 0`, regardless of
    /// direction (the bytes themselves only matter for an OUT transfer;
    /// for IN it just needs to exist for the block/length pairing check).
    pub fn request(&self, device: DeviceHandle, xfer: &XferHandle, setup: SetupPacket, block: Option<&mut [u8]>) -> XferStatus {
        let has_block = block.is_some();
        let out_bytes: Vec<u8> = match &block {
            Some(slice) if !setup.is_in() => slice.to_vec(),
            _ => Vec::new(),
        };

        let result = self.devices.with_mut(device.index(), device.generation(), |state| {
            control::handle(state, setup, if has_block { Some(&out_bytes[..]) } else { None })
        });

        let Some(outcome) = result else {
            return XferStatus::IoError;
        };

        if let Some(dst) = block {
            if setup.is_in() {
                let n = outcome.data.len().min(dst.len());
                dst[..n].copy_from_slice(&outcome.data[..n]);
            }
        }

        let mut guard = xfer.lock().unwrap();
        let Some(status) = outcome.status else {
            // Invalid block/wLength pairing: leave the xfer exactly as it was.
            return guard.status;
        };
        guard.status = status;
        if let Some(returned) = outcome.returned {
            let blk_head = guard.head;
            let blk = guard.block_mut(blk_head);
            blk.bdone = returned as u32;
            blk.blen = (setup.w_length as usize).saturating_sub(returned) as u32;
        }
        status
    }

    /// §6 `info`: writes a fixed-width field into `out`, failing if its
    /// length doesn't exactly match the field's size.
    pub fn info(&self, device: DeviceHandle, kind: InfoKind, out: &mut [u8]) -> Result<(), ()> {
        match self.devices.get(device.index(), device.generation(), |s| write_info(s, kind, out)) {
            Some(r) => r,
            None => Err(()),
        }
    }

    /// §6 `free_request`: drops the core's bookkeeping for a request without
    /// aborting it. A request still in flight simply completes normally and
    /// the Completion Dispatcher's own cleanup becomes a no-op.
    pub fn free_request(&self, request: RequestHandle) {
        self.requests.remove(request.index(), request.generation());
    }

    /// §6 `cancel_request`: aborts the in-flight transport-library transfer.
    /// The Completion Dispatcher observes this as an `IoError` outcome, the
    /// same as any other cancellation (§7), with no stall mark.
    pub fn cancel_request(&self, request: RequestHandle) {
        let _ = self.requests.get(request.index(), request.generation(), |entry| entry.abort.abort());
    }

    fn submit(
        &self,
        device: DeviceHandle,
        xfer: &XferHandle,
        blk_head: usize,
        blk_tail: usize,
        future: std::pin::Pin<Box<dyn std::future::Future<Output = RequestOutcome> + Send>>,
    ) -> XferStatus {
        let (abortable_future, abort) = abortable(future);
        let wrapped = Box::pin(async move {
            match abortable_future.await {
                Ok(outcome) => outcome,
                Err(_aborted) => RequestOutcome {
                    blk_head,
                    blk_tail,
                    dir_in: true,
                    status: XferStatus::IoError,
                    bytes: Vec::new(),
                    frames: None,
                },
            }
        });

        let (index, generation) = self.requests.insert(RequestEntry {
            abort,
            xfer: xfer.clone(),
            blk_head,
        });
        let request = RequestHandle::new(index, generation);

        {
            let mut guard = xfer.lock().unwrap();
            guard.set_req(
                blk_head,
                Some(xfer::OutstandingRequest {
                    blk_head,
                    blk_tail,
                    request,
                }),
            );
        }

        self.dispatcher.submit(PendingTransfer {
            device,
            xfer: xfer.clone(),
            request,
            future: wrapped,
        });

        XferStatus::Pending
    }
}

fn write_info(state: &DeviceState, kind: InfoKind, out: &mut [u8]) -> Result<(), ()> {
    match kind {
        InfoKind::Version => write_exact(out, &[state.version]),
        InfoKind::Speed => write_exact(out, &[speed_code(state.handle.speed())]),
        InfoKind::Bus => write_exact(out, &[state.info.path.bus]),
        InfoKind::Port => {
            let port = if state.info.path.depth == 0 {
                0
            } else {
                state.info.path.path[state.info.path.depth as usize - 1]
            };
            write_exact(out, &[port])
        }
        InfoKind::Vid => write_exact(out, &state.info.vid.to_le_bytes()),
        InfoKind::Pid => write_exact(out, &state.info.pid.to_le_bytes()),
    }
}

fn write_exact(out: &mut [u8], bytes: &[u8]) -> Result<(), ()> {
    if out.len() != bytes.len() {
        return Err(());
    }
    out.copy_from_slice(bytes);
    Ok(())
}

/// §9: speed is read fresh off the transport-library handle on every call
/// rather than cached at `init` time, since it can legitimately change
/// across a reset. `nusb::Speed` is `#[non_exhaustive]`, so the catch-all
/// covers any speed grade added to the crate after this was written.
fn speed_code(speed: Option<nusb::Speed>) -> u8 {
    match speed {
        None => 0,
        Some(nusb::Speed::Low) => 1,
        Some(nusb::Speed::Full) => 2,
        Some(nusb::Speed::High) => 3,
        Some(nusb::Speed::Super) => 4,
        Some(nusb::Speed::SuperPlus) => 5,
        Some(_) => 0xff,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_exact_rejects_mismatched_length() {
        let mut out = [0u8; 2];
        assert_eq!(write_exact(&mut out, &[1]), Err(()));
        assert_eq!(write_exact(&mut out, &[1, 2]), Ok(()));
        assert_eq!(out, [1, 2]);
    }

    #[test]
    fn speed_code_has_a_fallback_for_future_variants() {
        assert_eq!(speed_code(None), 0);
        assert_eq!(speed_code(Some(nusb::Speed::Low)), 1);
    }
}
