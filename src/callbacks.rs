//! The front-end's callback surface, collected into a single trait object
//! injected at construction instead of a process-wide table of function
//! pointers (§9: "Re-architect the six function-pointer global context into
//! an explicit interface value").

use std::sync::{Arc, Mutex};

use crate::handles::DeviceHandle;
use crate::path::NativeDeviceInfo;
use crate::xfer::Xfer;

/// Operations the emulated host controller front-end must provide. A single
/// `Arc<dyn Callbacks>` is shared between the `PortMapper`, the Completion
/// Dispatcher thread, and the Hotplug Watcher thread; there is no
/// process-wide mutable singleton.
pub trait Callbacks: Send + Sync {
    /// A device arrived (hotplug, or part of the initial scan). May
    /// synchronously call back into `PortMapper::init`.
    fn connected(&self, info: &NativeDeviceInfo);

    /// A device departed. Must unwind any outstanding `Device` for this path.
    fn disconnected(&self, info: &NativeDeviceInfo);

    /// A transfer completed. Returning `true` requests an interrupt be
    /// raised to the guest via [`Callbacks::interrupt`].
    fn notify(&self, device: DeviceHandle, xfer: &mut Xfer) -> bool;

    /// Raise a guest interrupt. Only called when `notify` returned `true`.
    fn interrupt(&self, device: DeviceHandle);
}

/// Per-`(device, endpoint id)` mutual exclusion for the scatter/notify
/// critical section (§9: "a map from (device_id, epid) to a mutex, held only
/// across the scatter/notify critical section").
#[derive(Default)]
pub struct EndpointLocks {
    locks: Mutex<std::collections::HashMap<(DeviceHandle, u8), Arc<Mutex<()>>>>,
}

impl EndpointLocks {
    pub fn new() -> EndpointLocks {
        EndpointLocks::default()
    }

    fn lock_for(&self, device: DeviceHandle, epid: u8) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry((device, epid))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs `f` while holding the `(device, epid)` lock. Never call this
    /// while already holding the same lock, or across an allocator call or
    /// any `nusb` entry point beyond what `f` itself needs for the scatter
    /// and notify step.
    pub fn with_lock<R>(&self, device: DeviceHandle, epid: u8, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(device, epid);
        let _guard = lock.lock().unwrap();
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_endpoints_get_distinct_locks() {
        let locks = EndpointLocks::new();
        let d = DeviceHandle::new(0, 0);
        let a = locks.lock_for(d, 0x81);
        let b = locks.lock_for(d, 0x02);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn same_endpoint_reuses_lock() {
        let locks = EndpointLocks::new();
        let d = DeviceHandle::new(0, 0);
        let a = locks.lock_for(d, 0x81);
        let b = locks.lock_for(d, 0x81);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
