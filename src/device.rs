//! Device Manager: per-device lifecycle (open, detach/claim, reset, close,
//! reattach) plus the endpoint table mirroring the active configuration.

use std::collections::BTreeSet;

use log::{debug, warn};
use nusb::descriptors::ConfigurationDescriptor;
use nusb::MaybeFuture;

use crate::endpoint::EndpointTable;
use crate::error::{err, Error};
use crate::path::{usb_version_from_bcd, NativeDeviceInfo};

pub const MAX_INTERFACE: usize = crate::endpoint::MAX_INTERFACE;

/// All state the core keeps for one attached device, reached through a
/// [`crate::handles::DeviceHandle`]. Interior mutability is the registry's
/// job (`Registry::with_mut`), not this type's: every method here takes
/// `&mut self` and assumes exclusive access has already been arranged.
pub struct DeviceState {
    pub info: NativeDeviceInfo,
    pub version: u8,
    pub handle: nusb::Device,
    pub interface: Option<nusb::Interface>,
    pub configuration: u8,
    pub if_count: u8,
    pub alt_settings: [u8; MAX_INTERFACE],
    pub address: u16,
    pub endpoints: EndpointTable,
}

impl DeviceState {
    /// §4.3 `init`: reject root hubs, validate the USB version, open the
    /// device and detach kernel drivers from every interface of the active
    /// configuration. The device is left unclaimed; claiming happens on the
    /// guest's first SET_CONFIGURATION.
    pub fn open(info: NativeDeviceInfo) -> Result<DeviceState, Error> {
        if info.path.is_root_hub() {
            return Err(err(std::io::ErrorKind::InvalidInput, "refusing to attach a root hub"));
        }
        let version = usb_version_from_bcd(info.bcd_usb)
            .ok_or_else(|| err(std::io::ErrorKind::InvalidInput, format!("unsupported bcdUSB {:#06x}", info.bcd_usb)))?;

        let handle = info.handle.open().wait().map_err(|e| {
            warn!("failed to open device {:04x}:{:04x}: {e}", info.vid, info.pid);
            e
        })?;

        if let Some(config) = active_configuration(&handle) {
            for iface in interface_numbers(&config) {
                if let Err(e) = handle.detach_kernel_driver(iface) {
                    debug!("no kernel driver to detach on interface {iface}: {e}");
                }
            }
        }

        debug!("opened device {:04x}:{:04x} at {:?}", info.vid, info.pid, info.path);

        Ok(DeviceState {
            info,
            version,
            handle,
            interface: None,
            configuration: 0,
            if_count: 0,
            alt_settings: [0; MAX_INTERFACE],
            address: 0,
            endpoints: EndpointTable::reset(),
        })
    }

    /// §4.3 `deinit`: reattach kernel drivers best-effort, then drop the
    /// handle. Takes the state by value since the registry entry is removed
    /// at the same time.
    pub fn close(mut self) {
        self.release_interface();
        if let Some(config) = active_configuration(&self.handle) {
            for iface in interface_numbers(&config) {
                if let Err(e) = self.handle.attach_kernel_driver(iface) {
                    warn!("failed to reattach kernel driver on interface {iface}: {e}");
                }
            }
        }
        debug!("closed device {:04x}:{:04x}", self.info.vid, self.info.pid);
    }

    /// §4.3 `reset`: exactly one transport-library reset followed by an
    /// endpoint-table rebuild (the original issues a redundant second reset;
    /// see design notes).
    pub fn reset(&mut self) -> Result<(), Error> {
        self.handle.reset().wait()?;
        self.rebuild_endpoints();
        Ok(())
    }

    /// §4.3 configuration handling: detach, release, reconfigure, re-claim,
    /// rebuild. Any failure here is surfaced to the caller, which (per §4.5)
    /// sets the xfer status to `STALLED`.
    pub fn set_config(&mut self, value: u8) -> Result<(), Error> {
        self.release_interface();

        if let Some(config) = active_configuration(&self.handle) {
            for iface in interface_numbers(&config) {
                if let Err(e) = self.handle.detach_kernel_driver(iface) {
                    debug!("no kernel driver to detach on interface {iface}: {e}");
                }
            }
        }

        self.handle.set_configuration(value).wait()?;
        self.configuration = value;

        let Some(config) = active_configuration(&self.handle) else {
            self.endpoints = EndpointTable::reset();
            return Ok(());
        };
        let ifaces = interface_numbers(&config);
        self.if_count = ifaces.len() as u8;

        // Only interface 0 is tracked in the endpoint table (known
        // limitation, §9); every interface is still claimed so none are left
        // attached to a kernel driver, matching the guest's expectation that
        // the whole active configuration is now owned by this handle.
        for iface in &ifaces {
            let claimed = self.handle.claim_interface(*iface).wait()?;
            if *iface == 0 {
                self.rebuild_endpoints_from(&claimed);
                self.interface = Some(claimed);
            }
        }
        if !ifaces.contains(&0) {
            self.endpoints = EndpointTable::reset();
        }

        debug!("device {:04x}:{:04x} configuration set to {value}", self.info.vid, self.info.pid);
        Ok(())
    }

    /// §4.3 `set_if`: rejects out-of-range interfaces, applies the alt
    /// setting and rebuilds the endpoint table (interface 0 only).
    pub fn set_if(&mut self, iface: u8, alt: u8) -> Result<(), Error> {
        if iface as usize >= MAX_INTERFACE {
            return Err(err(std::io::ErrorKind::InvalidInput, "interface index out of range"));
        }
        self.alt_settings[iface as usize] = alt;

        if iface == 0 {
            let Some(interface) = &self.interface else {
                return Err(err(std::io::ErrorKind::NotConnected, "interface 0 not claimed"));
            };
            interface.set_alt_setting(alt).wait()?;
            self.rebuild_endpoints();
        }
        Ok(())
    }

    /// Clears a halted bulk/interrupt endpoint, used by the Control Request
    /// Handler's `CLEAR_FEATURE(ENDPOINT_HALT)` intercept.
    pub fn clear_halt(&mut self, epid: u8) -> Result<(), Error> {
        let Some(interface) = &self.interface else {
            return Err(err(std::io::ErrorKind::NotConnected, "interface not claimed"));
        };
        interface.clear_halt(epid).wait()
    }

    /// The claimed interface, if any, used by the Control Request Handler to
    /// forward non-intercepted requests.
    pub fn interface(&self) -> Option<&nusb::Interface> {
        self.interface.as_ref()
    }

    fn release_interface(&mut self) {
        self.interface = None;
        self.endpoints = EndpointTable::reset();
    }

    fn rebuild_endpoints(&mut self) {
        if let Some(interface) = self.interface.take() {
            self.rebuild_endpoints_from(&interface);
            self.interface = Some(interface);
        } else {
            self.endpoints = EndpointTable::reset();
        }
    }

    fn rebuild_endpoints_from(&mut self, interface: &nusb::Interface) {
        self.endpoints.update(interface);
    }
}

fn active_configuration(handle: &nusb::Device) -> Option<ConfigurationDescriptor> {
    handle.active_configuration().ok()
}

fn interface_numbers(config: &ConfigurationDescriptor) -> BTreeSet<u8> {
    config
        .interface_alt_settings()
        .map(|d| d.interface_number())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{DeviceKind, DevicePath};

    #[test]
    fn root_hub_path_is_classified_before_open_would_touch_it() {
        // `open` checks `info.path.is_root_hub()` before doing any I/O;
        // a real nusb::DeviceInfo isn't constructible in a unit test, so
        // this exercises the same predicate the guard relies on.
        let path = DevicePath::root_hub(0);
        assert!(path.is_root_hub());
        assert_eq!(NativeDeviceInfo::classify(&path, 0x00), DeviceKind::RootHub);
    }
}
