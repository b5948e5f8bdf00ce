//! Topological device addressing.
//!
//! A [`DevicePath`] is stable across enumerations while a device stays
//! attached, which is what lets the Hotplug Watcher and Topology Scanner
//! agree on device identity without a persistent handle.

use nusb::DeviceInfo;

/// Maximum hub depth a path can express. Devices discovered deeper than this
/// are dropped (with a warning) rather than truncated, since a truncated
/// path could alias a different device.
pub const MAX_TIERS: usize = 7;

/// Hub-relative topological address of a device: bus number plus the chain
/// of downstream hub ports from the root hub down to the device itself.
///
/// `path[0] == 0` marks the entry as a root hub (a virtual device, not an
/// attachable one); `path[i]` for `0 < i < depth` is the downstream port
/// number of the hub at tier `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePath {
    pub bus: u8,
    pub depth: u8,
    pub path: [u8; MAX_TIERS],
}

impl DevicePath {
    /// Builds a path from a bus number and the hub port chain, as reported by
    /// the transport library's `port_chain()`. Returns `None` if the chain is
    /// deeper than [`MAX_TIERS`] (caller logs and drops the device).
    pub fn from_port_chain(bus: u8, port_chain: &[u8]) -> Option<DevicePath> {
        if port_chain.len() > MAX_TIERS {
            return None;
        }
        let mut path = [0u8; MAX_TIERS];
        path[..port_chain.len()].copy_from_slice(port_chain);
        Some(DevicePath {
            bus,
            depth: port_chain.len() as u8,
            path,
        })
    }

    /// A root hub itself has an empty port chain and is represented with
    /// `depth == 0` and an all-zero path; `path[0] == 0` is the root-hub marker.
    pub fn root_hub(bus: u8) -> DevicePath {
        DevicePath {
            bus,
            depth: 0,
            path: [0; MAX_TIERS],
        }
    }

    pub fn is_root_hub(&self) -> bool {
        self.path[0] == 0
    }

    /// A device is a direct child of a root hub iff tier 1 of its path is 0
    /// (i.e. its parent, at `path[0]`, has no further hub above it besides
    /// the root).
    pub fn is_root_hub_child(&self) -> bool {
        self.depth >= 1 && (self.depth < 2 || self.path[1] == 0)
    }
}

/// What a [`DevicePath`] was classified as by the Topology Scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// A root hub itself. Never exposed to the front-end as attachable.
    RootHub,
    /// A device hanging directly off a root hub port.
    RootHubSubDev,
    /// An external (non-root) hub.
    ExtHub,
    /// A device hanging off an external hub's downstream port.
    ExtHubSubDev,
}

/// A native USB device record, as produced by the Topology Scanner or
/// Hotplug Watcher and consumed by the front-end's connect callback.
#[derive(Debug, Clone)]
pub struct NativeDeviceInfo {
    pub path: DevicePath,
    pub speed: Option<nusb::Speed>,
    pub vid: u16,
    pub pid: u16,
    pub bcd_usb: u16,
    pub kind: DeviceKind,
    /// Downstream port count, for `ExtHub` entries. `0` if unknown or not a hub.
    pub max_child: u8,
    /// The transport library's own enumeration record; reopen via `.open()`.
    pub handle: DeviceInfo,
}

const CLASS_HUB: u8 = 0x09;

impl NativeDeviceInfo {
    /// Classifies a device given its path and class code, per §4.1.
    pub(crate) fn classify(path: &DevicePath, device_class: u8) -> DeviceKind {
        if path.is_root_hub() {
            DeviceKind::RootHub
        } else if device_class == CLASS_HUB {
            DeviceKind::ExtHub
        } else if path.is_root_hub_child() {
            DeviceKind::RootHubSubDev
        } else {
            DeviceKind::ExtHubSubDev
        }
    }
}

/// Maps a device descriptor's `bcdUSB` field to the USB major version this
/// core understands. Anything other than USB 1.1/2.x/3.x rejects attach.
pub fn usb_version_from_bcd(bcd_usb: u16) -> Option<u8> {
    match bcd_usb >> 8 {
        0x03 => Some(3),
        0x02 => Some(2),
        0x01 if bcd_usb == 0x0110 => Some(2),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_hub_path_is_root_hub() {
        let p = DevicePath::root_hub(1);
        assert!(p.is_root_hub());
    }

    #[test]
    fn child_of_root_hub_is_classified_as_root_hub_child() {
        let p = DevicePath::from_port_chain(1, &[3]).unwrap();
        assert!(!p.is_root_hub());
        assert!(p.is_root_hub_child());
        assert_eq!(
            NativeDeviceInfo::classify(&p, 0x00),
            DeviceKind::RootHubSubDev
        );
    }

    #[test]
    fn grandchild_is_ext_hub_subdev() {
        let p = DevicePath::from_port_chain(1, &[3, 1]).unwrap();
        assert!(!p.is_root_hub_child());
        assert_eq!(
            NativeDeviceInfo::classify(&p, 0x00),
            DeviceKind::ExtHubSubDev
        );
    }

    #[test]
    fn hub_class_overrides_depth_classification() {
        let p = DevicePath::from_port_chain(1, &[3, 1]).unwrap();
        assert_eq!(NativeDeviceInfo::classify(&p, CLASS_HUB), DeviceKind::ExtHub);
    }

    #[test]
    fn path_beyond_max_tiers_is_dropped() {
        let chain = [1u8; MAX_TIERS + 1];
        assert!(DevicePath::from_port_chain(1, &chain).is_none());
    }

    #[test]
    fn bcd_usb_version_mapping() {
        assert_eq!(usb_version_from_bcd(0x0300), Some(3));
        assert_eq!(usb_version_from_bcd(0x0310), Some(3));
        assert_eq!(usb_version_from_bcd(0x0200), Some(2));
        assert_eq!(usb_version_from_bcd(0x0110), Some(2));
        assert_eq!(usb_version_from_bcd(0x0100), None);
        assert_eq!(usb_version_from_bcd(0x0400), None);
    }
}
