//! Control Request Handler: intercepts the requests that change device
//! state the core itself tracks, forwards everything else synchronously.

use std::time::{Duration, Instant};

use nusb::transfer::{Control, ControlIn, ControlOut, ControlType, Recipient};
use nusb::MaybeFuture;

use crate::descriptor_patch::patch_configuration_descriptor;
use crate::device::DeviceState;
use crate::error::{map_control_completion, XferStatus};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(300);

const STANDARD_REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const STANDARD_REQUEST_SET_ADDRESS: u8 = 0x05;
const STANDARD_REQUEST_SET_CONFIGURATION: u8 = 0x09;
const STANDARD_REQUEST_SET_INTERFACE: u8 = 0x0b;
const STANDARD_REQUEST_CLEAR_FEATURE: u8 = 0x01;
const FEATURE_ENDPOINT_HALT: u16 = 0x00;

const RECIPIENT_MASK: u8 = 0x1f;
const RECIPIENT_DEVICE: u8 = 0x00;
const RECIPIENT_INTERFACE: u8 = 0x01;
const RECIPIENT_ENDPOINT: u8 = 0x02;
const DIR_IN: u8 = 0x80;
const TYPE_MASK: u8 = 0x60;

const DESCRIPTOR_TYPE_CONFIGURATION: u16 = 0x0200;

/// The eight setup bytes of a control transfer, as decoded from the guest's
/// `usb_xfer` by the front-end before calling into this handler.
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    fn recipient(self) -> u8 {
        self.bm_request_type & RECIPIENT_MASK
    }

    fn is_standard(self) -> bool {
        self.bm_request_type & TYPE_MASK == 0
    }

    /// Decodes `bmRequestType`'s type bits for forwarding, so a forwarded
    /// Class/Vendor request reaches the device with the same wire
    /// `bmRequestType` the guest issued.
    fn control_type(self) -> ControlType {
        match self.bm_request_type & TYPE_MASK {
            0x00 => ControlType::Standard,
            0x20 => ControlType::Class,
            0x40 => ControlType::Vendor,
            _ => ControlType::Reserved,
        }
    }

    /// Whether the data stage (if any) flows device-to-host.
    pub fn is_in(self) -> bool {
        self.bm_request_type & DIR_IN != 0
    }
}

/// Outcome of handling one control request: the status to write into the
/// xfer (`None` for an invalid block/wLength pairing, which leaves a
/// previously-completed xfer's status untouched per §4.5), the data to
/// scatter back for a forwarded IN transfer, and how many bytes were
/// actually transferred by a forwarded request (`None` for an intercepted
/// request, which has no data stage to account for in the block ring).
pub struct ControlOutcome {
    pub status: Option<XferStatus>,
    pub data: Vec<u8>,
    pub returned: Option<usize>,
}

impl ControlOutcome {
    fn unchanged() -> ControlOutcome {
        ControlOutcome {
            status: None,
            data: Vec::new(),
            returned: None,
        }
    }

    fn status(status: XferStatus) -> ControlOutcome {
        ControlOutcome {
            status: Some(status),
            data: Vec::new(),
            returned: None,
        }
    }
}

/// A `(block present, wLength > 0)` pairing is valid only when both hold or
/// neither does; anything else leaves the xfer untouched (§4.5).
fn is_valid_pairing(has_block: bool, has_length: bool) -> bool {
    has_block == has_length
}

/// §4.5. `block` is the data stage, if any (`None` for a zero-length
/// request).
pub fn handle(device: &mut DeviceState, setup: SetupPacket, block: Option<&[u8]>) -> ControlOutcome {
    if !is_valid_pairing(block.is_some(), setup.w_length > 0) {
        return ControlOutcome::unchanged();
    }

    if setup.is_standard() {
        match (setup.recipient(), setup.b_request) {
            (RECIPIENT_DEVICE, STANDARD_REQUEST_SET_ADDRESS) => {
                device.address = setup.w_value;
                return ControlOutcome::status(XferStatus::Normal);
            }
            (RECIPIENT_DEVICE, STANDARD_REQUEST_SET_CONFIGURATION) => {
                let value = (setup.w_value & 0xff) as u8;
                return match device.set_config(value) {
                    Ok(()) => ControlOutcome::status(XferStatus::Normal),
                    Err(_) => ControlOutcome::status(XferStatus::Stalled),
                };
            }
            (RECIPIENT_INTERFACE, STANDARD_REQUEST_SET_INTERFACE) => {
                let iface = (setup.w_index & 0xff) as u8;
                let alt = (setup.w_value & 0xff) as u8;
                return match device.set_if(iface, alt) {
                    Ok(()) => ControlOutcome::status(XferStatus::Normal),
                    Err(_) => ControlOutcome::status(XferStatus::Stalled),
                };
            }
            (RECIPIENT_ENDPOINT, STANDARD_REQUEST_CLEAR_FEATURE) => {
                if setup.w_value != FEATURE_ENDPOINT_HALT {
                    return ControlOutcome::status(XferStatus::Stalled);
                }
                let epid = (setup.w_index & 0xff) as u8;
                return match device.clear_halt(epid) {
                    Ok(()) => ControlOutcome::status(XferStatus::Normal),
                    Err(_) => ControlOutcome::status(XferStatus::Stalled),
                };
            }
            _ => {}
        }
    }

    forward(device, setup, block)
}

fn forward(device: &mut DeviceState, setup: SetupPacket, block: Option<&[u8]>) -> ControlOutcome {
    let control = Control {
        control_type: setup.control_type(),
        recipient: match setup.recipient() {
            RECIPIENT_INTERFACE => Recipient::Interface,
            RECIPIENT_ENDPOINT => Recipient::Endpoint,
            RECIPIENT_DEVICE => Recipient::Device,
            _ => Recipient::Other,
        },
        request: setup.b_request,
        value: setup.w_value,
        index: setup.w_index,
    };

    let requested_len = setup.w_length as usize;
    let start = Instant::now();

    let (result, mut data) = if setup.is_in() {
        match submit_in(device, control, requested_len, CONTROL_TIMEOUT) {
            Ok(bytes) => {
                let n = bytes.len();
                (Ok(n), bytes)
            }
            Err(e) => (Err(e), Vec::new()),
        }
    } else {
        let payload = block.unwrap_or(&[]);
        (submit_out(device, control, payload, CONTROL_TIMEOUT), Vec::new())
    };

    let (status, returned) = map_control_completion(result, requested_len, start.elapsed(), CONTROL_TIMEOUT);

    if matches!(status, XferStatus::Normal | XferStatus::ShortXfer) {
        data.truncate(returned);
        if setup.is_in()
            && setup.recipient() == RECIPIENT_DEVICE
            && setup.b_request == STANDARD_REQUEST_GET_DESCRIPTOR
            && setup.w_value == DESCRIPTOR_TYPE_CONFIGURATION
        {
            if let Err(e) = patch_configuration_descriptor(&mut data) {
                log::warn!("configuration descriptor patch skipped: {e}");
            }
        }
    } else {
        data.clear();
    }

    ControlOutcome {
        status: Some(status),
        data,
        returned: Some(returned),
    }
}

fn submit_in(
    device: &DeviceState,
    control: Control,
    length: usize,
    timeout: Duration,
) -> Result<Vec<u8>, nusb::transfer::TransferError> {
    if let Some(interface) = device.interface() {
        let mut buf = vec![0u8; length];
        interface
            .control_in_blocking(control, &mut buf, timeout)
            .map(|n| {
                buf.truncate(n);
                buf
            })
    } else {
        device
            .handle
            .control_in(ControlIn {
                control_type: control.control_type,
                recipient: control.recipient,
                request: control.request,
                value: control.value,
                index: control.index,
                length: length as u16,
            })
            .wait()
            .into_result()
    }
}

fn submit_out(
    device: &DeviceState,
    control: Control,
    data: &[u8],
    timeout: Duration,
) -> Result<usize, nusb::transfer::TransferError> {
    if let Some(interface) = device.interface() {
        interface.control_out_blocking(control, data, timeout)
    } else {
        let len = data.len();
        device
            .handle
            .control_out(ControlOut {
                control_type: control.control_type,
                recipient: control.recipient,
                request: control.request,
                value: control.value,
                index: control.index,
                data,
            })
            .wait()
            .into_result()
            .map(|()| len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_requires_block_and_length_to_agree() {
        assert!(is_valid_pairing(true, true));
        assert!(is_valid_pairing(false, false));
        assert!(!is_valid_pairing(true, false));
        assert!(!is_valid_pairing(false, true));
    }

    #[test]
    fn clear_feature_rejects_nonzero_value() {
        assert_ne!(FEATURE_ENDPOINT_HALT, 1);
    }

    #[test]
    fn control_type_decodes_from_type_bits() {
        let mk = |bm: u8| SetupPacket {
            bm_request_type: bm,
            b_request: 0,
            w_value: 0,
            w_index: 0,
            w_length: 0,
        };
        assert_eq!(mk(0x00).control_type(), ControlType::Standard);
        assert_eq!(mk(0x20).control_type(), ControlType::Class);
        assert_eq!(mk(0x40).control_type(), ControlType::Vendor);
        assert_eq!(mk(0x60).control_type(), ControlType::Reserved);
        // direction and recipient bits must not affect the type decode
        assert_eq!(mk(0xa1).control_type(), ControlType::Class);
    }

    #[test]
    fn recipient_and_direction_decode_from_bm_request_type() {
        let setup = SetupPacket {
            bm_request_type: 0x81,
            b_request: STANDARD_REQUEST_GET_DESCRIPTOR,
            w_value: 0x0300,
            w_index: 0,
            w_length: 255,
        };
        assert!(setup.is_in());
        assert!(setup.is_standard());
        assert_eq!(setup.recipient(), RECIPIENT_INTERFACE);
    }
}
