//! Descriptor Patcher: forces UAS-capable mass-storage interfaces to fall
//! back to bulk-only transport by zeroing their protocol byte.

use crate::error::{err, Error};

const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
const INTERFACE_DESCRIPTOR_LEN: u8 = 9;
const PROTOCOL_OFFSET: usize = 7;
const UAS_PROTOCOL: u8 = 0x62;

/// §4.8. Walks the concatenated descriptor list of a `GET_DESCRIPTOR
/// (CONFIGURATION)` response and zeroes `bInterfaceProtocol` on any
/// interface descriptor advertising UAS (0x62), forcing the mass-storage
/// bulk-only fallback. Idempotent: a second pass is a no-op.
pub fn patch_configuration_descriptor(buf: &mut [u8]) -> Result<(), Error> {
    if buf.len() < 2 {
        return Err(err(std::io::ErrorKind::InvalidData, "descriptor buffer too short"));
    }
    if buf[1] != DESCRIPTOR_TYPE_CONFIGURATION {
        return Err(err(std::io::ErrorKind::InvalidData, "not a configuration descriptor"));
    }

    let mut i = 0usize;
    while i < buf.len() {
        let len = buf[i];
        if len == 0 {
            // Malformed descriptor; stop rather than loop forever.
            break;
        }
        let len = len as usize;

        if len == INTERFACE_DESCRIPTOR_LEN as usize
            && i + 1 < buf.len()
            && buf[i + 1] == DESCRIPTOR_TYPE_INTERFACE
            && i + PROTOCOL_OFFSET < buf.len()
            && buf[i + PROTOCOL_OFFSET] == UAS_PROTOCOL
        {
            buf[i + PROTOCOL_OFFSET] = 0;
        }

        i += len;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uas_interface_descriptor() -> Vec<u8> {
        vec![9, 0x04, 0, 0, 2, 0x08, 0x06, 0x62, 0]
    }

    #[test]
    fn zeroes_uas_protocol_byte() {
        let mut buf = vec![2, DESCRIPTOR_TYPE_CONFIGURATION];
        buf.extend(uas_interface_descriptor());
        patch_configuration_descriptor(&mut buf).unwrap();
        assert_eq!(buf[2 + PROTOCOL_OFFSET], 0);
    }

    #[test]
    fn leaves_non_uas_interfaces_untouched() {
        let mut iface = uas_interface_descriptor();
        iface[PROTOCOL_OFFSET] = 0x50;
        let mut buf = vec![2, DESCRIPTOR_TYPE_CONFIGURATION];
        buf.extend(iface);
        let original = buf.clone();
        patch_configuration_descriptor(&mut buf).unwrap();
        assert_eq!(buf, original);
    }

    #[test]
    fn idempotent_across_two_passes() {
        let mut buf = vec![2, DESCRIPTOR_TYPE_CONFIGURATION];
        buf.extend(uas_interface_descriptor());
        patch_configuration_descriptor(&mut buf).unwrap();
        let once = buf.clone();
        patch_configuration_descriptor(&mut buf).unwrap();
        assert_eq!(buf, once);
    }

    #[test]
    fn zero_length_descriptor_terminates_walk_without_panicking() {
        let mut buf = vec![2, DESCRIPTOR_TYPE_CONFIGURATION, 0, 0xff, 0xff];
        assert!(patch_configuration_descriptor(&mut buf).is_ok());
    }

    #[test]
    fn rejects_buffer_not_starting_with_configuration_type() {
        let mut buf = vec![9, DESCRIPTOR_TYPE_INTERFACE];
        assert!(patch_configuration_descriptor(&mut buf).is_err());
    }
}
