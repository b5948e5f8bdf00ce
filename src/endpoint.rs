//! Endpoint Table: per-device mirror of the active configuration/alt
//! setting's endpoint descriptors.

use nusb::transfer::TransferType;
use nusb::Interface;

/// Upper bound on interfaces tracked per device. An implementation choice
/// (the ABI only requires "implementation choices >= 16"); picked generously
/// since the table is a flat array, not one entry per actual interface.
pub const MAX_INTERFACE: usize = 32;

/// Upper bound on endpoint numbers (0..NUM_ENDPOINT), each with independent
/// IN and OUT slots.
pub const NUM_ENDPOINT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    Out,
    In,
}

/// Endpoint transfer type, with `Invalid` marking a slot with no live
/// endpoint in the current alt setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpType {
    Control,
    Iso,
    Bulk,
    Int,
    Invalid,
}

impl EpType {
    /// Data Transfer Engine rejects anything past `Int` in this ordering;
    /// `Control` transfers go through the Control Request Handler instead,
    /// so a `data()` call can never target endpoint type `Control`.
    pub fn data_transfer_rank(self) -> u8 {
        match self {
            EpType::Iso => 0,
            EpType::Bulk => 1,
            EpType::Int => 2,
            EpType::Control => 3,
            EpType::Invalid => 4,
        }
    }

    pub fn from_nusb(t: TransferType) -> EpType {
        match t {
            TransferType::Control => EpType::Control,
            TransferType::Isochronous => EpType::Iso,
            TransferType::Bulk => EpType::Bulk,
            TransferType::Interrupt => EpType::Int,
        }
    }
}

/// One endpoint table slot. `maxp` is the raw `wMaxPacketSize` value from the
/// endpoint descriptor: low 11 bits are the packet size, bits 11-12 are the
/// transactions-per-microframe multiplier minus one.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    pub pid: Pid,
    pub ty: EpType,
    pub maxp: u16,
}

impl Endpoint {
    fn invalid(pid: Pid) -> Endpoint {
        Endpoint {
            pid,
            ty: EpType::Invalid,
            maxp: 0,
        }
    }

    pub fn packet_size(&self) -> u16 {
        self.maxp & 0x7ff
    }

    /// Transactions per microframe; `1` for endpoints that don't use the
    /// high-bandwidth encoding.
    pub fn mult(&self) -> u16 {
        ((self.maxp >> 11) & 0x3) + 1
    }

    /// Maximum bytes deliverable in one isochronous service interval.
    pub fn frame_size(&self) -> u32 {
        self.packet_size() as u32 * self.mult() as u32
    }
}

/// The endpoint table for one device: the control endpoint plus
/// [`NUM_ENDPOINT`] IN and OUT slots, mirroring interface 0's active alt
/// setting (see §9: composite multi-interface devices are a known
/// limitation, not fixed here).
#[derive(Debug, Clone)]
pub struct EndpointTable {
    pub control: Endpoint,
    pub in_eps: [Endpoint; NUM_ENDPOINT],
    pub out_eps: [Endpoint; NUM_ENDPOINT],
}

impl EndpointTable {
    /// `reset_ep`: control becomes `Control`, every IN/OUT slot becomes
    /// `Invalid` with its direction pinned.
    pub fn reset() -> EndpointTable {
        EndpointTable {
            control: Endpoint {
                pid: Pid::Out,
                ty: EpType::Control,
                maxp: 64,
            },
            in_eps: [Endpoint::invalid(Pid::In); NUM_ENDPOINT],
            out_eps: [Endpoint::invalid(Pid::Out); NUM_ENDPOINT],
        }
    }

    pub fn slot(&self, dir_in: bool, ep_num: u8) -> Option<&Endpoint> {
        let table = if dir_in { &self.in_eps } else { &self.out_eps };
        table.get(ep_num as usize)
    }

    fn slot_mut(&mut self, dir_in: bool, ep_num: u8) -> Option<&mut Endpoint> {
        let table = if dir_in {
            &mut self.in_eps
        } else {
            &mut self.out_eps
        };
        table.get_mut(ep_num as usize)
    }

    /// `update_ep`: rebuilds the table from interface 0's current alt
    /// setting in the device's active configuration. Any configuration
    /// lacking a matching descriptor leaves the table freshly reset (all
    /// slots invalid) rather than stale.
    pub fn update(&mut self, interface: &Interface) {
        *self = EndpointTable::reset();

        let Some(desc) = interface.descriptor() else {
            return;
        };

        for ep in desc.endpoints() {
            let addr = ep.address();
            let dir_in = addr & 0x80 != 0;
            let num = addr & 0x0f;
            let maxp = ep.max_packet_size() as u16;
            let ty = EpType::from_nusb(ep.transfer_type());

            if num == 0 {
                self.control = Endpoint {
                    pid: Pid::Out,
                    ty,
                    maxp,
                };
                continue;
            }

            if let Some(slot) = self.slot_mut(dir_in, num) {
                *slot = Endpoint {
                    pid: if dir_in { Pid::In } else { Pid::Out },
                    ty,
                    maxp,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_marks_all_eps_invalid_except_control() {
        let t = EndpointTable::reset();
        assert_eq!(t.control.ty, EpType::Control);
        assert!(t.in_eps.iter().all(|e| e.ty == EpType::Invalid));
        assert!(t.out_eps.iter().all(|e| e.ty == EpType::Invalid));
    }

    #[test]
    fn maxp_packs_packet_size_and_mult() {
        // 1024 byte packets, mult field = 1 (2 transactions/microframe) in bits 11-12.
        let ep = Endpoint {
            pid: Pid::In,
            ty: EpType::Iso,
            maxp: 1024 | (1 << 11),
        };
        assert_eq!(ep.packet_size(), 1024);
        assert_eq!(ep.mult(), 2);
        assert_eq!(ep.frame_size(), 2048);
    }

    #[test]
    fn maxp_default_mult_is_one() {
        let ep = Endpoint {
            pid: Pid::In,
            ty: EpType::Iso,
            maxp: 512,
        };
        assert_eq!(ep.mult(), 1);
        assert_eq!(ep.frame_size(), 512);
    }

    #[test]
    fn data_transfer_rank_excludes_control() {
        assert!(EpType::Iso.data_transfer_rank() <= EpType::Int.data_transfer_rank());
        assert!(EpType::Control.data_transfer_rank() > EpType::Int.data_transfer_rank());
    }
}
