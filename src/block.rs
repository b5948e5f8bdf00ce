//! Block: one scatter/gather unit of a guest-owned transfer ring.
//!
//! Blocks reference memory owned by the front-end (the emulated host
//! controller, ultimately guest memory), so `buf` is a raw pointer the same
//! way `nusb`'s own platform backends hold raw URB buffer pointers across
//! the kernel ABI boundary (see `TransferData` in the Linux backend this
//! crate is built on top of).

use std::ptr;

/// Continuation semantics of a block within its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// Placeholder; consumes no transfer bytes.
    None,
    /// Continues the previous frame (isochronous) or transfer (bulk/interrupt).
    Part,
    /// Ends a frame.
    Full,
    /// Ring-wrap marker; not itself data.
    Link,
}

/// Lifecycle state of a block with respect to in-flight requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStat {
    Free,
    Handling,
    Handled,
}

/// One logical scatter/gather unit. `buf` is null for `None`/`Link` blocks.
#[derive(Debug, Clone, Copy)]
pub struct Block {
    pub buf: *mut u8,
    /// Bytes remaining to transfer.
    pub blen: u32,
    /// Bytes transferred so far.
    pub bdone: u32,
    pub ty: BlockType,
    pub stat: BlockStat,
}

unsafe impl Send for Block {}

impl Block {
    pub fn placeholder() -> Block {
        Block {
            buf: ptr::null_mut(),
            blen: 0,
            bdone: 0,
            ty: BlockType::None,
            stat: BlockStat::Free,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self.ty, BlockType::Part | BlockType::Full)
    }

    /// Copies up to `self.blen` bytes out of `self.buf` (OUT direction,
    /// linearizing into a request buffer).
    ///
    /// # Safety
    /// `self.buf` must be valid for `self.blen` bytes for the lifetime of the call.
    pub unsafe fn read_into(&self, dst: &mut [u8]) -> usize {
        if !self.is_data() || self.buf.is_null() {
            return 0;
        }
        let n = (self.blen as usize).min(dst.len());
        unsafe {
            ptr::copy_nonoverlapping(self.buf, dst.as_mut_ptr(), n);
        }
        n
    }

    /// Copies up to `min(done, self.blen)` bytes into `self.buf` (IN
    /// direction, scattering a completion back into guest memory), updating
    /// `bdone`/`blen`/`stat` per §4.6 step 2.
    ///
    /// # Safety
    /// `self.buf` must be valid for `self.blen` bytes for the lifetime of the call.
    pub unsafe fn scatter_from(&mut self, src: &[u8], done: &mut u32) {
        let n = (*done).min(self.blen) as usize;
        if self.is_data() && !self.buf.is_null() && n > 0 {
            let n = n.min(src.len());
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr(), self.buf, n);
            }
        }
        let consumed = n as u32;
        *done = done.saturating_sub(consumed);
        self.bdone += consumed;
        self.blen -= consumed;
        self.stat = BlockStat::Handled;
    }
}

/// Index-based ring-buffer arithmetic, so the block ring never needs
/// pointer-linked blocks.
///
/// `cap` is the ring capacity (`max_blk_cnt`); wraps around at `cap`.
pub fn index_valid(head: usize, tail: usize, cap: usize, i: usize) -> bool {
    if cap == 0 {
        return false;
    }
    let head = head % cap;
    let tail = tail % cap;
    let i = i % cap;
    if head <= tail {
        i >= head && i < tail
    } else {
        i >= head || i < tail
    }
}

/// Iterates ring indices from `start`, for `count` entries, wrapping at `cap`.
pub fn ring_indices(start: usize, count: usize, cap: usize) -> impl Iterator<Item = usize> {
    (0..count).map(move |i| (start + i) % cap.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_valid_without_wrap() {
        assert!(index_valid(2, 5, 8, 3));
        assert!(!index_valid(2, 5, 8, 5));
        assert!(!index_valid(2, 5, 8, 1));
    }

    #[test]
    fn index_valid_with_wrap() {
        // head=6, tail=2, cap=8: valid indices are 6,7,0,1
        assert!(index_valid(6, 2, 8, 6));
        assert!(index_valid(6, 2, 8, 0));
        assert!(index_valid(6, 2, 8, 1));
        assert!(!index_valid(6, 2, 8, 2));
        assert!(!index_valid(6, 2, 8, 5));
    }

    #[test]
    fn ring_indices_wrap_at_capacity() {
        let v: Vec<usize> = ring_indices(6, 4, 8).collect();
        assert_eq!(v, vec![6, 7, 0, 1]);
    }

    #[test]
    fn scatter_from_clamps_to_blen_and_marks_handled() {
        let mut buf = [0u8; 4];
        let mut b = Block {
            buf: buf.as_mut_ptr(),
            blen: 2,
            bdone: 0,
            ty: BlockType::Full,
            stat: BlockStat::Handling,
        };
        let src = [9u8, 9, 9, 9];
        let mut done = 3u32;
        unsafe { b.scatter_from(&src, &mut done) };
        assert_eq!(b.bdone, 2);
        assert_eq!(b.blen, 0);
        assert_eq!(b.stat, BlockStat::Handled);
        assert_eq!(done, 1);
        assert_eq!(buf, [9, 9, 0, 0]);
    }
}
