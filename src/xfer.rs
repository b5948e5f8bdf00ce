//! `usb_xfer`: the block ring, and the Data Transfer Engine that turns one
//! into a bulk/interrupt/isochronous transfer against the real device.

use std::sync::{Arc, Mutex};

use log::error;
use nusb::transfer::{RequestBuffer, RequestIsochronousBuffer, TransferFuture};
use nusb::Interface;

use futures_util::future::AbortHandle;

use crate::block::{index_valid, ring_indices, Block, BlockStat, BlockType};
use crate::endpoint::Endpoint;
use crate::error::XferStatus;
use crate::handles::RequestHandle;

/// A request outstanding against the transport library, tracked in
/// `Xfer::reqs[blk_head]`. Owns only the bookkeeping the front-end needs
/// (span, cancel handle) - the actual transport-library transfer future is
/// owned by the Completion Dispatcher, never both at once (§9).
#[derive(Debug, Clone, Copy)]
pub struct OutstandingRequest {
    pub blk_head: usize,
    pub blk_tail: usize,
    pub request: RequestHandle,
}

/// What the `request` Registry in `lib.rs` stores for a live `RequestHandle`:
/// enough to abort the in-flight transport-library transfer and to find the
/// `Xfer` it belongs to. Removed by the Completion Dispatcher on completion,
/// or earlier by an explicit `free_request`.
pub struct RequestEntry {
    pub abort: AbortHandle,
    pub xfer: XferHandle,
    pub blk_head: usize,
}

/// A circular ring of blocks plus the parallel `reqs` array, shared between
/// the front-end context (synchronous submission) and the Completion
/// Dispatcher thread (asynchronous scatter-back). The `Mutex` here is what
/// makes that sharing sound; the per-endpoint lock in [`crate::callbacks`]
/// is a separate, coarser-grained lock for the scatter/notify critical
/// section specifically, not a replacement for this one.
pub type XferHandle = Arc<Mutex<Xfer>>;

#[derive(Debug)]
pub struct Xfer {
    pub epid: u8,
    pub status: XferStatus,
    data: Vec<Block>,
    pub head: usize,
    pub tail: usize,
    pub ndata: usize,
    reqs: Vec<Option<OutstandingRequest>>,
}

impl Xfer {
    pub fn new(epid: u8, capacity: usize) -> Xfer {
        Xfer {
            epid,
            status: XferStatus::Pending,
            data: vec![Block::placeholder(); capacity.max(1)],
            head: 0,
            tail: 0,
            ndata: 0,
            reqs: vec![None; capacity.max(1)],
        }
    }

    /// Convenience constructor for front-ends (and tests) that hand over a
    /// flat, non-wrapped block list rather than populating a pre-sized ring.
    pub fn from_blocks(epid: u8, blocks: Vec<Block>) -> Xfer {
        let cap = blocks.len().max(1);
        let ndata = blocks.len();
        Xfer {
            epid,
            status: XferStatus::Pending,
            data: blocks,
            head: 0,
            tail: ndata % cap,
            ndata,
            reqs: vec![None; cap],
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn block(&self, i: usize) -> &Block {
        &self.data[i % self.data.len()]
    }

    pub fn block_mut(&mut self, i: usize) -> &mut Block {
        let cap = self.data.len();
        &mut self.data[i % cap]
    }

    pub fn req(&self, i: usize) -> Option<OutstandingRequest> {
        self.reqs[i % self.reqs.len()]
    }

    pub fn set_req(&mut self, i: usize, req: Option<OutstandingRequest>) {
        let cap = self.reqs.len();
        self.reqs[i % cap] = req;
    }

    /// Invariant 2 check, exposed for tests: `reqs[i].is_some()` iff there is
    /// a live request with `blk_head == i`.
    pub fn reqs_consistent(&self) -> bool {
        self.reqs
            .iter()
            .enumerate()
            .all(|(i, r)| r.map_or(true, |r| r.blk_head % self.reqs.len() == i))
    }
}

/// One block span selected for submission, plus the linearized payload.
pub struct PreparedRequest {
    pub blk_head: usize,
    pub blk_tail: usize,
    pub size: usize,
    pub framecnt: usize,
    pub iso_lengths: Vec<u32>,
}

pub enum PrepareOutcome {
    /// Endpoint type is not valid for a data-stage transfer (Control, or no
    /// live endpoint in the current alt setting).
    Rejected,
    /// No data blocks in span; xfer completes immediately with no request.
    ImmediateComplete,
    Ready(PreparedRequest),
}

/// §4.6 block preparation + isochronous framing. Pure over `Xfer` and the
/// endpoint descriptor; doesn't touch the transport library.
pub fn prepare(xfer: &mut Xfer, ep: &Endpoint, is_iso: bool) -> PrepareOutcome {
    use crate::endpoint::EpType;
    if matches!(ep.ty, EpType::Control | EpType::Invalid) {
        return PrepareOutcome::Rejected;
    }

    let cap = xfer.capacity();
    let mut first: Option<usize> = None;
    let mut last: Option<usize> = None;
    let mut size: usize = 0;

    // Frame accounting, valid only when `is_iso`.
    let mut iso_lengths: Vec<u32> = Vec::new();
    let mut frame_len: u32 = 0;
    let mut frame_block_count: u32 = 0;

    for idx in ring_indices(xfer.head, xfer.ndata, cap) {
        let block = *xfer.block(idx);
        match block.stat {
            BlockStat::Handled | BlockStat::Handling => continue,
            BlockStat::Free => {}
        }

        match block.ty {
            BlockType::None => {
                xfer.block_mut(idx).stat = BlockStat::Handled;
                continue;
            }
            BlockType::Link => continue,
            BlockType::Part | BlockType::Full => {
                if first.is_none() {
                    first = Some(idx);
                }
                last = Some(idx);
                size += block.blen as usize;
                xfer.block_mut(idx).stat = BlockStat::Handling;

                if is_iso {
                    frame_len += block.blen;
                    frame_block_count += 1;
                    if matches!(block.ty, BlockType::Full) {
                        let frame_size = ep.frame_size();
                        if frame_block_count == 1 && frame_len > frame_size {
                            error!(
                                "isochronous block of {frame_len} bytes exceeds frame size {frame_size} \
                                 on endpoint maxp={:#06x}; submitting anyway",
                                ep.maxp
                            );
                        }
                        iso_lengths.push(frame_len);
                        frame_len = 0;
                        frame_block_count = 0;
                    }
                }
            }
        }
    }

    let (Some(blk_head), Some(blk_tail)) = (first, last) else {
        return PrepareOutcome::ImmediateComplete;
    };

    if size == 0 {
        return PrepareOutcome::ImmediateComplete;
    }

    PrepareOutcome::Ready(PreparedRequest {
        blk_head,
        blk_tail,
        size,
        framecnt: iso_lengths.len(),
        iso_lengths,
    })
}

/// OUT packing: linearizes each `Part`/`Full` block's bytes, in ring order,
/// into one contiguous buffer for the transport-library transfer.
///
/// # Safety
/// Every included block's `buf` must be valid for `blen` bytes.
pub unsafe fn pack_out(xfer: &Xfer, prepared: &PreparedRequest) -> Vec<u8> {
    let mut buf = vec![0u8; prepared.size];
    let mut off = 0;
    let cap = xfer.capacity();
    for idx in ring_span(prepared.blk_head, prepared.blk_tail, cap) {
        let block = xfer.block(idx);
        if !block.is_data() {
            continue;
        }
        let n = block.blen as usize;
        if n == 0 || block.buf.is_null() {
            continue;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(block.buf, buf[off..].as_mut_ptr(), n);
        }
        off += n;
    }
    buf
}

/// Iterates ring indices from `head` through `tail` inclusive, the same span
/// `Request::blk_head..=blk_tail` covers.
pub fn ring_span(head: usize, tail: usize, cap: usize) -> impl Iterator<Item = usize> {
    let cap = cap.max(1);
    let count = if tail >= head {
        tail - head + 1
    } else {
        cap - head + tail + 1
    };
    ring_indices(head, count, cap)
}

/// §4.6 completion: scatters received bytes back into the originating
/// blocks and marks them `Handled`. `frames` is `None` for non-isochronous
/// completions (one flat buffer) and `Some` for isochronous ones (one
/// sub-buffer per successfully completed frame - `nusb` already drops
/// packets whose own status was non-zero, so a short `frames` list here
/// just means trailing frames are treated as zero bytes delivered).
pub fn scatter_completion(
    xfer: &mut Xfer,
    blk_head: usize,
    blk_tail: usize,
    dir_in: bool,
    bytes: &[u8],
    frames: Option<&[Vec<u8>]>,
) {
    let cap = xfer.capacity();
    let spans: Vec<usize> = ring_span(blk_head, blk_tail, cap).collect();

    match frames {
        None => {
            let mut done = bytes.len() as u32;
            let mut cursor = 0usize;
            for idx in spans {
                let block = xfer.block_mut(idx);
                if !block.is_data() {
                    block.stat = BlockStat::Handled;
                    continue;
                }
                let take = (done.min(block.blen)) as usize;
                if dir_in && take > 0 {
                    unsafe { block.scatter_from(&bytes[cursor..cursor + take], &mut done) };
                } else {
                    done = done.saturating_sub(block.blen.min(done));
                    block.bdone += take as u32;
                    block.blen -= take as u32;
                    block.stat = BlockStat::Handled;
                }
                cursor += take;
            }
        }
        Some(frames) => {
            // Blocks form frames: Part* Full, in the same order the
            // isochronous framing pass in `prepare` counted them. `Link`
            // blocks rewind the frame index by one (they consume no frame).
            let mut frame_idx = 0usize;
            let mut group: Vec<usize> = Vec::new();
            let flush = |xfer: &mut Xfer, group: &[usize], frame: &[u8]| {
                let mut done = frame.len() as u32;
                let mut cursor = 0usize;
                for &idx in group {
                    let block = xfer.block_mut(idx);
                    let take = (done.min(block.blen)) as usize;
                    if dir_in && take > 0 {
                        unsafe { block.scatter_from(&frame[cursor..cursor + take], &mut done) };
                    } else {
                        done = done.saturating_sub(block.blen.min(done));
                        block.bdone += take as u32;
                        block.blen -= take as u32;
                        block.stat = BlockStat::Handled;
                    }
                    cursor += take;
                }
            };

            for idx in spans {
                let ty = xfer.block(idx).ty;
                match ty {
                    BlockType::Link => {
                        frame_idx = frame_idx.saturating_sub(1);
                    }
                    BlockType::Part => group.push(idx),
                    BlockType::Full => {
                        group.push(idx);
                        let empty = Vec::new();
                        let frame = frames.get(frame_idx).unwrap_or(&empty);
                        flush(xfer, &group, frame);
                        group.clear();
                        frame_idx += 1;
                    }
                    BlockType::None => {
                        xfer.block_mut(idx).stat = BlockStat::Handled;
                    }
                }
            }
        }
    }
}

/// Boxed outcome of one outstanding transport-library transfer, produced by
/// whichever `nusb` future the Data Transfer Engine submitted. This is the
/// unit of work the Completion Dispatcher's `FuturesUnordered` resolves.
pub struct RequestOutcome {
    pub blk_head: usize,
    pub blk_tail: usize,
    pub dir_in: bool,
    pub status: XferStatus,
    pub bytes: Vec<u8>,
    pub frames: Option<Vec<Vec<u8>>>,
}

/// Submits the prepared span as a bulk/interrupt transfer (IN direction),
/// returning a future that resolves to a [`RequestOutcome`].
pub fn submit_bulk_or_int_in(
    interface: &Interface,
    epnum: u8,
    is_interrupt: bool,
    prepared: PreparedRequest,
) -> impl std::future::Future<Output = RequestOutcome> + Send + 'static {
    let fut: TransferFuture<RequestBuffer> = if is_interrupt {
        interface.interrupt_in(epnum, RequestBuffer::new(prepared.size))
    } else {
        interface.bulk_in(epnum, RequestBuffer::new(prepared.size))
    };
    async move {
        let completion = fut.await;
        let status = crate::error::map_completion(completion.status);
        RequestOutcome {
            blk_head: prepared.blk_head,
            blk_tail: prepared.blk_tail,
            dir_in: true,
            status,
            bytes: completion.data,
            frames: None,
        }
    }
}

/// Submits the prepared, already-linearized span as a bulk/interrupt OUT transfer.
pub fn submit_bulk_or_int_out(
    interface: &Interface,
    epnum: u8,
    is_interrupt: bool,
    prepared: PreparedRequest,
    payload: Vec<u8>,
) -> impl std::future::Future<Output = RequestOutcome> + Send + 'static {
    let fut = if is_interrupt {
        interface.interrupt_out(epnum, payload)
    } else {
        interface.bulk_out(epnum, payload)
    };
    async move {
        let completion = fut.await;
        let status = crate::error::map_completion(completion.status);
        RequestOutcome {
            blk_head: prepared.blk_head,
            blk_tail: prepared.blk_tail,
            dir_in: false,
            status,
            bytes: Vec::new(),
            frames: None,
        }
    }
}

/// Submits the prepared span as an isochronous IN transfer.
pub fn submit_iso_in(
    interface: &Interface,
    epnum: u8,
    packet_size: usize,
    prepared: PreparedRequest,
) -> impl std::future::Future<Output = RequestOutcome> + Send + 'static {
    let framecnt = prepared.framecnt.max(1);
    let fut = interface.isochronous_in(
        epnum,
        RequestIsochronousBuffer::new(packet_size, framecnt),
    );
    async move {
        let completion = fut.await;
        let status = crate::error::map_completion(completion.status);
        RequestOutcome {
            blk_head: prepared.blk_head,
            blk_tail: prepared.blk_tail,
            dir_in: true,
            status,
            bytes: Vec::new(),
            frames: Some(completion.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockStat, BlockType};
    use crate::endpoint::{EpType, Pid};

    fn data_block(len: u32) -> Block {
        let mut b = Block::placeholder();
        b.ty = BlockType::Full;
        b.blen = len;
        b
    }

    #[test]
    fn ndata_zero_is_immediate_complete() {
        let mut xfer = Xfer::new(0x81, 4);
        let ep = Endpoint {
            pid: Pid::In,
            ty: EpType::Bulk,
            maxp: 512,
        };
        assert!(matches!(prepare(&mut xfer, &ep, false), PrepareOutcome::ImmediateComplete));
    }

    #[test]
    fn three_blocks_linearize_in_order() {
        let blocks = vec![data_block(512), data_block(512), data_block(512)];
        let mut xfer = Xfer::from_blocks(0x02, blocks);
        let ep = Endpoint {
            pid: Pid::Out,
            ty: EpType::Bulk,
            maxp: 512,
        };
        let outcome = prepare(&mut xfer, &ep, false);
        let prepared = match outcome {
            PrepareOutcome::Ready(p) => p,
            _ => panic!("expected Ready"),
        };
        assert_eq!(prepared.size, 1536);
        assert_eq!(prepared.blk_head, 0);
        assert_eq!(prepared.blk_tail, 2);
        for i in 0..3 {
            assert_eq!(xfer.block(i).stat, BlockStat::Handling);
        }
    }

    #[test]
    fn rejects_control_endpoint() {
        let blocks = vec![data_block(8)];
        let mut xfer = Xfer::from_blocks(0, blocks);
        let ep = Endpoint {
            pid: Pid::Out,
            ty: EpType::Control,
            maxp: 64,
        };
        assert!(matches!(prepare(&mut xfer, &ep, false), PrepareOutcome::Rejected));
    }

    #[test]
    fn iso_two_frames_counts_framecnt() {
        let blocks = vec![data_block(1024), data_block(1024)];
        let mut xfer = Xfer::from_blocks(0x83, blocks);
        let ep = Endpoint {
            pid: Pid::In,
            ty: EpType::Iso,
            maxp: 1024,
        };
        let outcome = prepare(&mut xfer, &ep, true);
        let prepared = match outcome {
            PrepareOutcome::Ready(p) => p,
            _ => panic!("expected Ready"),
        };
        assert_eq!(prepared.framecnt, 2);
        assert_eq!(prepared.iso_lengths, vec![1024, 1024]);
    }

    #[test]
    fn scatter_completion_bulk_marks_blocks_handled_and_sets_bdone() {
        let mut backing = [0u8; 1536];
        let mut blocks = vec![data_block(512), data_block(512), data_block(512)];
        for (i, b) in blocks.iter_mut().enumerate() {
            b.buf = unsafe { backing.as_mut_ptr().add(i * 512) };
        }
        let mut xfer = Xfer::from_blocks(0x81, blocks);
        let payload = vec![7u8; 1536];
        scatter_completion(&mut xfer, 0, 2, true, &payload, None);
        for i in 0..3 {
            let b = xfer.block(i);
            assert_eq!(b.bdone, 512);
            assert_eq!(b.blen, 0);
            assert_eq!(b.stat, BlockStat::Handled);
        }
        assert!(backing.iter().all(|&b| b == 7));
    }

    #[test]
    fn scatter_completion_iso_short_second_frame() {
        let mut backing = [0u8; 2048];
        let mut blocks = vec![data_block(1024), data_block(1024)];
        blocks[0].buf = backing.as_mut_ptr();
        blocks[1].buf = unsafe { backing.as_mut_ptr().add(1024) };
        let mut xfer = Xfer::from_blocks(0x83, blocks);
        let frames = vec![vec![1u8; 1024], vec![2u8; 512]];
        scatter_completion(&mut xfer, 0, 1, true, &[], Some(&frames));
        assert_eq!(xfer.block(0).bdone, 1024);
        assert_eq!(xfer.block(0).blen, 0);
        assert_eq!(xfer.block(1).bdone, 512);
        assert_eq!(xfer.block(1).blen, 512);
    }
}
