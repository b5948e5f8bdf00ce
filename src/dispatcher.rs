//! Completion Dispatcher: the single background thread that drives
//! outstanding transport-library transfers to completion (§4.7).

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::thread::JoinHandle;

use futures_channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures_util::stream::{FuturesUnordered, StreamExt};

use crate::block::BlockStat;
use crate::callbacks::{Callbacks, EndpointLocks};
use crate::error::XferStatus;
use crate::handles::{DeviceHandle, Registry, RequestHandle};
use crate::xfer::{ring_span, scatter_completion, RequestEntry, RequestOutcome, XferHandle};

/// One submitted transfer handed from the front-end context to the
/// dispatcher thread: which device/xfer it belongs to, plus the boxed
/// transport-library future the Data Transfer Engine produced.
pub struct PendingTransfer {
    pub device: DeviceHandle,
    pub xfer: XferHandle,
    pub request: RequestHandle,
    pub future: Pin<Box<dyn Future<Output = RequestOutcome> + Send>>,
}

struct Completion {
    device: DeviceHandle,
    xfer: XferHandle,
    request: RequestHandle,
    outcome: RequestOutcome,
}

type BoxedCompletion = Pin<Box<dyn Future<Output = Completion> + Send>>;

/// Owns the background thread and the channel feeding it newly submitted
/// transfers. Dropping it closes the channel, which wakes the thread's
/// blocked poll immediately and lets it drain outstanding transfers before
/// exiting (§9: no `sleep(1)` polling).
pub struct Dispatcher {
    sender: UnboundedSender<PendingTransfer>,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn start(
        callbacks: Arc<dyn Callbacks>,
        locks: Arc<EndpointLocks>,
        requests: Arc<Registry<RequestEntry>>,
    ) -> Dispatcher {
        let (sender, receiver) = mpsc::unbounded();
        let thread = std::thread::Builder::new()
            .name("usb-port-mapper-dispatcher".into())
            .spawn(move || futures_lite::future::block_on(run(receiver, callbacks, locks, requests)))
            .expect("failed to spawn completion dispatcher thread");
        Dispatcher {
            sender,
            thread: Some(thread),
        }
    }

    /// Hands a newly submitted transfer to the dispatcher. Silently dropped
    /// if the dispatcher has already shut down (a disconnect/deinit race).
    pub fn submit(&self, transfer: PendingTransfer) {
        let _ = self.sender.unbounded_send(transfer);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.sender.close_channel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

enum Event {
    New(PendingTransfer),
    Completed(Completion),
    Shutdown,
}

async fn run(
    receiver: UnboundedReceiver<PendingTransfer>,
    callbacks: Arc<dyn Callbacks>,
    locks: Arc<EndpointLocks>,
    requests: Arc<Registry<RequestEntry>>,
) {
    let mut receiver = receiver;
    let mut pending: FuturesUnordered<BoxedCompletion> = FuturesUnordered::new();
    let mut channel_open = true;

    loop {
        let event = poll_fn(|cx| {
            if channel_open {
                match receiver.poll_next_unpin(cx) {
                    Poll::Ready(Some(transfer)) => return Poll::Ready(Event::New(transfer)),
                    Poll::Ready(None) => channel_open = false,
                    Poll::Pending => {}
                }
            }
            match pending.poll_next_unpin(cx) {
                Poll::Ready(Some(completion)) => return Poll::Ready(Event::Completed(completion)),
                Poll::Ready(None) if !channel_open => return Poll::Ready(Event::Shutdown),
                _ => {}
            }
            Poll::Pending
        })
        .await;

        match event {
            Event::New(transfer) => pending.push(Box::pin(async move {
                let outcome = transfer.future.await;
                Completion {
                    device: transfer.device,
                    xfer: transfer.xfer,
                    request: transfer.request,
                    outcome,
                }
            })),
            Event::Completed(completion) => complete(completion, &callbacks, &locks, &requests),
            Event::Shutdown => break,
        }
    }
}

/// §4.6 "Completion": lock, scatter (unless stalled/cancelled), notify,
/// unlock. The Request itself is dropped when this function returns, along
/// with the transport-library future that produced `outcome`.
fn complete(
    completion: Completion,
    callbacks: &Arc<dyn Callbacks>,
    locks: &Arc<EndpointLocks>,
    requests: &Arc<Registry<RequestEntry>>,
) {
    let Completion { device, xfer, request, outcome } = completion;
    let epid = xfer.lock().unwrap().epid;

    requests.remove(request.index(), request.generation());

    locks.with_lock(device, epid, || {
        let mut guard = xfer.lock().unwrap();
        guard.status = outcome.status;
        guard.set_req(outcome.blk_head, None);

        match outcome.status {
            XferStatus::Stalled => {
                for idx in ring_span(outcome.blk_head, outcome.blk_tail, guard.capacity()) {
                    guard.block_mut(idx).stat = BlockStat::Handled;
                }
            }
            XferStatus::IoError => {
                // Cancel-like outcome: blocks are left exactly as they were,
                // no scatter and no stall mark (§7).
            }
            _ => scatter_completion(
                &mut guard,
                outcome.blk_head,
                outcome.blk_tail,
                outcome.dir_in,
                &outcome.bytes,
                outcome.frames.as_deref(),
            ),
        }

        let raise = callbacks.notify(device, &mut guard);
        drop(guard);
        if raise {
            callbacks.interrupt(device);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockType;
    use crate::path::NativeDeviceInfo;
    use crate::xfer::Xfer;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingCallbacks {
        notified: StdMutex<Vec<DeviceHandle>>,
        interrupted: AtomicBool,
    }

    impl Callbacks for RecordingCallbacks {
        fn connected(&self, _info: &NativeDeviceInfo) {}
        fn disconnected(&self, _info: &NativeDeviceInfo) {}
        fn notify(&self, device: DeviceHandle, _xfer: &mut Xfer) -> bool {
            self.notified.lock().unwrap().push(device);
            true
        }
        fn interrupt(&self, _device: DeviceHandle) {
            self.interrupted.store(true, Ordering::SeqCst);
        }
    }

    fn data_block(len: u32) -> crate::block::Block {
        let mut b = crate::block::Block::placeholder();
        b.ty = BlockType::Full;
        b.blen = len;
        b
    }

    #[test]
    fn stall_marks_blocks_handled_without_scatter() {
        let blocks = vec![data_block(8)];
        let xfer: XferHandle = std::sync::Arc::new(std::sync::Mutex::new(Xfer::from_blocks(0x81, blocks)));
        let callbacks: Arc<dyn Callbacks> = Arc::new(RecordingCallbacks {
            notified: StdMutex::new(Vec::new()),
            interrupted: AtomicBool::new(false),
        });
        let locks = Arc::new(EndpointLocks::new());
        let requests: Arc<Registry<crate::xfer::RequestEntry>> = Arc::new(Registry::new());
        let device = DeviceHandle::new(0, 0);

        complete(
            Completion {
                device,
                xfer: xfer.clone(),
                request: RequestHandle::new(0, 0),
                outcome: RequestOutcome {
                    blk_head: 0,
                    blk_tail: 0,
                    dir_in: true,
                    status: XferStatus::Stalled,
                    bytes: Vec::new(),
                    frames: None,
                },
            },
            &callbacks,
            &locks,
            &requests,
        );

        let guard = xfer.lock().unwrap();
        assert_eq!(guard.block(0).stat, BlockStat::Handled);
        assert_eq!(guard.status, XferStatus::Stalled);
        assert!(guard.req(0).is_none());
    }
}
