//! Hotplug Watcher: subscribes to arrival/departure events from the
//! transport library and dispatches to the front-end's connect/disconnect
//! callbacks (§4.2).

use std::collections::HashMap;
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::thread::JoinHandle;

use futures_channel::oneshot;
use futures_util::stream::StreamExt;
use log::warn;
use nusb::hotplug::{DeviceId, HotplugEvent};

use crate::callbacks::Callbacks;
use crate::error::Error;
use crate::path::DeviceKind;
use crate::topology::classify_one;

/// Owns the background thread that drains `nusb::watch_devices()`. Dropping
/// this stops the watcher: the shutdown signal wakes the blocked poll the
/// same way closing the dispatcher's channel does (§9).
pub struct HotplugWatcher {
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugWatcher {
    pub fn start(callbacks: Arc<dyn Callbacks>) -> Result<HotplugWatcher, Error> {
        let stream = nusb::watch_devices()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("usb-port-mapper-hotplug".into())
            .spawn(move || futures_lite::future::block_on(run(stream, shutdown_rx, callbacks)))
            .expect("failed to spawn hotplug watcher thread");

        Ok(HotplugWatcher {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

impl Drop for HotplugWatcher {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn run(
    mut stream: impl futures_core::Stream<Item = HotplugEvent> + Unpin,
    mut shutdown: oneshot::Receiver<()>,
    callbacks: Arc<dyn Callbacks>,
) {
    let mut known: HashMap<DeviceId, crate::path::NativeDeviceInfo> = HashMap::new();

    loop {
        let event = poll_fn(|cx| {
            if Pin::new(&mut shutdown).poll(cx).is_ready() {
                return Poll::Ready(None);
            }
            stream.poll_next_unpin(cx)
        })
        .await;

        match event {
            None => break,
            Some(HotplugEvent::Connected(info)) => {
                let id = info.id();
                match classify_one(info) {
                    Some(native) if native.kind != DeviceKind::RootHub => {
                        known.insert(id, native.clone());
                        callbacks.connected(&native);
                    }
                    Some(_) => {}
                    None => warn!("hotplug arrival dropped: could not classify device"),
                }
            }
            Some(HotplugEvent::Disconnected(id)) => {
                if let Some(native) = known.remove(&id) {
                    callbacks.disconnected(&native);
                }
            }
        }
    }
}

// No unit tests here: both `HotplugEvent` and `nusb::DeviceInfo` require a
// live platform backend to construct, and `classify_one`'s actual
// classification rules are already covered in `topology.rs` and `path.rs`.
