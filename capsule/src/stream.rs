use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::manifest::CapabilityManifest;

type Subscriber = Box<dyn Fn(&CapabilityManifest) -> anyhow::Result<()> + Send>;

/// In-process fan-out bus for discovered capability manifests.
///
/// A single dispatcher thread drains the publish queue and delivers
/// each manifest to every subscriber in registration order, so
/// subscribers observe manifests in publish order. A failing subscriber
/// is logged and skipped; it cannot starve the others. Not persistent -
/// this is a notification bus, not a store.
pub struct CapabilityStream {
    sender: Mutex<Option<Sender<CapabilityManifest>>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for CapabilityStream {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityStream {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<CapabilityManifest>();
        let subscribers: Arc<Mutex<Vec<Subscriber>>> = Arc::new(Mutex::new(Vec::new()));

        let dispatch_list = Arc::clone(&subscribers);
        let worker = thread::Builder::new()
            .name("capability-stream".to_string())
            .spawn(move || {
                while let Ok(manifest) = receiver.recv() {
                    let subscribers = dispatch_list.lock();
                    for (index, subscriber) in subscribers.iter().enumerate() {
                        if let Err(err) = subscriber(&manifest) {
                            warn!(
                                capability = %manifest.id,
                                subscriber = index,
                                error = %err,
                                "stream subscriber failed"
                            );
                        }
                    }
                }
                debug!("capability stream drained");
            })
            .expect("spawning the stream dispatcher cannot fail");

        Self {
            sender: Mutex::new(Some(sender)),
            subscribers,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Register a subscriber. Delivery starts with the next published
    /// manifest; there is no replay.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&CapabilityManifest) -> anyhow::Result<()> + Send + 'static,
    {
        self.subscribers.lock().push(Box::new(subscriber));
    }

    /// Enqueue a manifest for dispatch. A stopped stream drops the
    /// manifest silently.
    pub fn publish(&self, manifest: CapabilityManifest) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(manifest);
        }
    }

    /// Stop accepting publishes, drain nothing further, and join the
    /// dispatcher.
    pub fn stop(&self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for CapabilityStream {
    fn drop(&mut self) {
        self.stop();
    }
}
