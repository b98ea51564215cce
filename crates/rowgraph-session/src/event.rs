//! Commit event propagation.
//!
//! A committing session never updates the shared cache inline. It posts its
//! change set to the domain's [`EventChannel`]; a bridge thread drains the
//! channel and applies each change set to the [`RowCache`], which notifies
//! peer-session listeners. Propagation is therefore bounded-delay, not
//! instantaneous: peers observe a commit "soon", in posting order.

use crate::row_cache::{CacheChange, RowCache};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

enum Event {
    Change(CacheChange),
    /// Barrier: the bridge acks once everything posted earlier is applied.
    Flush(mpsc::Sender<()>),
}

/// Asynchronous channel from committing sessions to the shared cache.
pub struct EventChannel {
    sender: Option<mpsc::Sender<Event>>,
    bridge: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel").finish_non_exhaustive()
    }
}

impl EventChannel {
    /// Spawn the bridge thread delivering posted change sets to `cache`.
    pub fn new(cache: Arc<RowCache>) -> Self {
        let (sender, receiver) = mpsc::channel::<Event>();
        let bridge = std::thread::Builder::new()
            .name("rowgraph-events".to_string())
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    match event {
                        Event::Change(change) => {
                            debug!(
                                target: "rowgraph::events",
                                added = change.added.len(),
                                updated = change.updated.len(),
                                deleted = change.deleted.len(),
                                "applying commit change set"
                            );
                            cache.process_change(change);
                        }
                        Event::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .expect("failed to spawn event bridge thread");
        Self {
            sender: Some(sender),
            bridge: Some(bridge),
        }
    }

    /// Post a change set. Silently dropped if the bridge has shut down.
    pub fn post(&self, change: CacheChange) {
        if change.is_empty() {
            return;
        }
        if let Some(sender) = &self.sender {
            let _ = sender.send(Event::Change(change));
        }
    }

    /// Block until every change set posted so far has been applied.
    ///
    /// The channel is FIFO and the bridge single-threaded, so a flush ack
    /// means everything posted before it reached the cache. Returns false
    /// on timeout.
    pub fn drain(&self, timeout: Duration) -> bool {
        let Some(sender) = &self.sender else {
            return true;
        };
        let (ack_tx, ack_rx) = mpsc::channel::<()>();
        if sender.send(Event::Flush(ack_tx)).is_err() {
            return true;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(bridge) = self.bridge.take() {
            let _ = bridge.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgraph_core::{ObjectId, Snapshot, Value};

    fn id(n: i64) -> ObjectId {
        ObjectId::single("Artist", "id", Value::BigInt(n))
    }

    #[test]
    fn test_posted_changes_reach_cache_after_drain() {
        let cache = Arc::new(RowCache::new(10));
        let channel = EventChannel::new(Arc::clone(&cache));
        channel.post(CacheChange {
            added: vec![(id(1), Snapshot::new())],
            ..CacheChange::default()
        });
        assert!(channel.drain(Duration::from_secs(5)));
        assert!(cache.get(&id(1)).is_some());
    }

    #[test]
    fn test_posting_order_is_preserved() {
        let cache = Arc::new(RowCache::new(10));
        let channel = EventChannel::new(Arc::clone(&cache));
        let older = Snapshot::from_pairs([("name", Value::Text("old".to_string()))]);
        let newer = Snapshot::from_pairs([("name", Value::Text("new".to_string()))]);
        channel.post(CacheChange {
            added: vec![(id(1), older)],
            ..CacheChange::default()
        });
        channel.post(CacheChange {
            updated: vec![(id(1), newer)],
            ..CacheChange::default()
        });
        assert!(channel.drain(Duration::from_secs(5)));
        let got = cache.get(&id(1)).unwrap();
        assert_eq!(got.get("name"), Some(&Value::Text("new".to_string())));
    }
}
