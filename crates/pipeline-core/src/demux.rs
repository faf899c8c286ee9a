//! Keyed fan-out from one stream to many receivers.
//!
//! A demux consumes one input stream and delivers each item to the
//! receiver registered for its key. Receivers come and go while the stream
//! is live; removing a receiver drops its channel sender, which is how
//! downstream consumers learn the stream is over.

use std::hash::Hash;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mpsc_queue::QueueReceiver;

/// Routes items from one input to keyed receivers.
pub struct Demux<K, V> {
    receivers: DashMap<K, mpsc::Sender<V>>,
    key_of: Box<dyn Fn(&V) -> K + Send + Sync>,
    /// Called for items whose key has no registered receiver. In a
    /// correctly wired pipeline this is a programming bug, so the default
    /// installed by the runtime logs at error level.
    on_unroutable: Box<dyn Fn(V) + Send + Sync>,
}

impl<K, V> Demux<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + 'static,
{
    pub fn new<F, E>(key_of: F, on_unroutable: E) -> Self
    where
        F: Fn(&V) -> K + Send + Sync + 'static,
        E: Fn(V) + Send + Sync + 'static,
    {
        Self {
            receivers: DashMap::new(),
            key_of: Box::new(key_of),
            on_unroutable: Box::new(on_unroutable),
        }
    }

    /// Registers the receiver for `key`, replacing any previous one.
    pub fn add_receiver(&self, key: K, tx: mpsc::Sender<V>) {
        self.receivers.insert(key, tx);
    }

    /// Removes the receiver for `key`, dropping its sender. The receiver's
    /// channel closes once any in-flight send completes.
    pub fn remove_receiver(&self, key: &K) {
        self.receivers.remove(key);
    }

    /// Delivers one item to its receiver.
    pub async fn route(&self, item: V) {
        let key = (self.key_of)(&item);
        // Clone the sender out so no map shard lock is held across the
        // send await.
        let tx = match self.receivers.get(&key) {
            Some(entry) => entry.value().clone(),
            None => {
                (self.on_unroutable)(item);
                return;
            }
        };
        if let Err(err) = tx.send(item).await {
            (self.on_unroutable)(err.0);
        }
    }

    /// Spawns the routing loop over `input`. The task ends when the input
    /// closes and drains.
    pub fn spawn(self: std::sync::Arc<Self>, mut input: QueueReceiver<V>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(item) = input.pop().await {
                self.route(item).await;
            }
        })
    }
}
