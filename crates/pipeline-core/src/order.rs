//! In-order reassembly of a sequenced stream.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

/// Re-establishes submission order over items that finish out of order.
///
/// Items carry dense, monotonically assigned sequence numbers starting at
/// zero. An arrival that is not the next expected number is held until the
/// gap fills; there is no timeout because the numbering has no holes by
/// construction.
pub struct InOrder<V> {
    seq_of: Box<dyn Fn(&V) -> u64 + Send + Sync>,
    next: u64,
    held: BTreeMap<u64, V>,
    out: mpsc::Sender<V>,
}

impl<V> InOrder<V> {
    pub fn new<F>(seq_of: F, out: mpsc::Sender<V>) -> Self
    where
        F: Fn(&V) -> u64 + Send + Sync + 'static,
    {
        Self {
            seq_of: Box::new(seq_of),
            next: 0,
            held: BTreeMap::new(),
            out,
        }
    }

    /// Accepts one item, releasing it and any now-contiguous successors
    /// downstream. Returns `false` once the downstream receiver is gone.
    pub async fn push(&mut self, item: V) -> bool {
        let seq = (self.seq_of)(&item);
        debug_assert!(seq >= self.next, "sequence number {seq} delivered twice");
        if seq != self.next {
            self.held.insert(seq, item);
            return true;
        }

        if self.out.send(item).await.is_err() {
            return false;
        }
        self.next += 1;
        while let Some(item) = self.held.remove(&self.next) {
            if self.out.send(item).await.is_err() {
                return false;
            }
            self.next += 1;
        }
        true
    }

    /// Number of items parked waiting for a gap to fill.
    pub fn held(&self) -> usize {
        self.held.len()
    }
}
