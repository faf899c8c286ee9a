//! # MPSC Queue
//!
//! A multi-producer, single-consumer FIFO built on an intrusive singly
//! linked list. Pushing is wait-free for any number of producers; popping
//! is reserved for exactly one consumer, which is what lets nodes be
//! reclaimed without any deferred-reclamation machinery.
//!
//! The queue comes in two flavors:
//!
//! - [`unbounded`] — producers never wait.
//! - [`bounded`] — a capacity limit enforced by a semaphore; `push` waits
//!   while the queue holds `capacity` items.
//!
//! Closing the queue is an announcement, not a flush: after
//! [`QueueSender::close`] the consumer still drains every item that was
//! pushed, and only then does [`QueueReceiver::pop`] resolve to `None`.
//! Pushing after close is a caller bug and is not policed here.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;

/// First sleep of the empty-queue backoff.
const BACKOFF_START: Duration = Duration::from_nanos(100);
/// Ceiling for the empty-queue backoff.
const BACKOFF_CAP: Duration = Duration::from_millis(10);

/// Creates an unbounded queue. Producers never wait.
pub fn unbounded<A: Send>() -> (QueueSender<A>, QueueReceiver<A>) {
    channel(None)
}

/// Creates a queue that holds at most `capacity` items. `push` waits while
/// the queue is full.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn bounded<A: Send>(capacity: usize) -> (QueueSender<A>, QueueReceiver<A>) {
    assert!(capacity > 0, "bounded queue requires a capacity of at least 1");
    channel(Some(Semaphore::new(capacity)))
}

fn channel<A: Send>(limit: Option<Semaphore>) -> (QueueSender<A>, QueueReceiver<A>) {
    let stub = Box::into_raw(Box::new(Node::<A> {
        value: None,
        next: AtomicPtr::new(ptr::null_mut()),
    }));
    let inner = Arc::new(Inner {
        tail: AtomicPtr::new(stub),
        head: UnsafeCell::new(stub),
        closed: AtomicBool::new(false),
        limit,
    });
    (
        QueueSender {
            inner: inner.clone(),
        },
        QueueReceiver { inner },
    )
}

struct Node<A> {
    value: Option<A>,
    next: AtomicPtr<Node<A>>,
}

struct Inner<A> {
    /// Swapped by producers; always points at the most recently pushed node.
    tail: AtomicPtr<Node<A>>,
    /// Touched only by the single consumer. Points at the current stub: the
    /// node *after* it holds the next value.
    head: UnsafeCell<*mut Node<A>>,
    closed: AtomicBool,
    limit: Option<Semaphore>,
}

unsafe impl<A: Send> Send for Inner<A> {}
unsafe impl<A: Send> Sync for Inner<A> {}

enum Pop<A> {
    Ready(A),
    Empty,
    /// A producer has swapped the tail but not yet published the link.
    Inconsistent,
}

impl<A> Inner<A> {
    /// Wait-free: one swap plus one store, no loops.
    fn enqueue(&self, value: A) {
        let node = Box::into_raw(Box::new(Node {
            value: Some(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        let prev = self.tail.swap(node, Ordering::AcqRel);
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Single-consumer dequeue. Callers must hold the receiver half.
    fn try_pop(&self) -> Pop<A> {
        unsafe {
            let head = *self.head.get();
            let next = (*head).next.load(Ordering::Acquire);
            if !next.is_null() {
                *self.head.get() = next;
                let value = (*next)
                    .value
                    .take()
                    .expect("non-stub queue node always holds a value");
                drop(Box::from_raw(head));
                return Pop::Ready(value);
            }
            if self.tail.load(Ordering::Acquire) == head {
                Pop::Empty
            } else {
                Pop::Inconsistent
            }
        }
    }
}

impl<A> Drop for Inner<A> {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next.load(Ordering::Relaxed);
        }
    }
}

/// Producer half. Cheap to clone; every clone pushes into the same queue.
pub struct QueueSender<A: Send> {
    inner: Arc<Inner<A>>,
}

impl<A: Send> Clone for QueueSender<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Send> QueueSender<A> {
    /// Pushes a value, waiting for a capacity slot when the queue is
    /// bounded and full.
    pub async fn push(&self, value: A) {
        self.reserve().await.send(value);
    }

    /// Acquires a capacity slot without committing a value. The returned
    /// [`Permit`] sends without waiting; dropping it unused returns the
    /// slot.
    ///
    /// This is the building block for callers that need a bounded wait
    /// around the slot acquisition (for example, to log when a downstream
    /// consumer is slow) without ever losing the value they meant to push.
    pub async fn reserve(&self) -> Permit<'_, A> {
        if let Some(limit) = &self.inner.limit {
            let permit = limit
                .acquire()
                .await
                .expect("queue capacity semaphore is never closed");
            permit.forget();
        }
        Permit {
            inner: self.inner.as_ref(),
            spent: false,
        }
    }

    /// Announces that no further values will be pushed. Items already in
    /// the queue remain poppable; an empty, closed queue pops `None`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// A reserved capacity slot tied to one queue.
pub struct Permit<'a, A: Send> {
    inner: &'a Inner<A>,
    spent: bool,
}

impl<A: Send> Permit<'_, A> {
    /// Enqueues the value. Never waits.
    pub fn send(mut self, value: A) {
        self.inner.enqueue(value);
        self.spent = true;
    }
}

impl<A: Send> Drop for Permit<'_, A> {
    fn drop(&mut self) {
        if !self.spent
            && let Some(limit) = &self.inner.limit
        {
            limit.add_permits(1);
        }
    }
}

/// Consumer half. Not `Clone`: the pop side is single-consumer by
/// construction, which is the invariant that makes node reclamation sound.
pub struct QueueReceiver<A: Send> {
    inner: Arc<Inner<A>>,
}

impl<A: Send> QueueReceiver<A> {
    /// Pops the next value, waiting while the queue is empty and open.
    ///
    /// Resolves to `None` once the queue has been closed and fully drained.
    /// While empty and open, the wait is an exponentially doubling sleep
    /// from 100 ns up to 10 ms, reset on every call.
    pub async fn pop(&mut self) -> Option<A> {
        let mut backoff = Duration::ZERO;
        loop {
            // Read the flag before popping: a close observed here
            // happens-after every push that preceded it, so an empty pop
            // below is authoritative.
            let closed = self.inner.closed.load(Ordering::Acquire);
            match self.inner.try_pop() {
                Pop::Ready(value) => {
                    if let Some(limit) = &self.inner.limit {
                        limit.add_permits(1);
                    }
                    return Some(value);
                }
                Pop::Empty => {
                    if closed {
                        return None;
                    }
                }
                // A push is mid-flight; the link lands momentarily.
                Pop::Inconsistent => {}
            }
            backoff = if backoff.is_zero() {
                BACKOFF_START
            } else {
                (backoff * 2).min(BACKOFF_CAP)
            };
            tokio::time::sleep(backoff).await;
        }
    }
}
