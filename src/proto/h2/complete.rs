//! Pooled one-shot completions for stream responses.
//!
//! A slot is a resettable single-producer, single-consumer cell guarded by a
//! generation token. Consuming the value (or dropping the consumer) bumps
//! the generation and returns the slot to a bounded free list, so steady
//! state request traffic allocates no per-stream completion machinery. Slots
//! are never boxed into a task just to combine with a timeout; callers race
//! the consumer against a linked cancellation instead.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures_util::task::AtomicWaker;

use crate::error::{Error, Result};

struct SlotState<T> {
    generation: u64,
    value: Option<Result<T>>,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    waker: AtomicWaker,
}

pub(crate) struct CompletionPool<T> {
    free: Mutex<Vec<Arc<Slot<T>>>>,
    capacity: usize,
}

impl<T> CompletionPool<T> {
    /// Capacity should be at least the peer's max concurrent streams.
    pub(crate) fn new(capacity: usize) -> Arc<CompletionPool<T>> {
        Arc::new(CompletionPool {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        })
    }

    /// Checks a slot out as a producer/consumer pair.
    pub(crate) fn checkout(self: &Arc<Self>) -> (Producer<T>, Consumer<T>) {
        let slot = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| {
                Arc::new(Slot {
                    state: Mutex::new(SlotState {
                        generation: 0,
                        value: None,
                    }),
                    waker: AtomicWaker::new(),
                })
            });
        let generation = slot.state.lock().unwrap().generation;
        (
            Producer {
                slot: slot.clone(),
                generation,
                completed: false,
            },
            Consumer {
                slot,
                generation,
                pool: Arc::downgrade(self),
                done: false,
            },
        )
    }

    fn recycle(&self, slot: Arc<Slot<T>>) {
        let mut free = self.free.lock().unwrap();
        if free.len() < self.capacity {
            free.push(slot);
        }
    }

    #[cfg(test)]
    pub(crate) fn free_len(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// Completes the slot exactly once. Dropping an incomplete producer fails
/// the consumer so it can never hang.
pub(crate) struct Producer<T> {
    slot: Arc<Slot<T>>,
    generation: u64,
    completed: bool,
}

impl<T> Producer<T> {
    pub(crate) fn complete(mut self, value: Result<T>) {
        self.completed = true;
        let mut state = self.slot.state.lock().unwrap();
        if state.generation == self.generation && state.value.is_none() {
            state.value = Some(value);
            drop(state);
            self.slot.waker.wake();
        }
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut state = self.slot.state.lock().unwrap();
        if state.generation == self.generation && state.value.is_none() {
            state.value = Some(Err(Error::new_network("stream completion dropped")));
            drop(state);
            self.slot.waker.wake();
        }
    }
}

/// The single consumer; awaiting it yields the completed value exactly once.
pub(crate) struct Consumer<T> {
    slot: Arc<Slot<T>>,
    generation: u64,
    pool: Weak<CompletionPool<T>>,
    done: bool,
}

impl<T> Consumer<T> {
    /// Invalidates the producer and returns the slot. The old generation can
    /// no longer write into the reused slot.
    fn retire(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        {
            let mut state = self.slot.state.lock().unwrap();
            state.generation = state.generation.wrapping_add(1);
            state.value = None;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.recycle(self.slot.clone());
        }
    }
}

impl<T> Future for Consumer<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "completion consumed twice");

        this.slot.waker.register(cx.waker());
        let taken = {
            let mut state = this.slot.state.lock().unwrap();
            if state.generation != this.generation {
                return Poll::Pending;
            }
            state.value.take()
        };
        match taken {
            Some(value) => {
                this.retire();
                Poll::Ready(value)
            }
            None => Poll::Pending,
        }
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.retire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_then_consume() {
        let pool = CompletionPool::<u32>::new(4);
        let (producer, consumer) = pool.checkout();
        producer.complete(Ok(7));
        assert_eq!(consumer.await.unwrap(), 7);
        assert_eq!(pool.free_len(), 1);
    }

    #[tokio::test]
    async fn consume_then_complete() {
        let pool = CompletionPool::<u32>::new(4);
        let (producer, consumer) = pool.checkout();
        let task = tokio::spawn(consumer);
        tokio::task::yield_now().await;
        producer.complete(Ok(42));
        assert_eq!(task.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn dropped_producer_fails_consumer() {
        let pool = CompletionPool::<u32>::new(4);
        let (producer, consumer) = pool.checkout();
        drop(producer);
        assert!(consumer.await.is_err());
    }

    #[tokio::test]
    async fn canceled_consumer_invalidates_producer() {
        let pool = CompletionPool::<u32>::new(4);
        let (producer, consumer) = pool.checkout();
        drop(consumer);
        assert_eq!(pool.free_len(), 1);

        // A new checkout reuses the slot under a fresh generation; the old
        // producer's write must not leak into it.
        let (_p2, mut c2) = pool.checkout();
        producer.complete(Ok(13));
        let still_pending = futures_util::future::poll_fn(|cx| {
            Poll::Ready(Pin::new(&mut c2).poll(cx).is_pending())
        })
        .await;
        assert!(still_pending);
    }

    #[tokio::test]
    async fn pool_is_bounded() {
        let pool = CompletionPool::<u32>::new(1);
        let (p1, c1) = pool.checkout();
        let (p2, c2) = pool.checkout();
        p1.complete(Ok(1));
        p2.complete(Ok(2));
        let _ = c1.await;
        let _ = c2.await;
        assert_eq!(pool.free_len(), 1);
    }
}
