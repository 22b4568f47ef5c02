//! Document streams and credit-based flow control
//!
//! Operators communicate over unbounded in-order channels; rate is imposed
//! separately by [`FlowControlLock`] credits, so a producer can never block
//! inside a send and every operator stays free to await its input stream.
//! A stream terminates with a single signal: either a sent error or
//! end-of-stream when the producer side goes away.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Semaphore;

use crate::error::{QueryError, QueryResult};

/// Create a new stream channel
pub fn stream_channel<T>() -> (StreamSender<T>, StreamReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StreamSender { tx }, StreamReceiver { rx })
}

/// Producer half of a stream channel
pub struct StreamSender<T> {
    tx: mpsc::UnboundedSender<QueryResult<T>>,
}

impl<T> Clone for StreamSender<T> {
    fn clone(&self) -> Self {
        StreamSender { tx: self.tx.clone() }
    }
}

impl<T> StreamSender<T> {
    /// Send a value downstream. Returns false if the consumer is gone, in
    /// which case the producer should wind down.
    pub fn send(&self, value: T) -> bool {
        self.tx.send(Ok(value)).is_ok()
    }

    /// Terminate the stream with an error (including `EndOfStream`)
    pub fn send_error(&self, error: QueryError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// Resolves when the consumer half has been dropped
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Consumer half of a stream channel
pub struct StreamReceiver<T> {
    rx: mpsc::UnboundedReceiver<QueryResult<T>>,
}

impl<T> StreamReceiver<T> {
    /// Await the next value. A dropped producer yields `EndOfStream`.
    ///
    /// Cancel-safe: dropping the future loses no value.
    pub async fn next(&mut self) -> QueryResult<T> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Err(QueryError::EndOfStream),
        }
    }

    /// Pop a buffered item without waiting, if one is ready
    pub fn try_next(&mut self) -> Option<QueryResult<T>> {
        self.rx.try_recv().ok()
    }
}

/// Counting semaphore gating per-document admission into a stage
///
/// `take(n)` acquires credits, suspending until they are available;
/// `release(n)` returns them. A checkpoint's document-finished lock is one of
/// these, shared by every operator the checkpoint owns; scans and buffering
/// stages additionally use private single-permit locks on their storage
/// streams.
pub struct FlowControlLock {
    sem: Arc<Semaphore>,
    permits: usize,
}

impl FlowControlLock {
    /// Create a lock with the given number of credits
    pub fn new(permits: usize) -> Self {
        FlowControlLock {
            sem: Arc::new(Semaphore::new(permits)),
            permits,
        }
    }

    /// Acquire `n` credits, waiting until they are available.
    ///
    /// Cancel-safe: dropping the future acquires nothing.
    pub async fn take(&self, n: usize) {
        let acquired = self
            .sem
            .acquire_many(n as u32)
            .await
            .expect("flow control semaphore is never closed");
        acquired.forget();
    }

    /// Return `n` credits
    pub fn release(&self, n: usize) {
        self.sem.add_permits(n);
    }

    /// Credits currently available
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// The lock's total credit count
    pub fn permits(&self) -> usize {
        self.permits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_delivers_in_order() {
        let (tx, mut rx) = stream_channel();
        tx.send(1);
        tx.send(2);
        tx.send_error(QueryError::EndOfStream);
        assert_eq!(rx.next().await.unwrap(), 1);
        assert_eq!(rx.next().await.unwrap(), 2);
        assert_eq!(rx.next().await.unwrap_err(), QueryError::EndOfStream);
    }

    #[tokio::test]
    async fn test_dropped_sender_is_end_of_stream() {
        let (tx, mut rx) = stream_channel::<i32>();
        drop(tx);
        assert_eq!(rx.next().await.unwrap_err(), QueryError::EndOfStream);
    }

    #[tokio::test]
    async fn test_try_next_drains_buffered() {
        let (tx, mut rx) = stream_channel();
        tx.send(7);
        assert_eq!(rx.try_next().unwrap().unwrap(), 7);
        assert!(rx.try_next().is_none());
    }

    #[tokio::test]
    async fn test_send_to_dropped_receiver() {
        let (tx, rx) = stream_channel();
        drop(rx);
        assert!(!tx.send(1));
    }

    #[tokio::test]
    async fn test_flow_lock_take_release() {
        let lock = FlowControlLock::new(2);
        lock.take(2).await;
        assert_eq!(lock.available(), 0);
        lock.release(1);
        assert_eq!(lock.available(), 1);
        lock.take(1).await;
        lock.release(2);
        assert_eq!(lock.available(), 2);
    }

    #[tokio::test]
    async fn test_flow_lock_blocks_when_exhausted() {
        let lock = Arc::new(FlowControlLock::new(1));
        lock.take(1).await;
        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.take(1).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        lock.release(1);
        waiter.await.unwrap();
    }
}
