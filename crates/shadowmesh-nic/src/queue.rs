//! Bounded frame queues decoupling blocking kernel I/O from the tunnel
//! pipeline (§4.1).
//!
//! Both queues hold ≈2000 frames by default. On overrun, frames are
//! *dropped*, never blocked — a full inbound queue would otherwise stall the
//! kernel ring, and a full outbound queue would otherwise stall the
//! encryption pipeline. The two directions bias differently: the kernel→app
//! queue drops the oldest frame to make room (prefer fresh traffic), the
//! app→kernel queue drops the newest arrival (prefer frames already
//! admitted, matching the pipeline's preference for already-authenticated
//! data in §4.8).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// Default bounded queue depth (§4.1).
pub const DEFAULT_QUEUE_DEPTH: usize = 2000;

/// Overrun bias: which frame is sacrificed when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrunPolicy {
    /// Drop the oldest queued frame to make room for the new one.
    DropOldest,
    /// Drop the incoming frame, keep the queue as-is.
    DropNewest,
}

/// A bounded, drop-on-overrun queue of raw frame bytes.
///
/// Built on a `tokio::sync::mpsc` channel sized to `depth`; overrun handling
/// is implemented at the call site in [`FrameQueue::push`] rather than via
/// the channel's own backpressure, since `mpsc::Sender::try_send` only
/// supports drop-newest natively.
pub struct FrameQueue {
    sender: mpsc::Sender<Vec<u8>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    policy: OverrunPolicy,
    dropped: Arc<AtomicU64>,
}

impl FrameQueue {
    /// Construct a queue with the given depth and overrun policy.
    #[must_use]
    pub fn new(depth: usize, policy: OverrunPolicy) -> Self {
        let (sender, receiver) = mpsc::channel(depth.max(1));
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            policy,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of frames dropped due to overrun since construction.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Enqueue a frame, applying the configured overrun policy if full.
    pub async fn push(&self, frame: Vec<u8>) {
        match self.sender.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => match self.policy {
                OverrunPolicy::DropNewest => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                OverrunPolicy::DropOldest => {
                    let mut receiver = self.receiver.lock().await;
                    let _ = receiver.try_recv();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    drop(receiver);
                    // Best-effort: the slot freed above may already have
                    // been taken by a concurrent consumer, in which case
                    // this frame is dropped too rather than risk blocking.
                    if self.sender.try_send(frame).is_err() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Await the next frame. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Vec<u8>> {
        self.receiver.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drop_newest_keeps_earlier_frames() {
        let queue = FrameQueue::new(2, OverrunPolicy::DropNewest);
        queue.push(vec![1]).await;
        queue.push(vec![2]).await;
        queue.push(vec![3]).await; // dropped
        assert_eq!(queue.pop().await, Some(vec![1]));
        assert_eq!(queue.pop().await, Some(vec![2]));
        assert_eq!(queue.dropped_count(), 1);
    }

    #[tokio::test]
    async fn drop_oldest_makes_room_for_newest() {
        let queue = FrameQueue::new(2, OverrunPolicy::DropOldest);
        queue.push(vec![1]).await;
        queue.push(vec![2]).await;
        queue.push(vec![3]).await; // drops [1], admits [3]
        assert_eq!(queue.pop().await, Some(vec![2]));
        assert_eq!(queue.pop().await, Some(vec![3]));
        assert_eq!(queue.dropped_count(), 1);
    }
}
