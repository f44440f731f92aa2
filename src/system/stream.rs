//! Byte-stream fan-out
//!
//! Duplicates the bytes a guest process writes so attached clients and the
//! per-container log observe the same stream.

use bytes::Bytes;
use tokio::sync::broadcast;

/// Broadcasts byte chunks to any number of subscribers.
///
/// Subscribers that fall behind lose chunks (broadcast lag) rather than
/// back-pressuring the guest.
pub struct StreamPool {
    sender: broadcast::Sender<Bytes>,
}

impl StreamPool {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to chunks published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.sender.subscribe()
    }

    /// Publish one chunk. Dropped silently when nobody is attached.
    pub fn publish(&self, chunk: Bytes) {
        let _ = self.sender.send(chunk);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StreamPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for StreamPool {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_two_subscribers() {
        let pool = StreamPool::new();
        let mut rx1 = pool.subscribe();
        let mut rx2 = pool.subscribe();

        pool.publish(Bytes::from_static(b"hello\n"));

        assert_eq!(rx1.recv().await.unwrap(), Bytes::from_static(b"hello\n"));
        assert_eq!(rx2.recv().await.unwrap(), Bytes::from_static(b"hello\n"));
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let pool = StreamPool::new();
        assert_eq!(pool.subscriber_count(), 0);
        pool.publish(Bytes::from_static(b"dropped"));
    }
}
