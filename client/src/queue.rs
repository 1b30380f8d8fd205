// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use tokio::sync::mpsc;

/// FIFO queue used for outgoing publishes, outgoing non-publishes, and
/// received packets awaiting handling.
///
/// `enqueue` never blocks the hot path (bounding comes from the transaction
/// maps, not the queue); `dequeue` suspends until an item is available or
/// the queue is closed. Generalizes the teacher's uniform use of
/// `tokio::sync::mpsc::{Sender, Receiver}` of command enums
/// (`hebo/src/commands.rs`) into a named pair.
#[derive(Debug)]
pub struct QueueSender<T>(mpsc::UnboundedSender<T>);

#[derive(Debug)]
pub struct QueueReceiver<T>(mpsc::UnboundedReceiver<T>);

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Create a new awaitable queue, returning its sender/receiver halves.
#[must_use]
pub fn awaitable_queue<T>() -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueSender(tx), QueueReceiver(rx))
}

impl<T> QueueSender<T> {
    /// Non-blocking enqueue.
    ///
    /// # Errors
    /// Returns the item back if the receiving end has been dropped.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        self.0.send(item).map_err(|err| err.0)
    }
}

impl<T> QueueReceiver<T> {
    /// Suspend until an item is available, or `None` once every sender has
    /// been dropped (queue closed). Cancellation-safe: dropping the future
    /// returned by this call loses nothing — no item is removed from the
    /// channel until this call actually resolves.
    pub async fn dequeue(&mut self) -> Option<T> {
        self.0.recv().await
    }

    pub fn close(&mut self) {
        self.0.close();
    }

    /// Close the queue and drain whatever was already buffered, returning
    /// the count. Used by the writer tasks to report queue non-emptiness at
    /// shutdown (spec.md §4.L step 7) without anyone else needing to hold
    /// onto their receiver.
    pub fn drain_close(&mut self) -> usize {
        self.0.close();
        let mut drained = 0;
        while self.0.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_dequeue_order() {
        let (tx, mut rx) = awaitable_queue::<u32>();
        tx.enqueue(1).unwrap();
        tx.enqueue(2).unwrap();
        assert_eq!(rx.dequeue().await, Some(1));
        assert_eq!(rx.dequeue().await, Some(2));
    }

    #[tokio::test]
    async fn test_dequeue_returns_none_after_senders_dropped() {
        let (tx, mut rx) = awaitable_queue::<u32>();
        drop(tx);
        assert_eq!(rx.dequeue().await, None);
    }
}
