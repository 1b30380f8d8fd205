// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::sync::Mutex;

use codec::v5::{
    PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket,
};
use codec::PacketId;
use tokio::sync::Semaphore;

use crate::error::{Error, ErrorKind};

/// One packet observed as part of a QoS exchange.
///
/// A [`TransactionChain`] always begins with a `Publish` entry; later
/// entries record every ack/release seen afterwards.
#[derive(Debug, Clone)]
pub enum TransactionEntry {
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
}

/// Ordered record of the packets participating in one QoS exchange, keyed by
/// packet identifier.
#[derive(Debug, Clone)]
pub struct TransactionChain {
    entries: Vec<TransactionEntry>,
}

impl TransactionChain {
    #[must_use]
    pub fn new(publish: PublishPacket) -> Self {
        Self {
            entries: vec![TransactionEntry::Publish(publish)],
        }
    }

    pub fn push(&mut self, entry: TransactionEntry) {
        self.entries.push(entry);
    }

    #[must_use]
    pub fn entries(&self) -> &[TransactionEntry] {
        &self.entries
    }

    /// The `Publish` that originated this chain.
    #[must_use]
    pub fn origin(&self) -> &PublishPacket {
        match &self.entries[0] {
            TransactionEntry::Publish(publish) => publish,
            _ => unreachable!("first entry of a TransactionChain is always Publish"),
        }
    }
}

/// A keyed in-flight map with capacity-based admission backpressure.
///
/// Generalizes the teacher's plain `HashMap<PacketId, V>` fields
/// (`ruo/src/client.rs::subscribing_packets`,
/// `hebo/src/session/mod.rs::pub_recv_packets`) with a
/// [`tokio::sync::Semaphore`] gating `add`, matching the teacher's use of
/// `tokio::sync` primitives for coordination elsewhere in the workspace.
#[derive(Debug)]
pub struct BoundedTransactionMap {
    entries: Mutex<HashMap<u16, TransactionChain>>,
    admission: Semaphore,
}

impl BoundedTransactionMap {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            admission: Semaphore::new(capacity),
        }
    }

    /// Insert a new chain for `id`, blocking until a capacity permit is free.
    ///
    /// # Errors
    /// Returns [`ErrorKind::PidError`] if `id` is already reserved (an
    /// internal invariant violation: the caller must already have screened
    /// for `DUP` retransmits) or if the semaphore was closed concurrently
    /// with [`Self::clear`].
    pub async fn add(&self, id: PacketId, chain: TransactionChain) -> Result<(), Error> {
        let permit = self.admission.acquire().await.map_err(|_err| {
            Error::new(ErrorKind::PidError, "transaction map closed during add")
        })?;
        permit.forget();
        let mut entries = self.entries.lock().expect("transaction map poisoned");
        if entries.contains_key(&id.value()) {
            drop(entries);
            self.admission.add_permits(1);
            return Err(Error::new(
                ErrorKind::PidError,
                &format!("duplicate transaction id {}", id.value()),
            ));
        }
        entries.insert(id.value(), chain);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: PacketId) -> Option<TransactionChain> {
        self.entries
            .lock()
            .expect("transaction map poisoned")
            .get(&id.value())
            .cloned()
    }

    /// Optimistic replace: only stores `new` if the current value still
    /// equals `expected_current_value` (compared by entry count, since
    /// `TransactionChain` carries no version counter of its own).
    #[must_use]
    pub fn update(
        &self,
        id: PacketId,
        new: TransactionChain,
        expected_len: usize,
    ) -> bool {
        let mut entries = self.entries.lock().expect("transaction map poisoned");
        match entries.get(&id.value()) {
            Some(current) if current.entries().len() == expected_len => {
                entries.insert(id.value(), new);
                true
            }
            _ => false,
        }
    }

    /// Remove the chain for `id`, freeing one admission permit.
    pub fn remove(&self, id: PacketId) -> Option<TransactionChain> {
        let removed = self
            .entries
            .lock()
            .expect("transaction map poisoned")
            .remove(&id.value());
        if removed.is_some() {
            self.admission.add_permits(1);
        }
        removed
    }

    /// Empty the map and wake all pending `add` callers by restoring every
    /// permit.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().expect("transaction map poisoned");
        let drained = entries.len();
        entries.clear();
        drop(entries);
        self.admission.add_permits(drained);
    }

    /// Resize capacity to `new_capacity`, e.g. after CONNACK advertises the
    /// broker's `ReceiveMaximum`.
    pub fn resize(&self, new_capacity: usize) {
        let current_in_flight = self.entries.lock().expect("transaction map poisoned").len();
        let available = self.admission.available_permits();
        let current_capacity = current_in_flight + available;
        if new_capacity > current_capacity {
            self.admission.add_permits(new_capacity - current_capacity);
        } else if new_capacity < current_capacity {
            let to_forget = current_capacity - new_capacity;
            let forgettable = to_forget.min(available);
            self.admission.forget_permits(forgettable);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("transaction map poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_publish() -> PublishPacket {
        PublishPacket::new("a/b", codec::QoS::AtLeastOnce, &[1, 2, 3]).unwrap()
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let map = BoundedTransactionMap::new(2);
        let id = PacketId::new(1);
        map.add(id, TransactionChain::new(sample_publish()))
            .await
            .unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.get(id).is_some());
        assert!(map.remove(id).is_some());
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_id() {
        let map = BoundedTransactionMap::new(2);
        let id = PacketId::new(1);
        map.add(id, TransactionChain::new(sample_publish()))
            .await
            .unwrap();
        assert!(map
            .add(id, TransactionChain::new(sample_publish()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_capacity_backpressure() {
        let map = std::sync::Arc::new(BoundedTransactionMap::new(1));
        map.add(PacketId::new(1), TransactionChain::new(sample_publish()))
            .await
            .unwrap();

        let map2 = map.clone();
        let blocked = tokio::spawn(async move {
            map2.add(PacketId::new(2), TransactionChain::new(sample_publish()))
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        map.remove(PacketId::new(1));
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_clear_wakes_pending_add() {
        let map = std::sync::Arc::new(BoundedTransactionMap::new(1));
        map.add(PacketId::new(1), TransactionChain::new(sample_publish()))
            .await
            .unwrap();

        let map2 = map.clone();
        let blocked = tokio::spawn(async move {
            map2.add(PacketId::new(2), TransactionChain::new(sample_publish()))
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        map.clear();
        blocked.await.unwrap().unwrap();
    }
}
