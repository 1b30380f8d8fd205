// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Instant;

use codec::v5::ConnectAckPacket;

use crate::connect_state::{AtomicConnectState, ConnectState, RecreatableSignal};

/// Single-writer, many-reader connection state.
///
/// `state` is lock-free (any task may read it); the two signals derive from
/// its transitions (fired exclusively by the connect path and the
/// disconnection gate, per spec.md §3). Cached CONNACK properties are
/// replaced atomically on CONNACK and nulled on disconnect, so the publish
/// hot path reads a consistent snapshot without locks beyond the mutex
/// guarding the rarely-written snapshot itself.
#[derive(Debug, Default)]
pub struct Session {
    state: AtomicConnectState,

    /// Fires on Disconnected -> Connected.
    pub connected_signal: RecreatableSignal,

    /// Fires on Disconnected -> any other state.
    pub not_disconnected_signal: RecreatableSignal,

    /// Fires when the state transitions to Disconnected (both the clean
    /// application-requested path and a fault-triggered one). Lets callers
    /// like `AsyncClient::connect` race a failed handshake against a
    /// successful one without a dedicated channel.
    pub disconnected_signal: RecreatableSignal,

    connack: Mutex<Option<ConnectAckPacket>>,
    subscriptions: Mutex<HashSet<String>>,

    /// Timestamp of the last packet successfully written to the wire.
    /// Restarted by the control writer on every send (spec.md §4.G) and
    /// read by the monitor task to decide when a PINGREQ is due.
    last_activity: Mutex<Option<Instant>>,
}

impl Session {
    #[must_use]
    pub fn state(&self) -> ConnectState {
        self.state.load()
    }

    pub fn set_state(&self, state: ConnectState) {
        self.state.store(state);
        match state {
            ConnectState::Connected => self.connected_signal.fire(),
            ConnectState::Disconnected => self.disconnected_signal.fire(),
            _ => self.not_disconnected_signal.fire(),
        }
    }

    /// Store the broker's CONNACK as the current connection properties
    /// snapshot.
    pub fn set_connack(&self, connack: ConnectAckPacket) {
        *self.connack.lock().expect("session connack mutex poisoned") = Some(connack);
    }

    #[must_use]
    pub fn connack(&self) -> Option<ConnectAckPacket> {
        self.connack.lock().expect("session connack mutex poisoned").clone()
    }

    /// Clear the cached CONNACK. Called on disconnect (spec.md §4.L step 6).
    pub fn clear_connack(&self) {
        *self.connack.lock().expect("session connack mutex poisoned") = None;
    }

    pub fn add_subscription(&self, filter: &str) {
        self.subscriptions
            .lock()
            .expect("session subscriptions mutex poisoned")
            .insert(filter.to_owned());
    }

    pub fn remove_subscription(&self, filter: &str) {
        self.subscriptions
            .lock()
            .expect("session subscriptions mutex poisoned")
            .remove(filter);
    }

    /// Cleared when CONNACK reports `SessionPresent == false` (spec.md §4.J).
    pub fn clear_subscriptions(&self) {
        self.subscriptions
            .lock()
            .expect("session subscriptions mutex poisoned")
            .clear();
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().expect("session subscriptions mutex poisoned").len()
    }

    /// Restart the last-communication clock. Called after every successful
    /// write (spec.md §4.G).
    pub fn touch_activity(&self) {
        *self.last_activity.lock().expect("session last_activity mutex poisoned") = Some(Instant::now());
    }

    /// Time elapsed since the last successful write, if any has happened yet.
    #[must_use]
    pub fn idle_for(&self) -> Option<std::time::Duration> {
        self.last_activity
            .lock()
            .expect("session last_activity mutex poisoned")
            .map(|instant| instant.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_disconnected() {
        let session = Session::default();
        assert_eq!(session.state(), ConnectState::Disconnected);
        assert!(session.connack().is_none());
    }

    #[test]
    fn test_subscriptions_tracked_and_cleared() {
        let session = Session::default();
        session.add_subscription("a/+");
        assert_eq!(session.subscription_count(), 1);
        session.clear_subscriptions();
        assert_eq!(session.subscription_count(), 0);
    }
}
