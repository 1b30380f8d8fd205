// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

/// Mqtt connection status.
///
/// Stored atomically (see [`AtomicConnectState`]) so any task may read the
/// current state without locking; only the connect path and the
/// disconnection gate ever write it.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    /// No connection attempt is in flight and none has succeeded yet.
    Disconnected,

    /// The client sent a Connect packet to the server and is waiting for a
    /// `ConnAck` reply.
    Connecting,

    /// The client is connected. Publish/subscribe packets can be sent now.
    Connected,

    /// The client is tearing down the connection. No new packets (other than
    /// the final Disconnect) shall be sent.
    Disconnecting,
}

impl ConnectState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Disconnecting => 3,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnecting,
        }
    }
}

/// Lock-free holder of [`ConnectState`].
#[derive(Debug)]
pub struct AtomicConnectState(AtomicU8);

impl Default for AtomicConnectState {
    fn default() -> Self {
        Self(AtomicU8::new(ConnectState::Disconnected.as_u8()))
    }
}

impl AtomicConnectState {
    #[must_use]
    pub fn load(&self) -> ConnectState {
        ConnectState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ConnectState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// A one-shot, recreatable wakeup signal.
///
/// Wraps a [`tokio::sync::Notify`] behind a mutex-guarded slot so the whole
/// signal can be replaced with a fresh `Notify` at the start of each connect
/// cycle, matching the "one-shot, recreatable" requirement: waiters that
/// subscribed before a reset never see a notification meant for the next
/// cycle.
#[derive(Debug, Default)]
pub struct RecreatableSignal(Mutex<std::sync::Arc<Notify>>);

impl RecreatableSignal {
    /// Wake every current waiter.
    pub fn fire(&self) {
        self.0.lock().expect("signal mutex poisoned").notify_waiters();
    }

    /// Discard stale waiters and start a fresh cycle.
    pub fn reset(&self) {
        *self.0.lock().expect("signal mutex poisoned") = std::sync::Arc::new(Notify::new());
    }

    /// Suspend until the next [`Self::fire`] call.
    pub async fn notified(&self) {
        let notify = self.0.lock().expect("signal mutex poisoned").clone();
        notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_state_roundtrip() {
        for state in [
            ConnectState::Disconnected,
            ConnectState::Connecting,
            ConnectState::Connected,
            ConnectState::Disconnecting,
        ] {
            assert_eq!(ConnectState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_atomic_connect_state_default() {
        let state = AtomicConnectState::default();
        assert_eq!(state.load(), ConnectState::Disconnected);
        state.store(ConnectState::Connected);
        assert_eq!(state.load(), ConnectState::Connected);
    }

    #[tokio::test]
    async fn test_recreatable_signal_fires_current_waiters() {
        let signal = std::sync::Arc::new(RecreatableSignal::default());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal.notified().await;
            })
        };
        tokio::task::yield_now().await;
        signal.fire();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should complete")
            .expect("task should not panic");
    }
}
