// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::connect_state::ConnectState;
use crate::events::Event;
use crate::shared::Shared;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The four tasks whose completion the disconnect sequence must observe
/// before the transport is closed. The Monitor is deliberately excluded: it
/// is usually the task that *triggers* this sequence, and joining it here
/// would deadlock when it does.
pub struct TaskHandles {
    pub writer_control: JoinHandle<()>,
    pub writer_publish: JoinHandle<()>,
    pub reader: JoinHandle<()>,
    pub handler: JoinHandle<()>,
}

/// Non-reentrant disconnection gate (spec.md §4.L, §5).
///
/// Grounded on the teacher's `Status::Disconnecting -> Disconnected`
/// transition (`hebo/src/session/mod.rs`) plus a `tokio::sync::Semaphore`
/// acquired without blocking, collapsing concurrent disconnect requests into
/// a single execution (testable property 7).
pub struct DisconnectGate {
    gate: Arc<Semaphore>,
    completed: Notify,
    handles: tokio::sync::Mutex<Option<TaskHandles>>,
}

impl DisconnectGate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(1)),
            completed: Notify::new(),
            handles: tokio::sync::Mutex::new(None),
        }
    }

    /// Record the four joinable task handles once they have been spawned.
    /// Must be called before the first disconnect can run to completion.
    pub async fn install_handles(&self, handles: TaskHandles) {
        *self.handles.lock().await = Some(handles);
    }

    /// Whether any of the four joined tasks has already exited, without
    /// taking ownership of the handles (the monitor task polls this instead
    /// of holding its own copies, since a `JoinHandle` has a single owner).
    pub async fn any_task_finished(&self) -> bool {
        match self.handles.lock().await.as_ref() {
            Some(handles) => {
                handles.writer_control.is_finished()
                    || handles.writer_publish.is_finished()
                    || handles.reader.is_finished()
                    || handles.handler.is_finished()
            }
            None => false,
        }
    }

    /// Fire-and-forget trigger used by runtime tasks that detect a fault
    /// (transport failure, protocol violation, task death) and must not
    /// block on the shutdown sequence themselves. Returns immediately if a
    /// disconnect is already in flight.
    pub fn trigger(self: &Arc<Self>, shared: Arc<Shared>, clean: bool) {
        let Ok(permit) = Arc::clone(&self.gate).try_acquire_owned() else {
            return;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_sequence(&shared, clean).await;
            drop(permit);
            this.completed.notify_waiters();
        });
    }

    /// Same as [`Self::trigger`], but awaits completion of the sequence
    /// (whether this call started it or another concurrent caller did).
    /// Used by the application-facing `disconnect()` call.
    pub async fn disconnect_and_wait(self: &Arc<Self>, shared: &Arc<Shared>, clean: bool) {
        match Arc::clone(&self.gate).try_acquire_owned() {
            Ok(permit) => {
                self.run_sequence(shared, clean).await;
                drop(permit);
                self.completed.notify_waiters();
            }
            Err(_) => {
                let notified = self.completed.notified();
                if shared.session.state() == ConnectState::Disconnected {
                    return;
                }
                notified.await;
            }
        }
    }

    /// Spec.md §4.L, steps 1-8.
    async fn run_sequence(&self, shared: &Arc<Shared>, clean: bool) {
        // Step 1.
        if shared.session.state() == ConnectState::Disconnected {
            return;
        }

        // Step 2.
        shared.session.connected_signal.reset();

        // Step 3: cancel every task and await completion with a bounded
        // timeout. Cancellation is cooperative (CancellationToken), not
        // `JoinHandle::abort`, so each task gets a chance to drain its own
        // queue and log non-emptiness (step 7, clean disconnects only)
        // before returning.
        shared.set_clean_disconnect(clean);
        shared.cancellation.cancel();
        let handles = self.handles.lock().await.take();
        if let Some(handles) = handles {
            await_with_timeout("writer(control)", handles.writer_control).await;
            await_with_timeout("writer(publish)", handles.writer_publish).await;
            await_with_timeout("reader", handles.reader).await;
            await_with_timeout("handler", handles.handler).await;
        } else {
            log::warn!("disconnect sequence ran before task handles were installed");
        }

        // Step 4.
        if let Err(err) = shared.writer.lock().await.shutdown().await {
            log::debug!("error shutting down transport (already closed?): {err}");
        }

        // Step 5.
        shared.session.set_state(ConnectState::Disconnected);
        shared.session.not_disconnected_signal.reset();

        // Step 6.
        shared.session.clear_connack();

        // Step 7 is carried out by each task's own cancellation handling
        // (they drain and log their owned receiver before returning).

        // Step 8.
        let _ignored = shared.events_tx.send(Event::AfterDisconnect { clean });
    }
}

impl Default for DisconnectGate {
    fn default() -> Self {
        Self::new()
    }
}

async fn await_with_timeout(name: &str, handle: JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::error!("{name} task panicked during shutdown: {err}"),
        Err(_elapsed) => log::warn!("{name} task did not exit within {SHUTDOWN_TIMEOUT:?}"),
    }
}
