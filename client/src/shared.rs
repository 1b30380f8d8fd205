// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use codec::v5::ReasonCode;
use codec::PacketId;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::cancellation::CancellationToken;
use crate::commands::{ControlCommand, IncomingPacket, SentNotice};
use crate::connect_options::ConnectOptions;
use crate::events::Event;
use crate::packet_id_allocator::PacketIdAllocator;
use crate::publish::{PublishOutcome, PublishRequest};
use crate::queue::QueueSender;
use crate::session::Session;
use crate::transaction::BoundedTransactionMap;
use crate::transport::TransportWriter;

/// Cross-task context for one connection cycle: everything Writer(control),
/// Writer(publish), Reader, the Handler, and the Monitor need to reach each
/// other. Generalizes the teacher's wiring between `Listener`/`Session`/
/// `Dispatcher` (`hebo/src/listener/run.rs`) into a single struct shared via
/// `Arc` rather than threaded through every function call individually.
pub struct Shared {
    pub options: ConnectOptions,
    pub session: Session,

    pub control_tx: QueueSender<ControlCommand>,
    pub publish_tx: QueueSender<PublishRequest>,
    pub incoming_tx: QueueSender<IncomingPacket>,
    pub sent_tx: QueueSender<SentNotice>,

    /// Serializes writes across Writer(control) and Writer(publish)
    /// (spec.md §5: "writes are serialized by an internal mutual-exclusion
    /// primitive").
    pub writer: AsyncMutex<TransportWriter>,

    pub ipub: BoundedTransactionMap,
    pub opub: BoundedTransactionMap,
    pub pid_alloc: PacketIdAllocator,

    pub events_tx: mpsc::UnboundedSender<Event>,
    pub cancellation: std::sync::Arc<CancellationToken>,

    /// Set by the disconnect sequence just before cancelling the tasks, so
    /// Writer(control)/Writer(publish) know whether the drain they perform
    /// on the way out happened as part of a clean disconnect (spec.md §4.L
    /// step 7) or a fault-triggered one. Defaults to `true` since a task
    /// that exits without the gate ever running (e.g. test teardown) is not
    /// a fault.
    clean_disconnect: AtomicBool,

    /// Per-publish completion sinks, keyed by packet id, for outgoing QoS
    /// 1/2 publishes admitted onto `OPubTransactions`. Populated by
    /// Writer(publish) right after admission, consumed by the handler when
    /// the final ack is observed (spec.md §9 design note).
    completions: Mutex<HashMap<u16, oneshot::Sender<PublishOutcome>>>,
}

impl Shared {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: ConnectOptions,
        session: Session,
        control_tx: QueueSender<ControlCommand>,
        publish_tx: QueueSender<PublishRequest>,
        incoming_tx: QueueSender<IncomingPacket>,
        sent_tx: QueueSender<SentNotice>,
        writer: TransportWriter,
        ipub: BoundedTransactionMap,
        opub: BoundedTransactionMap,
        pid_alloc: PacketIdAllocator,
        events_tx: mpsc::UnboundedSender<Event>,
        cancellation: std::sync::Arc<CancellationToken>,
    ) -> Self {
        Self {
            options,
            session,
            control_tx,
            publish_tx,
            incoming_tx,
            sent_tx,
            writer: AsyncMutex::new(writer),
            ipub,
            opub,
            pid_alloc,
            events_tx,
            cancellation,
            clean_disconnect: AtomicBool::new(true),
            completions: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_clean_disconnect(&self, clean: bool) {
        self.clean_disconnect.store(clean, Ordering::Relaxed);
    }

    pub fn clean_disconnect(&self) -> bool {
        self.clean_disconnect.load(Ordering::Relaxed)
    }

    pub fn register_completion(&self, id: PacketId, sink: oneshot::Sender<PublishOutcome>) {
        self.completions
            .lock()
            .expect("completions mutex poisoned")
            .insert(id.value(), sink);
    }

    pub fn fire_completion(&self, id: PacketId, reason: ReasonCode) {
        if let Some(sink) = self
            .completions
            .lock()
            .expect("completions mutex poisoned")
            .remove(&id.value())
        {
            let _ignored = sink.send(PublishOutcome::Acknowledged(reason));
        }
    }

    pub fn drop_completion(&self, id: PacketId) {
        self.completions
            .lock()
            .expect("completions mutex poisoned")
            .remove(&id.value());
    }
}
