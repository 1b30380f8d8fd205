// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::Arc;

use codec::EncodePacket;
use tokio::io::AsyncWriteExt;

use crate::commands::{ControlCommand, SentNotice};
use crate::connect_state::ConnectState;
use crate::disconnect::DisconnectGate;
use crate::queue::QueueReceiver;
use crate::shared::Shared;

/// Single long-running task, runs in every state (spec.md §4.G). The only
/// task permitted to transmit `CONNECT`/`DISCONNECT`; every other control
/// packet (acks, (un)subscribe, pingreq) is funneled through the same queue
/// so writes stay serialized with Writer(publish) via `shared.writer`.
pub async fn run(shared: Arc<Shared>, gate: Arc<DisconnectGate>, mut control_rx: QueueReceiver<ControlCommand>) {
    loop {
        let command = tokio::select! {
            () = shared.cancellation.cancelled() => break,
            item = control_rx.dequeue() => item,
        };
        let Some(command) = command else {
            break;
        };

        let mut buf = Vec::new();
        if let Err(err) = encode_command(&command, &mut buf) {
            log::error!("writer(control): failed to encode {command:?}: {err:?}");
            continue;
        }

        match shared.writer.lock().await.write_all(&buf).await {
            Ok(()) => {
                shared.session.touch_activity();
                dispatch_sent_hook(&shared, &command);
            }
            Err(err) => {
                log::warn!("writer(control): transport write failed: {err}");
                if shared.session.state() == ConnectState::Connected {
                    gate.trigger(Arc::clone(&shared), false);
                }
                break;
            }
        }
    }

    let dropped = control_rx.drain_close();
    if dropped > 0 && shared.clean_disconnect() {
        log::warn!("writer(control): discarded {dropped} queued command(s) on shutdown");
    }
}

fn encode_command(command: &ControlCommand, buf: &mut Vec<u8>) -> Result<usize, codec::EncodeError> {
    match command {
        ControlCommand::Connect(packet) => packet.encode(buf),
        ControlCommand::Disconnect(packet) => packet.encode(buf),
        ControlCommand::PublishAck(packet) => packet.encode(buf),
        ControlCommand::PublishReceived(packet) => packet.encode(buf),
        ControlCommand::PublishRelease(packet) => packet.encode(buf),
        ControlCommand::PublishComplete(packet) => packet.encode(buf),
        ControlCommand::Subscribe(packet) => packet.encode(buf),
        ControlCommand::Unsubscribe(packet) => packet.encode(buf),
        ControlCommand::PingRequest(packet) => packet.encode(buf),
    }
}

/// Fire the post-send hooks the handler relies on to finalize the QoS state
/// machine at the moment a packet actually leaves the wire, not when it was
/// enqueued (spec.md §4.J).
fn dispatch_sent_hook(shared: &Shared, command: &ControlCommand) {
    let notice = match command {
        ControlCommand::PublishAck(packet) => Some(SentNotice::PublishAckSent(packet.packet_id())),
        ControlCommand::PublishComplete(packet) => {
            Some(SentNotice::PublishCompleteSent(packet.packet_id(), packet.reason_code()))
        }
        _ => None,
    };
    if let Some(notice) = notice {
        let _ignored = shared.sent_tx.enqueue(notice);
    }
}
