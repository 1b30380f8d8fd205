// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::Arc;

use codec::{EncodePacket, PacketId, QoS};
use tokio::io::AsyncWriteExt;

use crate::connect_state::ConnectState;
use crate::disconnect::DisconnectGate;
use crate::publish::{PublishOutcome, PublishRequest};
use crate::queue::QueueReceiver;
use crate::shared::Shared;
use crate::transaction::TransactionChain;

/// Single long-running task, active only while `Connected` (spec.md §4.H).
/// Shares `shared.writer` with Writer(control) so the two never interleave a
/// partial frame on the wire.
pub async fn run(shared: Arc<Shared>, gate: Arc<DisconnectGate>, mut publish_rx: QueueReceiver<PublishRequest>) {
    loop {
        if shared.session.state() != ConnectState::Connected {
            tokio::select! {
                () = shared.cancellation.cancelled() => break,
                () = shared.session.connected_signal.notified() => {}
            }
            continue;
        }

        let request = tokio::select! {
            () = shared.cancellation.cancelled() => break,
            item = publish_rx.dequeue() => item,
        };
        let Some(request) = request else {
            break;
        };

        if handle_request(&shared, &gate, request).await.is_err() {
            break;
        }
    }

    let dropped = publish_rx.drain_close();
    if dropped > 0 && shared.clean_disconnect() {
        log::warn!("writer(publish): discarded {dropped} queued publish(es) on shutdown");
    }
}

/// `Err(())` means the task must stop (disconnect already triggered, or
/// cancellation observed).
async fn handle_request(
    shared: &Arc<Shared>,
    gate: &Arc<DisconnectGate>,
    request: PublishRequest,
) -> Result<(), ()> {
    let PublishRequest { message, completion } = request;

    if message.qos == QoS::AtMostOnce {
        let packet = match message.into_packet(PacketId::new(0)) {
            Ok(packet) => packet,
            Err(err) => {
                log::error!("writer(publish): failed to build QoS 0 packet: {err}");
                return Ok(());
            }
        };
        let mut buf = Vec::new();
        if let Err(err) = packet.encode(&mut buf) {
            log::error!("writer(publish): failed to encode QoS 0 packet: {err:?}");
            return Ok(());
        }
        return match write_out(shared, &buf).await {
            Ok(()) => {
                if let Some(completion) = completion {
                    let _ignored = completion.send(PublishOutcome::Written);
                }
                Ok(())
            }
            Err(err) => fail(shared, gate, "QoS 0 publish", &err),
        };
    }

    let id = match shared.pid_alloc.acquire() {
        Ok(id) => id,
        Err(err) => {
            log::error!("writer(publish): {err}");
            return Ok(());
        }
    };

    let packet = match message.into_packet(id) {
        Ok(packet) => packet,
        Err(err) => {
            shared.pid_alloc.release(id);
            log::error!("writer(publish): failed to build publish packet: {err}");
            return Ok(());
        }
    };

    let admitted = tokio::select! {
        () = shared.cancellation.cancelled() => return Err(()),
        result = shared.opub.add(id, TransactionChain::new(packet.clone())) => result,
    };
    if let Err(err) = admitted {
        shared.pid_alloc.release(id);
        log::error!(
            "writer(publish): failed to admit outgoing publish {}: {err}",
            id.value()
        );
        return Ok(());
    }

    if let Some(completion) = completion {
        shared.register_completion(id, completion);
    }

    let mut buf = Vec::new();
    if let Err(err) = packet.encode(&mut buf) {
        log::error!("writer(publish): failed to encode publish {}: {err:?}", id.value());
        shared.opub.remove(id);
        shared.pid_alloc.release(id);
        shared.drop_completion(id);
        return Ok(());
    }

    match write_out(shared, &buf).await {
        Ok(()) => Ok(()),
        Err(err) => fail(shared, gate, "QoS 1/2 publish", &err),
    }
}

async fn write_out(shared: &Shared, buf: &[u8]) -> Result<(), crate::error::Error> {
    shared.writer.lock().await.write_all(buf).await?;
    shared.session.touch_activity();
    Ok(())
}

fn fail(shared: &Arc<Shared>, gate: &Arc<DisconnectGate>, what: &str, err: &crate::error::Error) -> Result<(), ()> {
    log::warn!("writer(publish): transport write failed sending {what}: {err}");
    if shared.session.state() == ConnectState::Connected {
        gate.trigger(Arc::clone(shared), false);
    }
    Err(())
}
