// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::Arc;

use codec::v5::{
    Property, PublishCompletePacket, PublishReceivedPacket, PublishReleasePacket, ReasonCode,
};
use codec::{PacketId, QoS};

use crate::commands::{ControlCommand, IncomingPacket, SentNotice};
use crate::connect_state::ConnectState;
use crate::disconnect::DisconnectGate;
use crate::events::Event;
use crate::queue::QueueReceiver;
use crate::shared::Shared;
use crate::transaction::TransactionEntry;

const DEFAULT_BROKER_RECEIVE_MAXIMUM: usize = 65_535;

/// Single long-running task implementing the QoS state machines and CONNACK
/// bookkeeping (spec.md §4.J). Consumes both the received-packets queue
/// (from the Reader) and the sent-notice queue (from Writer(control)), since
/// several transitions only complete once an outgoing ack has actually left
/// the wire.
pub async fn run(
    shared: Arc<Shared>,
    gate: Arc<DisconnectGate>,
    mut incoming_rx: QueueReceiver<IncomingPacket>,
    mut sent_rx: QueueReceiver<SentNotice>,
) {
    loop {
        tokio::select! {
            () = shared.cancellation.cancelled() => break,
            packet = incoming_rx.dequeue() => {
                match packet {
                    Some(packet) => handle_incoming(&shared, &gate, packet),
                    None => break,
                }
            }
            notice = sent_rx.dequeue() => {
                match notice {
                    Some(notice) => handle_sent(&shared, notice),
                    None => break,
                }
            }
        }
    }

    let dropped_incoming = incoming_rx.drain_close();
    let dropped_sent = sent_rx.drain_close();
    if dropped_incoming > 0 || dropped_sent > 0 {
        log::warn!(
            "handler: discarded {dropped_incoming} received and {dropped_sent} sent-notice item(s) on shutdown"
        );
    }
}

fn handle_incoming(shared: &Arc<Shared>, gate: &Arc<DisconnectGate>, packet: IncomingPacket) {
    match packet {
        IncomingPacket::ConnectAck(ack) => handle_connect_ack(shared, gate, &ack),
        IncomingPacket::Publish(publish) => handle_publish(shared, &publish),
        IncomingPacket::PublishAck(ack) => handle_publish_ack(shared, &ack),
        IncomingPacket::PublishReceived(received) => handle_publish_received(shared, &received),
        IncomingPacket::PublishRelease(release) => handle_publish_release(shared, &release),
        IncomingPacket::PublishComplete(complete) => handle_publish_complete(shared, &complete),
        IncomingPacket::SubscribeAck(ack) => {
            shared.pid_alloc.release(ack.packet_id());
            let _ignored = shared.events_tx.send(Event::OnSubscribeAckReceived(ack));
        }
        IncomingPacket::UnsubscribeAck(ack) => {
            shared.pid_alloc.release(ack.packet_id());
            let _ignored = shared.events_tx.send(Event::OnUnsubscribeAckReceived(ack));
        }
        IncomingPacket::PingResponse(_) => {
            let _ignored = shared.events_tx.send(Event::OnPingResponseReceived);
        }
    }
}

fn handle_connect_ack(shared: &Arc<Shared>, gate: &Arc<DisconnectGate>, ack: &codec::v5::ConnectAckPacket) {
    if ack.reason_code() != ReasonCode::Success {
        log::warn!("handler: broker rejected CONNECT: {:?}", ack.reason_code());
        gate.trigger(Arc::clone(shared), false);
        return;
    }

    if !ack.session_present() {
        shared.ipub.clear();
        shared.opub.clear();
        shared.session.clear_subscriptions();
    }

    let receive_maximum = ack
        .properties()
        .props()
        .iter()
        .find_map(|prop| match prop {
            Property::ReceiveMaximum(value) => Some(value.value() as usize),
            _ => None,
        })
        .unwrap_or(DEFAULT_BROKER_RECEIVE_MAXIMUM);
    shared.opub.resize(receive_maximum);

    shared.session.set_connack(ack.clone());
    shared.session.set_state(ConnectState::Connected);
}

fn handle_publish(shared: &Arc<Shared>, publish: &codec::v5::PublishPacket) {
    match publish.qos() {
        QoS::AtMostOnce => {
            let _ignored = shared.events_tx.send(Event::OnMessageReceived(publish.clone()));
        }
        QoS::AtLeastOnce => {
            if shared.options.manual_ack_enabled() {
                let _ignored = shared.events_tx.send(Event::OnMessageReceived(publish.clone()));
            } else {
                let mut ack = codec::v5::PublishAckPacket::new(publish.packet_id());
                ack.set_reason_code(ReasonCode::Success);
                let _ignored = shared.control_tx.enqueue(ControlCommand::PublishAck(ack));
            }
        }
        QoS::ExactOnce => {
            if shared.options.manual_ack_enabled() {
                let _ignored = shared.events_tx.send(Event::OnMessageReceived(publish.clone()));
            } else {
                let mut received = PublishReceivedPacket::new(publish.packet_id());
                received.set_reason_code(ReasonCode::Success);
                let _ignored = shared
                    .control_tx
                    .enqueue(ControlCommand::PublishReceived(received));
            }
        }
    }
}

fn handle_publish_release(shared: &Arc<Shared>, release: &PublishReleasePacket) {
    let id = release.packet_id();
    let reason = if let Some(mut chain) = shared.ipub.get(id) {
        let expected_len = chain.entries().len();
        chain.push(TransactionEntry::PublishRelease(release.clone()));
        let _ignored = shared.ipub.update(id, chain, expected_len);
        ReasonCode::Success
    } else {
        ReasonCode::PacketIdentifierNotFound
    };

    let mut complete = PublishCompletePacket::new(id);
    complete.set_reason_code(reason);
    let _ignored = shared.control_tx.enqueue(ControlCommand::PublishComplete(complete));
}

fn handle_publish_ack(shared: &Arc<Shared>, ack: &codec::v5::PublishAckPacket) {
    let id = ack.packet_id();
    if shared.opub.remove(id).is_none() {
        log::warn!("handler: PUBACK for unknown outgoing packet id {}", id.value());
        return;
    }
    shared.pid_alloc.release(id);
    finish_outgoing(shared, id, ack.reason_code());
}

fn handle_publish_received(shared: &Arc<Shared>, received: &PublishReceivedPacket) {
    let id = received.packet_id();
    if (received.reason_code() as u8) >= 0x80 {
        if shared.opub.remove(id).is_some() {
            shared.pid_alloc.release(id);
            finish_outgoing(shared, id, received.reason_code());
        } else {
            log::warn!("handler: PUBREC for unknown outgoing packet id {}", id.value());
        }
        return;
    }

    let Some(mut chain) = shared.opub.get(id) else {
        log::warn!("handler: PUBREC for unknown outgoing packet id {}", id.value());
        return;
    };
    let expected_len = chain.entries().len();
    chain.push(TransactionEntry::PublishReceived(received.clone()));
    let _ignored = shared.opub.update(id, chain, expected_len);

    let release = PublishReleasePacket::new(id);
    let _ignored = shared.control_tx.enqueue(ControlCommand::PublishRelease(release));
}

fn handle_publish_complete(shared: &Arc<Shared>, complete: &PublishCompletePacket) {
    let id = complete.packet_id();
    if shared.opub.remove(id).is_none() {
        log::warn!("handler: PUBCOMP for unknown outgoing packet id {}", id.value());
        return;
    }
    shared.pid_alloc.release(id);
    finish_outgoing(shared, id, complete.reason_code());
}

fn finish_outgoing(shared: &Shared, id: PacketId, reason: ReasonCode) {
    shared.fire_completion(id, reason);
    let _ignored = shared
        .events_tx
        .send(Event::OnPublishComplete { packet_id: id, reason });
}

/// A post-send hook from Writer(control): the auto-ack path's event only
/// fires once the ack has actually left the wire (spec.md §4.J), and the
/// inbound transaction chain is only freed at the same moment.
fn handle_sent(shared: &Shared, notice: SentNotice) {
    match notice {
        SentNotice::PublishAckSent(id) => {
            if let Some(chain) = shared.ipub.remove(id) {
                if !shared.options.manual_ack_enabled() {
                    let _ignored = shared
                        .events_tx
                        .send(Event::OnMessageReceived(chain.origin().clone()));
                }
            }
        }
        SentNotice::PublishCompleteSent(id, _reason) => {
            if let Some(chain) = shared.ipub.remove(id) {
                if !shared.options.manual_ack_enabled() {
                    let _ignored = shared
                        .events_tx
                        .send(Event::OnMessageReceived(chain.origin().clone()));
                }
            }
        }
    }
}
