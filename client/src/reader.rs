// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::Arc;

use codec::v5::{DisconnectPacket, FixedHeader, ReasonCode};
use codec::{ByteArray, ControlPacket, DecodeOutcome, DecodePacket, QoS};

use crate::commands::{ControlCommand, IncomingPacket};
use crate::connect_state::ConnectState;
use crate::disconnect::DisconnectGate;
use crate::shared::Shared;
use crate::transaction::TransactionChain;
use crate::transport::TransportReader;

/// Runs while the connection is `Connecting` or `Connected` (spec.md §4.I).
/// Owns the transport's read half exclusively: nothing else ever calls
/// `read_buf` on it, matching spec.md §5 ("`read` has a single consumer by
/// convention").
pub async fn run(shared: Arc<Shared>, gate: Arc<DisconnectGate>, mut reader: TransportReader) {
    let mut buf = Vec::new();

    loop {
        tokio::select! {
            () = shared.cancellation.cancelled() => {
                log::debug!("reader task cancelled");
                return;
            }
            result = reader.read_buf(&mut buf) => {
                match result {
                    Ok(0) => {
                        log::warn!("reader: transport closed by peer");
                        trigger_if_connected(&shared, &gate, false);
                        return;
                    }
                    Ok(_n) => {}
                    Err(err) => {
                        log::warn!("reader: transport read error: {err}");
                        trigger_if_connected(&shared, &gate, false);
                        return;
                    }
                }
            }
        }

        loop {
            if let Some(declared_len) = peek_declared_len(&buf) {
                if let Some(max) = shared.options.maximum_packet_size() {
                    if declared_len > max as usize {
                        log::warn!("reader: packet of {declared_len} bytes exceeds MaximumPacketSize {max}");
                        send_disconnect(&shared, ReasonCode::PacketTooLarge);
                        trigger_if_connected(&shared, &gate, false);
                        return;
                    }
                }
            }

            match codec::decode(&buf) {
                DecodeOutcome::Partial => break,
                DecodeOutcome::Malformed(err) => {
                    log::warn!("reader: malformed packet: {err:?}");
                    send_disconnect(&shared, ReasonCode::MalformedPacket);
                    trigger_if_connected(&shared, &gate, false);
                    return;
                }
                DecodeOutcome::Packet(packet, consumed) => {
                    buf.drain(..consumed);
                    if handle_packet(&shared, &gate, packet).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Peek the fixed header without consuming anything, to reject an oversize
/// packet before buffering its whole body. Returns `None` while even the
/// header is incomplete.
fn peek_declared_len(buf: &[u8]) -> Option<usize> {
    let mut peek = ByteArray::new(buf);
    let header = FixedHeader::decode(&mut peek).ok()?;
    Some(header.bytes() + header.remaining_length())
}

fn send_disconnect(shared: &Shared, reason: ReasonCode) {
    let mut packet = DisconnectPacket::new();
    packet.set_reason_code(reason);
    let _ignored = shared.control_tx.enqueue(ControlCommand::Disconnect(packet));
}

fn trigger_if_connected(shared: &Arc<Shared>, gate: &Arc<DisconnectGate>, clean: bool) {
    if shared.session.state() != ConnectState::Disconnected {
        gate.trigger(Arc::clone(shared), clean);
    }
}

/// Handle one decoded packet. `Err(())` means the reader must stop (a
/// disconnect has already been triggered).
async fn handle_packet(
    shared: &Arc<Shared>,
    gate: &Arc<DisconnectGate>,
    packet: ControlPacket,
) -> Result<(), ()> {
    match packet {
        ControlPacket::Disconnect(packet) => {
            log::info!("reader: broker sent DISCONNECT, reason {:?}", packet.reason_code());
            let clean = packet.reason_code() == ReasonCode::Success;
            trigger_if_connected(shared, gate, clean);
            Err(())
        }
        ControlPacket::Publish(publish) => {
            if publish.qos() != QoS::AtMostOnce {
                let id = publish.packet_id();
                if publish.dup() {
                    shared.ipub.remove(id);
                }
                let admitted = tokio::select! {
                    () = shared.cancellation.cancelled() => return Err(()),
                    result = shared.ipub.add(id, TransactionChain::new(publish.clone())) => result,
                };
                if let Err(err) = admitted {
                    log::warn!("reader: duplicate non-DUP publish id {}: {err}", id.value());
                    send_disconnect(shared, ReasonCode::ProtocolError);
                    trigger_if_connected(shared, gate, false);
                    return Err(());
                }
            }
            enqueue(shared, gate, IncomingPacket::Publish(publish))
        }
        ControlPacket::ConnectAck(packet) => enqueue(shared, gate, IncomingPacket::ConnectAck(packet)),
        ControlPacket::PublishAck(packet) => enqueue(shared, gate, IncomingPacket::PublishAck(packet)),
        ControlPacket::PublishReceived(packet) => {
            enqueue(shared, gate, IncomingPacket::PublishReceived(packet))
        }
        ControlPacket::PublishRelease(packet) => {
            enqueue(shared, gate, IncomingPacket::PublishRelease(packet))
        }
        ControlPacket::PublishComplete(packet) => {
            enqueue(shared, gate, IncomingPacket::PublishComplete(packet))
        }
        ControlPacket::SubscribeAck(packet) => enqueue(shared, gate, IncomingPacket::SubscribeAck(packet)),
        ControlPacket::UnsubscribeAck(packet) => {
            enqueue(shared, gate, IncomingPacket::UnsubscribeAck(packet))
        }
        ControlPacket::PingResponse(packet) => enqueue(shared, gate, IncomingPacket::PingResponse(packet)),
        ControlPacket::Connect(_) | ControlPacket::Subscribe(_) | ControlPacket::Unsubscribe(_)
        | ControlPacket::PingRequest(_) => {
            log::warn!("reader: broker sent a client-only packet type");
            send_disconnect(shared, ReasonCode::ProtocolError);
            trigger_if_connected(shared, gate, false);
            Err(())
        }
    }
}

fn enqueue(shared: &Arc<Shared>, gate: &Arc<DisconnectGate>, packet: IncomingPacket) -> Result<(), ()> {
    if shared.incoming_tx.enqueue(packet).is_err() {
        log::warn!("reader: received-packets queue closed");
        trigger_if_connected(shared, gate, false);
        return Err(());
    }
    Ok(())
}
