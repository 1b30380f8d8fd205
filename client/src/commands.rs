// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::v5::{
    ConnectAckPacket, ConnectPacket, DisconnectPacket, PingRequestPacket, PingResponsePacket,
    PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, ReasonCode, SubscribeAckPacket, SubscribePacket, UnsubscribeAckPacket,
    UnsubscribePacket,
};
use codec::PacketId;

/// Items carried on the control send queue (everything except publishes).
/// Only the control writer is permitted to send `Connect`/`Disconnect`.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    Connect(ConnectPacket),
    Disconnect(DisconnectPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    Subscribe(SubscribePacket),
    Unsubscribe(UnsubscribePacket),
    PingRequest(PingRequestPacket),
}

/// Items carried on the received-packets queue, between the Reader and the
/// handler task.
#[derive(Debug, Clone)]
pub enum IncomingPacket {
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    SubscribeAck(SubscribeAckPacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingResponse(PingResponsePacket),
}

/// Post-send hook fired by Writer(control) immediately after a packet is
/// actually written to the transport, so the handler can finalize the QoS
/// state machine exactly when the spec requires ("removed when sent, not
/// when enqueued").
#[derive(Debug, Clone, Copy)]
pub enum SentNotice {
    PublishAckSent(PacketId),
    PublishCompleteSent(PacketId, ReasonCode),
}
