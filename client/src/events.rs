// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::v5::{PublishPacket, ReasonCode, SubscribeAckPacket, UnsubscribeAckPacket};
use codec::PacketId;

/// Events surfaced to the application. Delivered on an unbounded queue so
/// publishing them never blocks a runtime task; the application is expected
/// to drain them promptly.
#[derive(Debug, Clone)]
pub enum Event {
    /// The connection was torn down. `clean` is true when this followed an
    /// explicit application-requested disconnect rather than a transport or
    /// protocol failure.
    AfterDisconnect { clean: bool },

    /// An application message arrived. In automatic-ack mode this fires
    /// after the ack has been sent to the broker; in manual-ack mode it
    /// fires on receipt, before [`Event::ack`] is called.
    OnMessageReceived(PublishPacket),

    /// Reply to a `subscribe` call.
    OnSubscribeAckReceived(SubscribeAckPacket),

    /// Reply to an `unsubscribe` call.
    OnUnsubscribeAckReceived(UnsubscribeAckPacket),

    /// Keep-alive PINGRESP observed.
    OnPingResponseReceived,

    /// A QoS 1 or QoS 2 outgoing publish completed (final ack observed).
    OnPublishComplete { packet_id: PacketId, reason: ReasonCode },
}
