// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::byte_array::ByteArray;
use crate::error::DecodeError;
use crate::v5::{
    ConnectAckPacket, ConnectPacket, DisconnectPacket, FixedHeader, PacketType, PingRequestPacket,
    PingResponsePacket, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, SubscribeAckPacket, SubscribePacket,
    UnsubscribeAckPacket, UnsubscribePacket,
};
use crate::DecodePacket;

/// Any one of the ten control packet types this codec understands, already
/// fully decoded.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, PartialEq)]
pub enum ControlPacket {
    Connect(ConnectPacket),
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    Subscribe(SubscribePacket),
    SubscribeAck(SubscribeAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingRequest(PingRequestPacket),
    PingResponse(PingResponsePacket),
    Disconnect(DisconnectPacket),
}

/// Result of attempting to decode one packet from the front of a byte buffer.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A complete packet was decoded, consuming `usize` bytes from the front
    /// of the buffer.
    Packet(ControlPacket, usize),

    /// The buffer holds fewer bytes than the packet it starts describing;
    /// zero bytes were consumed. The caller must supply more bytes and retry.
    Partial,

    /// The bytes already read describe an invalid packet. This is always
    /// fatal: the caller must tear down the connection.
    Malformed(DecodeError),
}

/// Decode one control packet from the front of `buf`.
///
/// This is the only entry point that may see a buffer shorter than the
/// packet it encodes: it first peeks the fixed header (falling back to
/// [`DecodeOutcome::Partial`] if even that is truncated), confirms the whole
/// packet is present, and only then hands a slice containing exactly that
/// packet to the per-type decoder — so a short buffer can never be
/// misread as a malformed one, and a decoder can never read past its own
/// packet into the next one already buffered behind it.
#[must_use]
pub fn decode(buf: &[u8]) -> DecodeOutcome {
    if buf.len() < 2 {
        return DecodeOutcome::Partial;
    }

    let mut peek = ByteArray::new(buf);
    let header = match FixedHeader::decode(&mut peek) {
        Ok(header) => header,
        Err(DecodeError::ByteArray(_)) => return DecodeOutcome::Partial,
        Err(err) => return DecodeOutcome::Malformed(err),
    };

    let total_len = header.bytes() + header.remaining_length();
    if buf.len() < total_len {
        return DecodeOutcome::Partial;
    }

    let packet_buf = &buf[..total_len];
    let result = match header.packet_type() {
        PacketType::Connect => {
            ConnectPacket::decode(&mut ByteArray::new(packet_buf)).map(ControlPacket::Connect)
        }
        PacketType::ConnectAck => ConnectAckPacket::decode(&mut ByteArray::new(packet_buf))
            .map(ControlPacket::ConnectAck),
        PacketType::Publish { .. } => {
            PublishPacket::decode(&mut ByteArray::new(packet_buf)).map(ControlPacket::Publish)
        }
        PacketType::PublishAck => PublishAckPacket::decode(&mut ByteArray::new(packet_buf))
            .map(ControlPacket::PublishAck),
        PacketType::PublishReceived => {
            PublishReceivedPacket::decode(&mut ByteArray::new(packet_buf))
                .map(ControlPacket::PublishReceived)
        }
        PacketType::PublishRelease => {
            PublishReleasePacket::decode(&mut ByteArray::new(packet_buf))
                .map(ControlPacket::PublishRelease)
        }
        PacketType::PublishComplete => {
            PublishCompletePacket::decode(&mut ByteArray::new(packet_buf))
                .map(ControlPacket::PublishComplete)
        }
        PacketType::Subscribe => {
            SubscribePacket::decode(&mut ByteArray::new(packet_buf)).map(ControlPacket::Subscribe)
        }
        PacketType::SubscribeAck => SubscribeAckPacket::decode(&mut ByteArray::new(packet_buf))
            .map(ControlPacket::SubscribeAck),
        PacketType::Unsubscribe => UnsubscribePacket::decode(&mut ByteArray::new(packet_buf))
            .map(ControlPacket::Unsubscribe),
        PacketType::UnsubscribeAck => {
            UnsubscribeAckPacket::decode(&mut ByteArray::new(packet_buf))
                .map(ControlPacket::UnsubscribeAck)
        }
        PacketType::PingRequest => PingRequestPacket::decode(&mut ByteArray::new(packet_buf))
            .map(ControlPacket::PingRequest),
        PacketType::PingResponse => PingResponsePacket::decode(&mut ByteArray::new(packet_buf))
            .map(ControlPacket::PingResponse),
        PacketType::Disconnect => DisconnectPacket::decode(&mut ByteArray::new(packet_buf))
            .map(ControlPacket::Disconnect),
        PacketType::Auth => Err(DecodeError::InvalidPacketType),
    };

    match result {
        Ok(packet) => DecodeOutcome::Packet(packet, total_len),
        Err(err) => DecodeOutcome::Malformed(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EncodePacket, PacketId, QoS};

    #[test]
    fn test_decode_partial_header() {
        assert!(matches!(decode(&[0x20]), DecodeOutcome::Partial));
    }

    #[test]
    fn test_decode_partial_body() {
        let mut publish = PublishPacket::new("a/b", QoS::AtMostOnce, &[1, 2, 3]).unwrap();
        publish.set_retain(true);
        let mut buf = Vec::new();
        publish.encode(&mut buf).unwrap();
        assert!(matches!(decode(&buf[..buf.len() - 1]), DecodeOutcome::Partial));
    }

    #[test]
    fn test_decode_full_publish_roundtrip() {
        let mut publish = PublishPacket::new("a/b", QoS::AtLeastOnce, &[0x01, 0x02]).unwrap();
        publish.set_packet_id(PacketId::new(7));
        let mut buf = Vec::new();
        let written = publish.encode(&mut buf).unwrap();
        match decode(&buf) {
            DecodeOutcome::Packet(ControlPacket::Publish(decoded), consumed) => {
                assert_eq!(consumed, written);
                assert_eq!(decoded, publish);
            }
            other => panic!("expected decoded Publish, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_malformed_reserved_flags() {
        // PUBREL with reserved flag bits cleared instead of `0b0010`.
        let buf = [0x60, 0x02, 0x00, 0x01];
        assert!(matches!(decode(&buf), DecodeOutcome::Malformed(_)));
    }

    #[test]
    fn test_decode_disconnect_zero_length_is_normal() {
        let buf = [0xe0, 0x00];
        match decode(&buf) {
            DecodeOutcome::Packet(ControlPacket::Disconnect(packet), consumed) => {
                assert_eq!(consumed, 2);
                assert_eq!(packet.reason_code(), crate::v5::ReasonCode::Success);
            }
            other => panic!("expected decoded Disconnect, got {other:?}"),
        }
    }
}
