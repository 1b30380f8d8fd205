// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use codec::v5::{Properties, Property, PublishPacket, ReasonCode};
use codec::{PacketId, QoS};
use tokio::sync::oneshot;

use crate::error::{Error, ErrorKind};

/// An outgoing application message requested by the application.
///
/// Generalizes the codec's wire-level [`PublishPacket`] with the optional
/// MQTT5 fields spec.md §3 names, keeping the wire representation
/// (`codec::v5::Properties`/`Property`) as the source of truth for user
/// properties rather than a bespoke multimap.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone)]
pub struct PublishMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
    pub retain: bool,
    pub dup: bool,
    pub topic_alias: Option<u16>,
    pub message_expiry_interval: Option<u32>,
    pub correlation_data: Option<Vec<u8>>,
    pub response_topic: Option<String>,
    pub content_type: Option<String>,
    pub payload_is_utf8: bool,
    pub user_properties: Vec<(String, String)>,
}

impl PublishMessage {
    #[must_use]
    pub fn new(topic: &str, qos: QoS, payload: &[u8]) -> Self {
        Self {
            topic: topic.to_owned(),
            qos,
            payload: payload.to_owned(),
            retain: false,
            dup: false,
            topic_alias: None,
            message_expiry_interval: None,
            correlation_data: None,
            response_topic: None,
            content_type: None,
            payload_is_utf8: false,
            user_properties: Vec::new(),
        }
    }

    /// Build the wire-level `PublishPacket` this message turns into once
    /// admitted onto the send path. `packet_id` is ignored for QoS 0.
    ///
    /// # Errors
    /// Returns an error if any field cannot be represented on the wire
    /// (oversized topic/strings/binary data).
    pub fn into_packet(self, packet_id: PacketId) -> Result<PublishPacket, Error> {
        let mut packet = PublishPacket::new(&self.topic, self.qos, &self.payload)
            .map_err(encode_err)?;
        packet.set_retain(self.retain);
        if self.qos != QoS::AtMostOnce {
            packet.set_dup(self.dup).map_err(encode_err)?;
            packet.set_packet_id(packet_id);
        }

        let props = packet.properties_mut();
        if self.payload_is_utf8 {
            push_property(
                props,
                Property::PayloadFormatIndicator(codec::BoolData::new(true)),
            )?;
        }
        if let Some(alias) = self.topic_alias {
            push_property(props, Property::TopicAlias(codec::U16Data::new(alias)))?;
        }
        if let Some(expiry) = self.message_expiry_interval {
            push_property(
                props,
                Property::MessageExpiryInterval(codec::U32Data::new(expiry)),
            )?;
        }
        if let Some(correlation) = &self.correlation_data {
            let data = codec::BinaryData::from_slice(correlation).map_err(encode_err)?;
            push_property(props, Property::CorrelationData(data))?;
        }
        if let Some(topic) = &self.response_topic {
            let topic = codec::PubTopic::new(topic).map_err(encode_err)?;
            push_property(props, Property::ResponseTopic(topic))?;
        }
        if let Some(content_type) = &self.content_type {
            let value = codec::StringData::from(content_type)
                .map_err(|err| Error::from_string(ErrorKind::EncodeError, format!("{err:?}")))?;
            push_property(props, Property::ContentType(value))?;
        }
        for (key, value) in &self.user_properties {
            let pair = codec::StringPairData::new(key, value).map_err(encode_err)?;
            push_property(props, Property::UserProperty(pair))?;
        }
        Ok(packet)
    }
}

/// Outcome delivered through a [`PublishRequest`]'s completion sink.
#[derive(Debug, Clone, Copy)]
pub enum PublishOutcome {
    /// QoS 0: the packet was handed to the transport. There is no broker ack.
    Written,
    /// QoS 1/2: the broker's final ack was sent back and the transaction
    /// chain is closed.
    Acknowledged(ReasonCode),
}

/// An outgoing publish plus an optional completion sink, carried together on
/// the publish queue so Writer(publish)/the handler can report completion
/// without the packet itself holding a back-reference to the runtime
/// (spec.md §9: "event-style completion hooks on packets -> channels or task
/// handles").
#[derive(Debug)]
pub struct PublishRequest {
    pub message: PublishMessage,
    pub completion: Option<oneshot::Sender<PublishOutcome>>,
}

impl PublishRequest {
    #[must_use]
    pub const fn new(message: PublishMessage) -> Self {
        Self {
            message,
            completion: None,
        }
    }

    #[must_use]
    pub fn with_completion(message: PublishMessage) -> (Self, oneshot::Receiver<PublishOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                completion: Some(tx),
            },
            rx,
        )
    }
}

fn encode_err(err: codec::EncodeError) -> Error {
    Error::from_string(ErrorKind::EncodeError, format!("{err:?}"))
}

fn push_property(props: &mut Properties, prop: Property) -> Result<(), Error> {
    props.push(prop).map_err(encode_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos0_publish_has_no_packet_id() {
        let message = PublishMessage::new("a/b", QoS::AtMostOnce, &[1, 2, 3]);
        let packet = message.into_packet(PacketId::new(0)).unwrap();
        assert_eq!(packet.packet_id().value(), 0);
    }

    #[test]
    fn test_qos1_publish_carries_packet_id() {
        let message = PublishMessage::new("a/b", QoS::AtLeastOnce, &[1]);
        let packet = message.into_packet(PacketId::new(9)).unwrap();
        assert_eq!(packet.packet_id().value(), 9);
    }

    #[test]
    fn test_user_properties_roundtrip_into_packet() {
        let mut message = PublishMessage::new("a/b", QoS::AtMostOnce, &[]);
        message.user_properties.push(("region".to_owned(), "eu".to_owned()));
        let packet = message.into_packet(PacketId::new(0)).unwrap();
        assert_eq!(packet.properties().len(), 1);
    }
}
