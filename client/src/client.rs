// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::Arc;

use codec::v5::{
    ConnectPacket, DisconnectPacket, Property, Properties, SubscribePacket, UnsubscribePacket,
};
use codec::{BoolData, QoS, StringPairData, U16Data, U32Data};
use tokio::sync::mpsc;

use crate::cancellation::CancellationToken;
use crate::commands::ControlCommand;
use crate::connect_options::ConnectOptions;
use crate::connect_state::ConnectState;
use crate::disconnect::{DisconnectGate, TaskHandles};
use crate::error::{Error, ErrorKind};
use crate::events::Event;
use crate::packet_id_allocator::PacketIdAllocator;
use crate::publish::{PublishMessage, PublishOutcome, PublishRequest};
use crate::queue::awaitable_queue;
use crate::session::Session;
use crate::transaction::BoundedTransactionMap;
use crate::transport::Transport;
use crate::{handler, monitor, reader, writer_control, writer_publish};

/// Broker `ReceiveMaximum` assumed until the actual CONNACK arrives (MQTT5
/// default: unlimited, capped here the same way `ConnectOptions` caps our
/// own advertised value).
const DEFAULT_BROKER_RECEIVE_MAXIMUM: usize = 65_535;

/// Public entry point: one connection cycle of an MQTT5 client (spec.md
/// §1-§2). Generalizes the teacher's single-struct, blocking `Client`
/// (`ruo/src/client.rs`) into a handle over five cooperating tasks.
pub struct AsyncClient {
    shared: Arc<crate::shared::Shared>,
    gate: Arc<DisconnectGate>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl AsyncClient {
    /// Open the transport, perform the CONNECT/CONNACK handshake, and start
    /// the runtime's five tasks.
    ///
    /// # Errors
    /// Returns an error if the transport cannot be established or the
    /// broker does not accept the connection within `connect_timeout`.
    pub async fn connect(options: ConnectOptions) -> Result<Self, Error> {
        let transport = Transport::connect(&options).await?;
        Self::connect_with_transport(options, transport).await
    }

    /// Same handshake as [`Self::connect`], but over an already-established
    /// transport. Lets tests drive the runtime over a [`Transport::Duplex`]
    /// pair without exercising the TCP/TLS/WebSocket dial path.
    ///
    /// # Errors
    /// Returns an error if the broker does not accept the connection within
    /// `connect_timeout`.
    pub async fn connect_with_transport(options: ConnectOptions, transport: Transport) -> Result<Self, Error> {
        let (transport_reader, transport_writer) = transport.split();

        let (control_tx, control_rx) = awaitable_queue();
        let (publish_tx, publish_rx) = awaitable_queue();
        let (incoming_tx, incoming_rx) = awaitable_queue();
        let (sent_tx, sent_rx) = awaitable_queue();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let own_receive_maximum = usize::from(options.receive_maximum());
        let shared = Arc::new(crate::shared::Shared::new(
            options.clone(),
            Session::default(),
            control_tx,
            publish_tx,
            incoming_tx,
            sent_tx,
            transport_writer,
            BoundedTransactionMap::new(own_receive_maximum),
            BoundedTransactionMap::new(DEFAULT_BROKER_RECEIVE_MAXIMUM),
            PacketIdAllocator::default(),
            events_tx,
            CancellationToken::new(),
        ));
        let gate = Arc::new(DisconnectGate::new());

        shared.session.set_state(ConnectState::Connecting);

        let writer_control_handle = tokio::spawn(writer_control::run(
            Arc::clone(&shared),
            Arc::clone(&gate),
            control_rx,
        ));
        let writer_publish_handle = tokio::spawn(writer_publish::run(
            Arc::clone(&shared),
            Arc::clone(&gate),
            publish_rx,
        ));
        let reader_handle = tokio::spawn(reader::run(Arc::clone(&shared), Arc::clone(&gate), transport_reader));
        let handler_handle = tokio::spawn(handler::run(
            Arc::clone(&shared),
            Arc::clone(&gate),
            incoming_rx,
            sent_rx,
        ));
        gate.install_handles(TaskHandles {
            writer_control: writer_control_handle,
            writer_publish: writer_publish_handle,
            reader: reader_handle,
            handler: handler_handle,
        })
        .await;
        tokio::spawn(monitor::run(Arc::clone(&shared), Arc::clone(&gate)));

        let connect_packet = build_connect_packet(&options)?;
        shared
            .control_tx
            .enqueue(ControlCommand::Connect(connect_packet))
            .map_err(|_err| Error::new(ErrorKind::SendError, "control queue closed before CONNECT was sent"))?;

        let outcome = tokio::time::timeout(*options.connect_timeout(), async {
            tokio::select! {
                () = shared.session.connected_signal.notified() => true,
                () = shared.session.disconnected_signal.notified() => false,
            }
        })
        .await
        .map_err(|_elapsed| Error::new(ErrorKind::IoError, "timed out waiting for CONNACK"))?;

        if !outcome {
            return Err(Error::new(ErrorKind::ProtocolError, "broker rejected the CONNECT request"));
        }

        Ok(Self { shared, gate, events_rx })
    }

    /// Enqueue a QoS 0/1/2 publish. Returns as soon as the request has been
    /// handed to Writer(publish); does not wait for broker acknowledgement.
    ///
    /// # Errors
    /// Returns an error if the publish queue has been closed (the
    /// connection is already tearing down).
    pub fn publish(&self, message: PublishMessage) -> Result<(), Error> {
        self.shared
            .publish_tx
            .enqueue(PublishRequest::new(message))
            .map_err(|_err| Error::new(ErrorKind::SendError, "publish queue closed"))
    }

    /// Same as [`Self::publish`], but resolves once the publish has
    /// completed: immediately for QoS 0, or once the broker's final ack is
    /// observed for QoS 1/2.
    ///
    /// # Errors
    /// Returns an error if the publish queue is closed, or if the
    /// connection is torn down before completion is observed.
    pub async fn publish_and_confirm(&self, message: PublishMessage) -> Result<PublishOutcome, Error> {
        let (request, completion) = PublishRequest::with_completion(message);
        self.shared
            .publish_tx
            .enqueue(request)
            .map_err(|_err| Error::new(ErrorKind::SendError, "publish queue closed"))?;
        completion
            .await
            .map_err(|_err| Error::new(ErrorKind::IoError, "connection closed before publish completed"))
    }

    /// Subscribe to a single topic filter.
    ///
    /// # Errors
    /// Returns an error if packet identifiers are exhausted, the filter is
    /// malformed, or the control queue is closed.
    pub fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), Error> {
        let id = self.shared.pid_alloc.acquire()?;
        let packet = SubscribePacket::new(filter, qos, id).map_err(|err| {
            self.shared.pid_alloc.release(id);
            Error::from_string(ErrorKind::EncodeError, format!("{err:?}"))
        })?;
        self.shared.session.add_subscription(filter);
        self.shared
            .control_tx
            .enqueue(ControlCommand::Subscribe(packet))
            .map_err(|_err| Error::new(ErrorKind::SendError, "control queue closed"))
    }

    /// Unsubscribe from a single topic filter.
    ///
    /// # Errors
    /// Returns an error if packet identifiers are exhausted, the filter is
    /// malformed, or the control queue is closed.
    pub fn unsubscribe(&self, filter: &str) -> Result<(), Error> {
        let id = self.shared.pid_alloc.acquire()?;
        let packet = UnsubscribePacket::new(filter, id).map_err(|err| {
            self.shared.pid_alloc.release(id);
            Error::from_string(ErrorKind::EncodeError, format!("{err:?}"))
        })?;
        self.shared.session.remove_subscription(filter);
        self.shared
            .control_tx
            .enqueue(ControlCommand::Unsubscribe(packet))
            .map_err(|_err| Error::new(ErrorKind::SendError, "control queue closed"))
    }

    /// Acknowledge a message received while `manual_ack_enabled` is set.
    /// A no-op field for QoS 0 messages, which are never tracked.
    ///
    /// # Errors
    /// Returns an error if the control queue is closed.
    pub fn ack(&self, packet_id: codec::PacketId, qos: QoS) -> Result<(), Error> {
        match qos {
            QoS::AtMostOnce => Ok(()),
            QoS::AtLeastOnce => {
                let mut ack = codec::v5::PublishAckPacket::new(packet_id);
                ack.set_reason_code(codec::v5::ReasonCode::Success);
                self.shared
                    .control_tx
                    .enqueue(ControlCommand::PublishAck(ack))
                    .map_err(|_err| Error::new(ErrorKind::SendError, "control queue closed"))
            }
            QoS::ExactOnce => {
                let mut received = codec::v5::PublishReceivedPacket::new(packet_id);
                received.set_reason_code(codec::v5::ReasonCode::Success);
                self.shared
                    .control_tx
                    .enqueue(ControlCommand::PublishReceived(received))
                    .map_err(|_err| Error::new(ErrorKind::SendError, "control queue closed"))
            }
        }
    }

    /// Receive the next application-facing event, suspending until one is
    /// available or the connection has fully torn down and no more events
    /// will ever arrive.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }

    /// Request a clean disconnect: sends `DISCONNECT`, tears down every
    /// runtime task, and closes the transport. Resolves once the sequence
    /// has fully completed.
    pub async fn disconnect(&self) {
        let mut packet = DisconnectPacket::new();
        packet.set_reason_code(codec::v5::ReasonCode::Success);
        let _ignored = self.shared.control_tx.enqueue(ControlCommand::Disconnect(packet));
        self.gate.disconnect_and_wait(&self.shared, true).await;
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.session.state() == ConnectState::Connected
    }
}

fn build_connect_packet(options: &ConnectOptions) -> Result<ConnectPacket, Error> {
    let mut packet = ConnectPacket::new(options.client_id())
        .map_err(|err| Error::from_string(ErrorKind::EncodeError, format!("{err:?}")))?;
    packet.set_clean_session(options.clean_start());
    let keep_alive_secs = u16::try_from(options.keep_alive().as_secs()).unwrap_or(u16::MAX);
    packet.set_keep_alive(keep_alive_secs);

    if let Some(username) = options.username() {
        packet
            .set_username(Some(username))
            .map_err(|err| Error::from_string(ErrorKind::DecodeError, format!("{err:?}")))?;
    }
    if let Some(password) = options.password() {
        packet
            .set_password(Some(password))
            .map_err(|err| Error::from_string(ErrorKind::EncodeError, format!("{err:?}")))?;
    }

    {
        let props = packet.properties_mut();
        push_connect_property(
            props,
            Property::SessionExpiryInterval(U32Data::new(options.session_expiry_interval())),
        )?;
        push_connect_property(props, Property::ReceiveMaximum(U16Data::new(options.receive_maximum())))?;
        if let Some(max) = options.maximum_packet_size() {
            push_connect_property(props, Property::MaximumPacketSize(U32Data::new(max)))?;
        }
        push_connect_property(
            props,
            Property::TopicAliasMaximum(U16Data::new(options.topic_alias_maximum())),
        )?;
        push_connect_property(
            props,
            Property::RequestResponseInformation(BoolData::new(options.request_response_information())),
        )?;
        push_connect_property(
            props,
            Property::RequestProblemInformation(BoolData::new(options.request_problem_information())),
        )?;
        for (key, value) in options.user_properties() {
            let pair = StringPairData::new(key, value)
                .map_err(|err| Error::from_string(ErrorKind::EncodeError, format!("{err:?}")))?;
            push_connect_property(props, Property::UserProperty(pair))?;
        }
    }

    if let Some(will) = options.last_will() {
        packet.set_will(true);
        packet.set_will_qos(will.qos);
        packet.set_will_retain(will.retain);
        packet
            .set_will_topic(&will.topic)
            .map_err(|err| Error::from_string(ErrorKind::EncodeError, format!("{err:?}")))?;
        packet
            .set_will_message(&will.message)
            .map_err(|err| Error::from_string(ErrorKind::EncodeError, format!("{err:?}")))?;

        let will_props = packet.will_properties_mut();
        push_connect_property(will_props, Property::WillDelayInterval(U32Data::new(will.delay_interval)))?;
        if will.payload_is_utf8 {
            push_connect_property(will_props, Property::PayloadFormatIndicator(BoolData::new(true)))?;
        }
        if let Some(expiry) = will.message_expiry_interval {
            push_connect_property(will_props, Property::MessageExpiryInterval(U32Data::new(expiry)))?;
        }
        if let Some(content_type) = &will.content_type {
            let value = codec::StringData::from(content_type)
                .map_err(|err| Error::from_string(ErrorKind::EncodeError, format!("{err:?}")))?;
            push_connect_property(will_props, Property::ContentType(value))?;
        }
        if let Some(response_topic) = &will.response_topic {
            let topic = codec::PubTopic::new(response_topic)
                .map_err(|err| Error::from_string(ErrorKind::EncodeError, format!("{err:?}")))?;
            push_connect_property(will_props, Property::ResponseTopic(topic))?;
        }
        if let Some(correlation) = &will.correlation_data {
            let data = codec::BinaryData::from_slice(correlation)
                .map_err(|err| Error::from_string(ErrorKind::EncodeError, format!("{err:?}")))?;
            push_connect_property(will_props, Property::CorrelationData(data))?;
        }
        for (key, value) in &will.user_properties {
            let pair = StringPairData::new(key, value)
                .map_err(|err| Error::from_string(ErrorKind::EncodeError, format!("{err:?}")))?;
            push_connect_property(will_props, Property::UserProperty(pair))?;
        }
    }

    Ok(packet)
}

fn push_connect_property(props: &mut Properties, prop: Property) -> Result<(), Error> {
    props
        .push(prop)
        .map_err(|err| Error::from_string(ErrorKind::EncodeError, format!("{err:?}")))
}
