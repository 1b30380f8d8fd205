// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use codec::utils::random_string;
use codec::QoS;

#[derive(Clone, Debug)]
pub struct HttpProxy {
    pub hostname: String,
    pub port: u16,
    pub login: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct Socks5Proxy {
    pub hostname: String,
    pub port: u16,
    pub login: String,
    pub password: String,
}

#[derive(Clone, Debug, Default)]
pub enum Proxy {
    #[default]
    None,
    Http(HttpProxy),
    Socks5(Socks5Proxy),
}

#[derive(Clone, Debug)]
pub struct SelfSignedTls {
    /// PEM-encoded root CA certificate used to validate the broker's
    /// certificate chain instead of the platform trust store.
    pub root_ca_pem: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub enum TlsType {
    /// Signed by a CA already present in `webpki-roots`.
    #[default]
    CASigned,

    /// Validate against a root CA supplied out of band.
    SelfSigned(SelfSignedTls),
}

/// Client certificate presented during the TLS handshake (mutual TLS).
#[derive(Clone, Debug)]
pub struct ClientCertificate {
    pub cert_chain_pem: PathBuf,
    pub private_key_pem: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub struct MqttConnect {}

#[derive(Clone, Debug, Default)]
pub struct MqttsConnect {
    pub domain: String,
    pub tls_type: TlsType,
}

#[derive(Clone, Debug, Default)]
pub struct WsConnect {
    pub path: String,
}

#[derive(Clone, Debug, Default)]
pub struct WssConnect {
    pub tls_type: TlsType,
    pub domain: String,
    pub path: String,
}

#[derive(Clone, Debug)]
pub enum ConnectType {
    Mqtt(MqttConnect),
    Mqtts(MqttsConnect),
    Ws(WsConnect),
    Wss(WssConnect),
}

impl Default for ConnectType {
    fn default() -> Self {
        Self::Mqtt(MqttConnect::default())
    }
}

/// Application message to be stored by the broker and published on this
/// client's behalf if the connection is lost without a clean DISCONNECT.
#[derive(Clone, Debug)]
pub struct LastWillAndTestament {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,

    /// Seconds the broker waits after detecting connection loss before
    /// publishing the will; 0 publishes immediately.
    pub delay_interval: u32,
    pub payload_is_utf8: bool,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
}

impl LastWillAndTestament {
    #[must_use]
    pub fn new(topic: &str, message: &[u8], qos: QoS) -> Self {
        Self {
            topic: topic.to_owned(),
            message: message.to_owned(),
            qos,
            retain: false,
            delay_interval: 0,
            payload_is_utf8: false,
            message_expiry_interval: None,
            content_type: None,
            response_topic: None,
            correlation_data: None,
            user_properties: Vec::new(),
        }
    }
}

/// Every knob this client accepts before `connect()` is called. Generalizes
/// `ruo/src/connect_options.rs::ConnectOptions`, which only carried the
/// transport/proxy/timeout fields relevant to MQTT 3.1.1: the fields below
/// add the MQTT5 CONNECT properties, authentication, and WebSocket-specific
/// extras the teacher's struct never needed.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// Every address the broker hostname resolved to. `address()` picks the
    /// one to dial from this list according to `prefer_ipv6`.
    addresses: Vec<SocketAddr>,
    connect_type: ConnectType,
    client_id: String,
    keep_alive: Duration,
    connect_timeout: Duration,
    proxy: Proxy,

    clean_start: bool,
    session_expiry_interval: u32,
    receive_maximum: u16,
    maximum_packet_size: Option<u32>,
    topic_alias_maximum: u16,
    request_response_information: bool,
    request_problem_information: bool,
    manual_ack_enabled: bool,

    username: Option<String>,
    password: Option<Vec<u8>>,
    user_properties: Vec<(String, String)>,
    last_will: Option<LastWillAndTestament>,

    client_certificate: Option<ClientCertificate>,
    allow_invalid_broker_certificates: bool,
    prefer_ipv6: bool,

    websocket_request_headers: Vec<(String, String)>,
    websocket_keep_alive_interval: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            addresses: vec![SocketAddr::from(([127, 0, 0, 1], 1883))],
            connect_type: ConnectType::default(),
            client_id: random_string(8),
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            proxy: Proxy::None,

            clean_start: true,
            session_expiry_interval: 0,
            receive_maximum: 65_535,
            maximum_packet_size: None,
            topic_alias_maximum: 0,
            request_response_information: false,
            request_problem_information: true,
            manual_ack_enabled: false,

            username: None,
            password: None,
            user_properties: Vec::new(),
            last_will: None,

            client_certificate: None,
            allow_invalid_broker_certificates: false,
            prefer_ipv6: false,

            websocket_request_headers: Vec::new(),
            websocket_keep_alive_interval: None,
        }
    }
}

impl ConnectOptions {
    /// # Errors
    /// Returns error if `address` cannot be resolved.
    pub fn new<A: ToSocketAddrs>(address: A) -> io::Result<ConnectOptions> {
        let addresses: Vec<SocketAddr> = address.to_socket_addrs()?.collect();
        if addresses.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"));
        }
        Ok(ConnectOptions {
            addresses,
            ..Self::default()
        })
    }

    /// # Errors
    /// Returns error if `address` cannot be resolved.
    pub fn set_address<A: ToSocketAddrs>(&mut self, address: A) -> io::Result<&mut Self> {
        let addresses: Vec<SocketAddr> = address.to_socket_addrs()?.collect();
        if addresses.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"));
        }
        self.addresses = addresses;
        Ok(self)
    }

    /// The address to dial. When the hostname resolved to more than one
    /// address, picks an address matching `prefer_ipv6` first and falls back
    /// to whatever was resolved otherwise.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.addresses
            .iter()
            .find(|addr| addr.is_ipv6() == self.prefer_ipv6)
            .or_else(|| self.addresses.first())
            .copied()
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 1883)))
    }

    pub fn set_connect_type(&mut self, connect_type: ConnectType) -> &mut Self {
        self.connect_type = connect_type;
        self
    }

    #[must_use]
    pub const fn connect_type(&self) -> &ConnectType {
        &self.connect_type
    }

    pub fn set_client_id(&mut self, client_id: &str) -> &mut Self {
        self.client_id = client_id.to_owned();
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_connect_timeout(&mut self, connect_timeout: Duration) -> &mut Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> &Duration {
        &self.connect_timeout
    }

    pub fn set_keep_alive(&mut self, keep_alive: Duration) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> &Duration {
        &self.keep_alive
    }

    pub fn set_proxy(&mut self, proxy: Proxy) -> &mut Self {
        self.proxy = proxy;
        self
    }

    #[must_use]
    pub const fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn set_clean_start(&mut self, clean_start: bool) -> &mut Self {
        self.clean_start = clean_start;
        self
    }

    #[must_use]
    pub const fn clean_start(&self) -> bool {
        self.clean_start
    }

    pub fn set_session_expiry_interval(&mut self, seconds: u32) -> &mut Self {
        self.session_expiry_interval = seconds;
        self
    }

    #[must_use]
    pub const fn session_expiry_interval(&self) -> u32 {
        self.session_expiry_interval
    }

    pub fn set_receive_maximum(&mut self, receive_maximum: u16) -> &mut Self {
        self.receive_maximum = receive_maximum;
        self
    }

    #[must_use]
    pub const fn receive_maximum(&self) -> u16 {
        self.receive_maximum
    }

    pub fn set_maximum_packet_size(&mut self, max: Option<u32>) -> &mut Self {
        self.maximum_packet_size = max;
        self
    }

    #[must_use]
    pub const fn maximum_packet_size(&self) -> Option<u32> {
        self.maximum_packet_size
    }

    pub fn set_topic_alias_maximum(&mut self, max: u16) -> &mut Self {
        self.topic_alias_maximum = max;
        self
    }

    #[must_use]
    pub const fn topic_alias_maximum(&self) -> u16 {
        self.topic_alias_maximum
    }

    pub fn set_request_response_information(&mut self, request: bool) -> &mut Self {
        self.request_response_information = request;
        self
    }

    #[must_use]
    pub const fn request_response_information(&self) -> bool {
        self.request_response_information
    }

    pub fn set_request_problem_information(&mut self, request: bool) -> &mut Self {
        self.request_problem_information = request;
        self
    }

    #[must_use]
    pub const fn request_problem_information(&self) -> bool {
        self.request_problem_information
    }

    /// When enabled, incoming `QoS` 1/2 publishes are surfaced to the
    /// application without an automatic ack; the caller must ack explicitly.
    pub fn set_manual_ack_enabled(&mut self, enabled: bool) -> &mut Self {
        self.manual_ack_enabled = enabled;
        self
    }

    #[must_use]
    pub const fn manual_ack_enabled(&self) -> bool {
        self.manual_ack_enabled
    }

    pub fn set_credentials(&mut self, username: &str, password: Option<&[u8]>) -> &mut Self {
        self.username = Some(username.to_owned());
        self.password = password.map(<[u8]>::to_vec);
        self
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_deref()
    }

    pub fn add_user_property(&mut self, key: &str, value: &str) -> &mut Self {
        self.user_properties.push((key.to_owned(), value.to_owned()));
        self
    }

    #[must_use]
    pub fn user_properties(&self) -> &[(String, String)] {
        &self.user_properties
    }

    pub fn set_last_will(&mut self, last_will: LastWillAndTestament) -> &mut Self {
        self.last_will = Some(last_will);
        self
    }

    #[must_use]
    pub const fn last_will(&self) -> Option<&LastWillAndTestament> {
        self.last_will.as_ref()
    }

    pub fn set_client_certificate(&mut self, certificate: ClientCertificate) -> &mut Self {
        self.client_certificate = Some(certificate);
        self
    }

    #[must_use]
    pub const fn client_certificate(&self) -> Option<&ClientCertificate> {
        self.client_certificate.as_ref()
    }

    pub fn set_allow_invalid_broker_certificates(&mut self, allow: bool) -> &mut Self {
        self.allow_invalid_broker_certificates = allow;
        self
    }

    #[must_use]
    pub const fn allow_invalid_broker_certificates(&self) -> bool {
        self.allow_invalid_broker_certificates
    }

    pub fn set_prefer_ipv6(&mut self, prefer_ipv6: bool) -> &mut Self {
        self.prefer_ipv6 = prefer_ipv6;
        self
    }

    #[must_use]
    pub const fn prefer_ipv6(&self) -> bool {
        self.prefer_ipv6
    }

    pub fn add_websocket_request_header(&mut self, key: &str, value: &str) -> &mut Self {
        self.websocket_request_headers.push((key.to_owned(), value.to_owned()));
        self
    }

    #[must_use]
    pub fn websocket_request_headers(&self) -> &[(String, String)] {
        &self.websocket_request_headers
    }

    pub fn set_websocket_keep_alive_interval(&mut self, interval: Option<Duration>) -> &mut Self {
        self.websocket_keep_alive_interval = interval;
        self
    }

    #[must_use]
    pub const fn websocket_keep_alive_interval(&self) -> Option<Duration> {
        self.websocket_keep_alive_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_mqtt5_sane() {
        let options = ConnectOptions::default();
        assert!(options.clean_start());
        assert_eq!(options.receive_maximum(), 65_535);
        assert_eq!(options.session_expiry_interval(), 0);
        assert!(options.request_problem_information());
        assert!(!options.manual_ack_enabled());
    }

    #[test]
    fn test_builder_chains() {
        let mut options = ConnectOptions::default();
        options
            .set_client_id("dev-1")
            .set_clean_start(false)
            .set_receive_maximum(10)
            .set_credentials("alice", Some(b"secret"))
            .add_user_property("region", "eu");
        assert_eq!(options.client_id(), "dev-1");
        assert!(!options.clean_start());
        assert_eq!(options.receive_maximum(), 10);
        assert_eq!(options.username(), Some("alice"));
        assert_eq!(options.user_properties(), &[("region".to_owned(), "eu".to_owned())]);
    }
}
