// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::{ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::{self, Certificate, OwnedTrustAnchor, PrivateKey};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

use crate::connect_options::{ClientCertificate, ConnectOptions, ConnectType, HttpProxy, Proxy, TlsType};
use crate::error::{Error, ErrorKind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The wire-level connection to a broker, generalized from
/// `ruo/src/stream.rs::Stream`'s enum-of-variants shape, but rebuilt on top
/// of the crates this workspace actually depends on (`tokio-rustls` instead
/// of the teacher's unmaintained `native-tls`/`tokio-tls`, `tokio-tungstenite`
/// for the two WebSocket variants instead of one).
///
/// Split into an independent [`TransportReader`]/[`TransportWriter`] pair at
/// connect time (spec.md §5: the Reader has a single consumer by convention
/// while writes are serialized by a mutex shared between the two writer
/// tasks) so the Reader task can block on `read_buf` without starving the
/// writer tasks.
pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    WebSocket(Box<WsStream>),
    /// In-memory transport for tests, backed by `tokio::io::duplex`. Kept
    /// ungated (not `#[cfg(test)]`) so integration tests under `tests/`,
    /// which link the crate without that cfg, can construct one directly.
    Duplex(tokio::io::DuplexStream),
}

pub enum TransportReader {
    Tcp(OwnedReadHalf),
    Tls(io::ReadHalf<TlsStream<TcpStream>>),
    WebSocket(SplitStream<WsStream>),
    Duplex(io::ReadHalf<tokio::io::DuplexStream>),
}

pub enum TransportWriter {
    Tcp(OwnedWriteHalf),
    Tls(io::WriteHalf<TlsStream<TcpStream>>),
    WebSocket(SplitSink<WsStream, Message>),
    Duplex(io::WriteHalf<tokio::io::DuplexStream>),
}

impl Transport {
    /// # Errors
    /// Returns error if the TCP connect, proxy tunnel, TLS handshake, or
    /// WebSocket handshake fails.
    pub async fn connect(options: &ConnectOptions) -> Result<Self, Error> {
        match options.connect_type().clone() {
            ConnectType::Mqtt(_) => {
                let socket = connect_tcp(options).await?;
                Ok(Self::Tcp(socket))
            }
            ConnectType::Mqtts(mqtts) => {
                let socket = connect_tcp(options).await?;
                let connector = build_tls_connector(&mqtts.tls_type, options)?;
                let server_name = rustls_server_name(&mqtts.domain)?;
                let stream = connector.connect(server_name, socket).await?;
                Ok(Self::Tls(Box::new(stream)))
            }
            ConnectType::Ws(ws) => {
                let url = format!("ws://{}{}", options.address(), ws.path);
                let request = build_ws_request(&url, options)?;
                let socket = connect_tcp(options).await?;
                let (stream, _response) =
                    tokio_tungstenite::client_async(request, MaybeTlsStream::Plain(socket))
                        .await
                        .map_err(Error::from)?;
                Ok(Self::WebSocket(Box::new(stream)))
            }
            ConnectType::Wss(wss) => {
                let url = format!("wss://{}{}", options.address(), wss.path);
                let request = build_ws_request(&url, options)?;
                let socket = connect_tcp(options).await?;
                let connector = build_tls_connector(&wss.tls_type, options)?;
                let (stream, _response) = tokio_tungstenite::client_async_tls_with_config(
                    request,
                    socket,
                    None,
                    Some(Connector::Rustls(connector.into())),
                )
                .await
                .map_err(Error::from)?;
                Ok(Self::WebSocket(Box::new(stream)))
            }
        }
    }

    /// Split into independently owned read/write halves.
    #[must_use]
    pub fn split(self) -> (TransportReader, TransportWriter) {
        match self {
            Self::Tcp(socket) => {
                let (read, write) = socket.into_split();
                (TransportReader::Tcp(read), TransportWriter::Tcp(write))
            }
            Self::Tls(stream) => {
                let (read, write) = io::split(*stream);
                (TransportReader::Tls(read), TransportWriter::Tls(write))
            }
            Self::WebSocket(stream) => {
                let (write, read) = stream.split();
                (TransportReader::WebSocket(read), TransportWriter::WebSocket(write))
            }
            Self::Duplex(stream) => {
                let (read, write) = io::split(stream);
                (TransportReader::Duplex(read), TransportWriter::Duplex(write))
            }
        }
    }
}

impl TransportReader {
    /// Read whatever bytes are currently available into `buf`, returning the
    /// number of bytes appended. Returns `Ok(0)` on a clean peer shutdown.
    ///
    /// # Errors
    /// Returns error if the underlying transport read fails.
    pub async fn read_buf(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        match self {
            Self::Tcp(socket) => Ok(socket.read_buf(buf).await?),
            Self::Tls(stream) => Ok(stream.read_buf(buf).await?),
            Self::Duplex(stream) => Ok(stream.read_buf(buf).await?),
            Self::WebSocket(ws) => match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let len = data.len();
                    buf.extend_from_slice(&data);
                    Ok(len)
                }
                Some(Ok(Message::Close(_))) | None => Ok(0),
                Some(Ok(_other)) => Ok(0),
                Some(Err(err)) => Err(Error::from(err)),
            },
        }
    }
}

impl TransportWriter {
    /// # Errors
    /// Returns error if the underlying transport write fails.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self {
            Self::Tcp(socket) => Ok(socket.write_all(buf).await?),
            Self::Tls(stream) => Ok(stream.write_all(buf).await?),
            Self::Duplex(stream) => Ok(stream.write_all(buf).await?),
            Self::WebSocket(ws) => ws.send(Message::binary(buf.to_vec())).await.map_err(Error::from),
        }
    }

    /// Close the transport for writing. Used by the disconnection sequence
    /// after the DISCONNECT packet has been flushed.
    ///
    /// # Errors
    /// Returns error if the underlying transport shutdown fails.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        match self {
            Self::Tcp(socket) => Ok(socket.shutdown().await?),
            Self::Tls(stream) => Ok(stream.shutdown().await?),
            Self::Duplex(stream) => Ok(stream.shutdown().await?),
            Self::WebSocket(ws) => ws.close().await.map_err(Error::from),
        }
    }
}

async fn connect_tcp(options: &ConnectOptions) -> Result<TcpStream, Error> {
    match options.proxy() {
        Proxy::Http(proxy) => connect_via_http_proxy(proxy, options).await,
        Proxy::Socks5(_) => Err(Error::new(
            ErrorKind::SocketError,
            "SOCKS5 proxy tunneling is not implemented",
        )),
        Proxy::None => Ok(TcpStream::connect(options.address()).await?),
    }
}

/// Tunnel a plain TCP connection through an HTTP proxy via `CONNECT`,
/// per spec.md §4.B and §6.
async fn connect_via_http_proxy(proxy: &HttpProxy, options: &ConnectOptions) -> Result<TcpStream, Error> {
    let mut socket = TcpStream::connect((proxy.hostname.as_str(), proxy.port)).await?;
    let target = options.address();
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if !proxy.login.is_empty() {
        let credentials = format!("{}:{}", proxy.login, proxy.password);
        let encoded = base64_encode(credentials.as_bytes());
        request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");
    socket.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    let mut buf = [0_u8; 256];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::SocketError,
                "HTTP proxy closed the connection before responding",
            ));
        }
        response.extend_from_slice(&buf[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let status_line = String::from_utf8_lossy(&response);
    if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
        return Err(Error::new(
            ErrorKind::SocketError,
            &format!("HTTP proxy CONNECT rejected: {}", status_line.lines().next().unwrap_or("")),
        ));
    }
    Ok(socket)
}

/// Minimal base64 encoder for the `Proxy-Authorization` header; the
/// workspace carries no general-purpose base64 dependency and the proxy
/// tunnel is the only caller.
fn base64_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8; 64] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((data.len() + 2) / 3 * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0];
        let b1 = chunk.get(1).copied();
        let b2 = chunk.get(2).copied();
        out.push(ALPHABET[(b0 >> 2) as usize] as char);
        out.push(ALPHABET[(((b0 & 0x03) << 4) | (b1.unwrap_or(0) >> 4)) as usize] as char);
        if let Some(b1) = b1 {
            out.push(ALPHABET[(((b1 & 0x0f) << 2) | (b2.unwrap_or(0) >> 6)) as usize] as char);
        } else {
            out.push('=');
        }
        if let Some(b2) = b2 {
            out.push(ALPHABET[(b2 & 0x3f) as usize] as char);
        } else {
            out.push('=');
        }
    }
    out
}

/// Build the WebSocket handshake request with the `mqtt` subprotocol
/// (spec.md §4.B, §6) and any caller-supplied headers layered on top.
fn build_ws_request(url: &str, options: &ConnectOptions) -> Result<http::Request<()>, Error> {
    let mut builder = http::Request::builder()
        .uri(url)
        .header("Sec-WebSocket-Protocol", "mqtt");
    for (key, value) in options.websocket_request_headers() {
        builder = builder.header(key.as_str(), value.as_str());
    }
    builder.body(()).map_err(Error::from)
}

/// No-op server cert verifier backing `AllowInvalidBrokerCertificates`.
/// Accepts any certificate chain and server name without checking either.
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn rustls_server_name(domain: &str) -> Result<rustls::ServerName, Error> {
    rustls::ServerName::try_from(domain)
        .map_err(|_err| Error::new(ErrorKind::CertError, "invalid TLS server name"))
}

fn build_tls_connector(tls_type: &TlsType, options: &ConnectOptions) -> Result<TlsConnector, Error> {
    let config_builder = rustls::ClientConfig::builder().with_safe_defaults();

    let config = if options.allow_invalid_broker_certificates() {
        let builder = config_builder.with_custom_certificate_verifier(Arc::new(NoCertificateVerification));
        if let Some(client_cert) = options.client_certificate() {
            let (chain, key) = load_client_certificate(client_cert)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|err| Error::new(ErrorKind::CertError, &err.to_string()))?
        } else {
            builder.with_no_client_auth()
        }
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                anchor.subject,
                anchor.spki,
                anchor.name_constraints,
            )
        }));

        if let TlsType::SelfSigned(self_signed) = tls_type {
            let mut reader = BufReader::new(File::open(&self_signed.root_ca_pem)?);
            for cert in rustls_pemfile::certs(&mut reader)
                .map_err(|err| Error::new(ErrorKind::CertError, &err.to_string()))?
            {
                root_store
                    .add(&Certificate(cert))
                    .map_err(|err| Error::new(ErrorKind::CertError, &err.to_string()))?;
            }
        }

        let builder = config_builder.with_root_certificates(root_store);
        if let Some(client_cert) = options.client_certificate() {
            let (chain, key) = load_client_certificate(client_cert)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|err| Error::new(ErrorKind::CertError, &err.to_string()))?
        } else {
            builder.with_no_client_auth()
        }
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

fn load_client_certificate(
    client_cert: &ClientCertificate,
) -> Result<(Vec<Certificate>, PrivateKey), Error> {
    let mut cert_reader = BufReader::new(File::open(&client_cert.cert_chain_pem)?);
    let chain = rustls_pemfile::certs(&mut cert_reader)
        .map_err(|err| Error::new(ErrorKind::CertError, &err.to_string()))?
        .into_iter()
        .map(Certificate)
        .collect();

    let mut key_reader = BufReader::new(File::open(&client_cert.private_key_pem)?);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .map_err(|err| Error::new(ErrorKind::CertError, &err.to_string()))?;
    let key = keys
        .pop()
        .map(PrivateKey)
        .ok_or_else(|| Error::new(ErrorKind::CertError, "no private key found"))?;

    Ok((chain, key))
}
