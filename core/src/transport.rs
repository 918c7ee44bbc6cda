//! Transports carrying chat lines: raw streams (plain or TLS) and WebSockets

use crate::config::{ConnectionConfig, TransportKind};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

/// WebSocket subprotocol for chat lines
pub const WS_SUBPROTOCOL: &str = "irc";

/// Byte stream a transport can run over
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed byte stream (TCP, TLS or in-memory)
pub type BoxedStream = Box<dyn IoStream>;

/// WebSocket over a boxed byte stream
pub type WsStream = WebSocketStream<BoxedStream>;

/// An established transport
pub enum Transport {
    /// Line-delimited bytes on a stream
    Raw(BoxedStream),
    /// One or more lines per WebSocket frame
    WebSocket(WsStream),
}

impl Transport {
    /// Split into independently usable read and write halves
    pub fn split(self) -> (TransportReader, TransportWriter) {
        match self {
            Transport::Raw(stream) => {
                let (read, write) = tokio::io::split(stream);
                (TransportReader::Raw(read), TransportWriter::Raw(write))
            }
            Transport::WebSocket(ws) => {
                let (sink, stream) = ws.split();
                (TransportReader::WebSocket(stream), TransportWriter::WebSocket(sink))
            }
        }
    }
}

/// Read half of a transport
pub enum TransportReader {
    Raw(ReadHalf<BoxedStream>),
    WebSocket(SplitStream<WsStream>),
}

impl TransportReader {
    /// Append the next chunk of inbound data to `buffer`.
    ///
    /// Returns `false` once the peer has closed the transport. Cancel safe.
    pub async fn read_chunk(&mut self, buffer: &mut BytesMut) -> Result<bool> {
        match self {
            TransportReader::Raw(read) => Ok(read.read_buf(buffer).await? > 0),
            TransportReader::WebSocket(stream) => loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        buffer.extend_from_slice(text.as_bytes());
                        return Ok(true);
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        buffer.extend_from_slice(&data);
                        return Ok(true);
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(false),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                }
            },
        }
    }
}

/// Write half of a transport
pub enum TransportWriter {
    Raw(WriteHalf<BoxedStream>),
    WebSocket(SplitSink<WsStream, WsMessage>),
}

impl TransportWriter {
    /// Write one framed line
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        match self {
            TransportWriter::Raw(write) => {
                write.write_all(line.as_bytes()).await?;
                write.flush().await?;
            }
            TransportWriter::WebSocket(sink) => {
                sink.send(WsMessage::Text(line.to_string())).await?;
            }
        }
        Ok(())
    }
}

/// Opens transports for connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a transport for the given connection settings
    async fn open(&self, config: &ConnectionConfig) -> Result<Transport>;
}

/// Connector that dials the configured server over the network
#[derive(Debug, Default)]
pub struct NetworkConnector;

#[async_trait]
impl Connector for NetworkConnector {
    async fn open(&self, config: &ConnectionConfig) -> Result<Transport> {
        let tcp = connect_tcp(config).await?;

        let stream: BoxedStream = if config.secure() {
            tracing::debug!("Starting TLS handshake with {}", config.host());
            Box::new(connect_tls(config, tcp).await?)
        } else {
            Box::new(tcp)
        };

        match config.transport() {
            TransportKind::Raw => Ok(Transport::Raw(stream)),
            TransportKind::WebSocket => {
                let scheme = if config.secure() { "wss" } else { "ws" };
                let url = format!("{}://{}:{}", scheme, config.host(), config.port());
                let mut request = url.into_client_request()?;
                request
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(WS_SUBPROTOCOL));

                let (ws, _response) = tokio_tungstenite::client_async(request, stream).await?;
                Ok(Transport::WebSocket(ws))
            }
        }
    }
}

/// Resolve the server and connect, binding to the local address if configured
async fn connect_tcp(config: &ConnectionConfig) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = lookup_host((config.host(), config.port())).await?.collect();
    let mut last_error = None;

    for addr in addrs {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Some(local) = config.local_address() {
            if local.is_ipv4() != addr.is_ipv4() {
                continue;
            }
            socket.bind(SocketAddr::new(local, 0))?;
        }

        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    let (host, port) = (config.host(), config.port());
    Err(match last_error {
        Some(e) => Error::Connection(format!("Failed to connect to {}:{}: {}", host, port, e)),
        None => Error::Connection(format!("No usable address for {}:{}", host, port)),
    })
}

async fn connect_tls(
    config: &ConnectionConfig,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tls_config = if config.tls_insecure() {
        insecure_tls_config()
    } else {
        default_tls_config()
    };

    let server_name = rustls::ServerName::try_from(config.host())
        .map_err(|e| {
            Error::Connection(format!("Invalid TLS server name {}: {}", config.host(), e))
        })?;

    let connector = TlsConnector::from(Arc::new(tls_config));
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::Connection(format!("TLS handshake failed: {}", e)))
}

fn default_tls_config() -> rustls::ClientConfig {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn insecure_tls_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        .with_no_client_auth()
}

/// Accepts any server certificate
struct NoCertificateVerification;

impl rustls::client::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Server side of an in-memory transport
#[derive(Debug)]
pub struct MemoryPeer {
    /// Nick of the connection that opened the transport
    pub nick: String,
    /// Stream connected to the client side
    pub stream: DuplexStream,
}

/// In-process connector for running connections without a network.
///
/// Every successful `open` creates an in-memory pipe and hands its server side
/// to the receiver returned by [`MemoryConnector::new`].
#[derive(Debug)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refusing: AtomicBool,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let connector = Self {
            peers,
            refusing: AtomicBool::new(false),
        };
        (connector, accepted)
    }

    /// Make subsequent connection attempts fail
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, config: &ConnectionConfig) -> Result<Transport> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(Error::Connection("connection refused".to_string()));
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        let peer = MemoryPeer {
            nick: config.nick().to_string(),
            stream: server,
        };
        self.peers
            .send(peer)
            .map_err(|_| Error::Connection("no listener for in-memory transport".to_string()))?;

        Ok(Transport::Raw(Box::new(client)))
    }
}
