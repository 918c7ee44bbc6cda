//! Chat server connection and its lifecycle
//!
//! A [`Connection`] moves through Idle → Connecting → Connected → Disconnected.
//! Once disconnected it is not reused: the owner creates a fresh connection
//! for the same identity, which starts with an empty receive buffer and a new
//! keepalive timer. Everything observable about a connection is reported as a
//! [`ConnectionEvent`] on the channel supplied at construction.

use crate::config::ConnectionConfig;
use crate::message::{LineCodec, Message, ParsedEvent};
use crate::transport::{Connector, TransportReader, TransportWriter};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, trace};
use uuid::Uuid;

/// Longest partial line kept while waiting for its delimiter (tags plus body)
pub const MAX_LINE_BUFFER: usize = 8192 + 512;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, never connected
    Idle,
    /// Transport being established
    Connecting,
    /// Transport up, handshake sent
    Connected,
    /// Transport gone; terminal for this connection
    Disconnected,
}

/// Events emitted by a connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Transport established and handshake sent
    Connected { id: Uuid },
    /// Transport lost, emitted once per connection attempt
    Disconnected { id: Uuid, reason: String },
    /// Parsed inbound line, keepalive PINGs excluded
    Message { id: Uuid, event: ParsedEvent },
}

impl ConnectionEvent {
    /// Connection the event came from
    pub fn connection_id(&self) -> Uuid {
        match self {
            ConnectionEvent::Connected { id }
            | ConnectionEvent::Disconnected { id, .. }
            | ConnectionEvent::Message { id, .. } => *id,
        }
    }
}

/// Running transport task and its outbound channel
struct Session {
    outgoing: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

struct Inner {
    state: ConnectionState,
    /// Incremented on every connect so stale session tasks can be ignored
    attempt: u64,
    session: Option<Session>,
    connected_at: Option<DateTime<Utc>>,
}

/// A single chat connection bound to one account identity
pub struct Connection {
    id: Uuid,
    config: Arc<ConnectionConfig>,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    inner: Mutex<Inner>,
}

impl Connection {
    /// Create an idle connection
    pub fn new(
        config: Arc<ConnectionConfig>,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            config,
            connector,
            events,
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                attempt: 0,
                session: None,
                connected_at: None,
            }),
        })
    }

    /// Unique ID of this connection
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Settings this connection was created with
    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Check if the connection is ready to send
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Time the current transport came up
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().connected_at
    }

    /// Start connecting.
    ///
    /// Calling this while a transport exists tears the transport down and
    /// starts over rather than failing.
    pub fn connect(self: &Arc<Self>) {
        let mut inner = self.inner.lock();

        if let Some(session) = inner.session.take() {
            debug!("Connection {} restarting its transport", self.id);
            session.task.abort();
        }

        inner.attempt += 1;
        inner.state = ConnectionState::Connecting;
        inner.connected_at = None;

        let attempt = inner.attempt;
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Arc::clone(self).run_session(attempt, outgoing_rx));
        inner.session = Some(Session { outgoing, task });
    }

    /// Queue a message on the transport; dropped unless connected
    pub fn send(&self, message: Message) {
        let inner = self.inner.lock();
        if inner.state != ConnectionState::Connected {
            trace!("Connection {} not connected, dropping {}", self.id, message.command);
            return;
        }
        if let Some(ref session) = inner.session {
            let _ = session.outgoing.send(message);
        }
    }

    /// Join a channel
    pub fn join(&self, channel: &str) {
        self.send(Message::new("JOIN", vec![channel.to_string()]));
    }

    /// Leave a channel
    pub fn part(&self, channel: &str) {
        self.send(Message::new("PART", vec![channel.to_string()]));
    }

    /// Send a chat message
    pub fn privmsg(&self, channel: &str, text: &str) {
        self.send(Message::new("PRIVMSG", vec![channel.to_string(), text.to_string()]));
    }

    /// Send a chat message threaded under another message
    pub fn reply(&self, channel: &str, text: &str, parent_id: &str) {
        let message = Message::new("PRIVMSG", vec![channel.to_string(), text.to_string()])
            .with_tag("reply-parent-msg-id", parent_id);
        self.send(message);
    }

    /// Close the transport
    pub fn close(&self) {
        self.handle_transport_error("closed locally");
    }

    /// Tear down after a transport failure; ignored unless connecting or connected
    pub fn handle_transport_error(&self, reason: &str) {
        let attempt = self.inner.lock().attempt;
        self.close_attempt(attempt, reason);
    }

    async fn run_session(
        self: Arc<Self>,
        attempt: u64,
        mut outgoing: mpsc::UnboundedReceiver<Message>,
    ) {
        let transport = match self.connector.open(&self.config).await {
            Ok(transport) => transport,
            Err(e) => {
                self.close_attempt(attempt, &format!("connect failed: {}", e));
                return;
            }
        };

        let (mut reader, mut writer) = transport.split();
        if !self.on_open(attempt) {
            return;
        }

        let reason = self.pump(&mut reader, &mut writer, &mut outgoing).await;
        self.close_attempt(attempt, &reason);
    }

    /// Move data both ways until the transport fails; returns the reason
    async fn pump(
        &self,
        reader: &mut TransportReader,
        writer: &mut TransportWriter,
        outgoing: &mut mpsc::UnboundedReceiver<Message>,
    ) -> String {
        let mut codec = LineCodec;
        let mut buffer = BytesMut::with_capacity(4096);

        let period = self.config.keepalive_interval();
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let read_timeout = self.config.read_timeout();
        let mut deadline = Instant::now() + read_timeout;

        loop {
            tokio::select! {
                read = reader.read_chunk(&mut buffer) => match read {
                    Ok(true) => {
                        deadline = Instant::now() + read_timeout;
                        for line in codec.drain_lines(&mut buffer) {
                            self.handle_line(&line);
                        }
                        if buffer.len() > MAX_LINE_BUFFER {
                            return format!("line exceeds {} bytes", MAX_LINE_BUFFER);
                        }
                    }
                    Ok(false) => return "connection closed by peer".to_string(),
                    Err(e) => return format!("read error: {}", e),
                },
                Some(message) = outgoing.recv() => {
                    trace!("{} -> {}", self.config.nick(), message.command);
                    if let Err(e) = writer.write_line(&LineCodec::frame(&message)).await {
                        return format!("write error: {}", e);
                    }
                }
                _ = keepalive.tick() => self.send(Message::new("PING", Vec::new())),
                _ = sleep_until(deadline) => {
                    return format!("no data received for {}s", read_timeout.as_secs());
                }
            }
        }
    }

    fn handle_line(&self, line: &str) {
        let Some(message) = Message::parse(line) else {
            if !line.is_empty() {
                debug!("Dropping malformed line on {}: {:?}", self.config.nick(), line);
            }
            return;
        };

        if message.is_command("PING") {
            self.send(Message::new("PONG", message.params));
            return;
        }

        let event = ParsedEvent::from_message(message, line);
        let _ = self.events.send(ConnectionEvent::Message { id: self.id, event });
    }

    /// Enter Connected and send the handshake; false if the attempt is stale
    fn on_open(&self, attempt: u64) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.attempt != attempt || inner.state != ConnectionState::Connecting {
                return false;
            }
            inner.state = ConnectionState::Connected;
            inner.connected_at = Some(Utc::now());
        }

        if let Some(pass) = self.config.pass() {
            self.send(Message::new("PASS", vec![pass.to_string()]));
        }
        self.send(Message::new("NICK", vec![self.config.nick().to_string()]));
        if !self.config.capabilities().is_empty() {
            self.send(Message::new(
                "CAP",
                vec!["REQ".to_string(), self.config.capabilities().join(" ")],
            ));
        }

        let _ = self.events.send(ConnectionEvent::Connected { id: self.id });
        true
    }

    fn close_attempt(&self, attempt: u64, reason: &str) {
        let session = {
            let mut inner = self.inner.lock();
            if inner.attempt != attempt {
                return;
            }
            match inner.state {
                ConnectionState::Connecting | ConnectionState::Connected => {}
                ConnectionState::Idle | ConnectionState::Disconnected => return,
            }
            inner.state = ConnectionState::Disconnected;
            inner.connected_at = None;
            inner.session.take()
        };

        debug!("Connection {} ({}) down: {}", self.id, self.config.nick(), reason);
        let _ = self.events.send(ConnectionEvent::Disconnected {
            id: self.id,
            reason: reason.to_string(),
        });

        // Dropping the session also drops the transport and any unparsed bytes
        if let Some(session) = session {
            session.task.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("nick", &self.config.nick())
            .field("state", &self.state())
            .finish()
    }
}
