//! Volbot Core
//!
//! This crate provides the chat side of the volume bot: the line codec,
//! connection state machine, connection pool, dispatch scheduler and the
//! command processor that turns chat commands into control API calls.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod transport;
pub mod utils;


pub use bridge::{Bridge, ReconnectBackoff};
pub use config::{
    AccountConfig, ChannelConfig, CommandConfig, Config, ConnectionConfig, ControlConfig,
    SchedulerConfig, ServerConfig, TransportKind,
};
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use error::{Error, Result};
pub use message::{LineCodec, Message, ParsedEvent, TagValue, Tags};
pub use pool::{ConnectionPool, ConnectionSelector, RandomSelector};
pub use processor::{CommandProcessor, CommandRejection, ControlApi, LevelCommand, ProcessOutcome};
pub use queue::{ActionQueue, DispatchQueues, JoinRequest, OutboundMessage};
pub use scheduler::{QueueIntervals, Scheduler, TickOutcome};
pub use transport::{Connector, MemoryConnector, MemoryPeer, NetworkConnector, Transport};
pub use utils::{badge_symbols, format_chat_line, normalize_channel};

/// Re-exports for convenience
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
pub use tracing::{debug, error, info, warn};
