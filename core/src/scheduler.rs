//! Dispatch scheduler
//!
//! Four periodic tickers drain the dispatch queues, one item per tick each:
//!
//! | queue    | default interval | action                                   |
//! |----------|------------------|------------------------------------------|
//! | connect  | 500 ms           | start connecting the queued connection   |
//! | join     | 250 ms           | join a channel on a pooled connection    |
//! | outbound | 300 ms           | send a chat message on a pooled connection |
//! | inbound  | 2 ms             | hand a chat event to the command processor |

use crate::config::SchedulerConfig;
use crate::pool::ConnectionPool;
use crate::processor::CommandProcessor;
use crate::queue::DispatchQueues;
use crate::utils::normalize_channel;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Tick period of each queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueIntervals {
    pub connect: Duration,
    pub join: Duration,
    pub outbound: Duration,
    pub inbound: Duration,
}

impl From<&SchedulerConfig> for QueueIntervals {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            connect: Duration::from_millis(config.connect_interval_ms),
            join: Duration::from_millis(config.join_interval_ms),
            outbound: Duration::from_millis(config.outbound_interval_ms),
            inbound: Duration::from_millis(config.inbound_interval_ms),
        }
    }
}

impl Default for QueueIntervals {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

/// Result of a single tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Queue was empty
    Idle,
    /// One item was handed off
    Dispatched,
    /// One item was discarded because the chosen connection is not connected
    Dropped,
    /// Pool is empty; the item stays queued for a later tick
    Deferred,
}

/// Drains the dispatch queues at fixed rates
pub struct Scheduler {
    queues: Arc<DispatchQueues>,
    pool: Arc<ConnectionPool>,
    processor: Arc<CommandProcessor>,
    intervals: QueueIntervals,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a stopped scheduler
    pub fn new(
        queues: Arc<DispatchQueues>,
        pool: Arc<ConnectionPool>,
        processor: Arc<CommandProcessor>,
        intervals: QueueIntervals,
    ) -> Self {
        Self {
            queues,
            pool,
            processor,
            intervals,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the four tickers; does nothing if already running
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        info!(
            "Starting scheduler (connect {:?}, join {:?}, outbound {:?}, inbound {:?})",
            self.intervals.connect,
            self.intervals.join,
            self.intervals.outbound,
            self.intervals.inbound
        );

        tasks.push(self.spawn_ticker(self.intervals.connect, Scheduler::tick_connect));
        tasks.push(self.spawn_ticker(self.intervals.join, Scheduler::tick_join));
        tasks.push(self.spawn_ticker(self.intervals.outbound, Scheduler::tick_outbound));
        tasks.push(self.spawn_ticker(self.intervals.inbound, Scheduler::tick_inbound));
    }

    /// Stop every ticker; queued items are kept
    pub fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.abort();
        }
        info!("Scheduler stopped");
    }

    /// Check if the tickers are running
    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    fn spawn_ticker(
        self: &Arc<Self>,
        period: Duration,
        tick: fn(&Scheduler) -> TickOutcome,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            // First tick one full period after start
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tick(&scheduler);
            }
        })
    }

    /// Start connecting the oldest queued connection
    pub fn tick_connect(&self) -> TickOutcome {
        let Some(connection) = self.queues.connect.pop() else {
            return TickOutcome::Idle;
        };
        debug!("Connecting {}", connection.config().nick());
        connection.connect();
        TickOutcome::Dispatched
    }

    /// Join the oldest queued channel on a pooled connection
    pub fn tick_join(&self) -> TickOutcome {
        if self.queues.join.is_empty() {
            return TickOutcome::Idle;
        }
        let Some(connection) = self.pool.pick() else {
            return TickOutcome::Deferred;
        };
        let Some(request) = self.queues.join.pop() else {
            return TickOutcome::Idle;
        };

        if !connection.is_connected() {
            warn!(
                "Dropping join of {}: {} is not connected",
                request.channel,
                connection.config().nick()
            );
            return TickOutcome::Dropped;
        }

        let channel = normalize_channel(&request.channel);
        debug!("{} joining {}", connection.config().nick(), channel);
        connection.join(&channel);
        TickOutcome::Dispatched
    }

    /// Send the oldest queued chat message on a pooled connection
    pub fn tick_outbound(&self) -> TickOutcome {
        if self.queues.outbound.is_empty() {
            return TickOutcome::Idle;
        }
        let Some(connection) = self.pool.pick() else {
            return TickOutcome::Deferred;
        };
        let Some(message) = self.queues.outbound.pop() else {
            return TickOutcome::Idle;
        };

        if !connection.is_connected() {
            warn!(
                "Dropping message to {}: {} is not connected",
                message.channel,
                connection.config().nick()
            );
            return TickOutcome::Dropped;
        }

        let channel = normalize_channel(&message.channel);
        match message.reply_to {
            Some(ref parent) => connection.reply(&channel, &message.text, parent),
            None => connection.privmsg(&channel, &message.text),
        }
        TickOutcome::Dispatched
    }

    /// Hand the oldest inbound event to the command processor
    pub fn tick_inbound(&self) -> TickOutcome {
        let Some(event) = self.queues.inbound.pop() else {
            return TickOutcome::Idle;
        };
        self.processor.dispatch(event);
        TickOutcome::Dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandConfig, ConnectionConfig, TransportKind};
    use crate::connection::{Connection, ConnectionEvent};
    use crate::message::{Message, ParsedEvent};
    use crate::pool::ConnectionSelector;
    use crate::processor::ControlApi;
    use crate::queue::{JoinRequest, OutboundMessage};
    use crate::transport::{MemoryConnector, MemoryPeer};
    use crate::Result;
    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
    use tokio::sync::mpsc;

    struct NullControl;

    #[async_trait]
    impl ControlApi for NullControl {
        async fn set_level(&self, _resource: &str, _level: f64) -> Result<()> {
            Ok(())
        }
    }

    /// Always picks the same index
    struct FixedSelector(usize);

    impl ConnectionSelector for FixedSelector {
        fn select(&mut self, candidates: usize) -> Option<usize> {
            if candidates == 0 {
                None
            } else {
                Some(self.0.min(candidates - 1))
            }
        }
    }

    fn scheduler(
        intervals: QueueIntervals,
    ) -> (Arc<Scheduler>, Arc<DispatchQueues>, Arc<ConnectionPool>) {
        let queues = Arc::new(DispatchQueues::new(100));
        let pool = Arc::new(ConnectionPool::new(Box::new(FixedSelector(0))));
        let processor = Arc::new(CommandProcessor::new(
            &CommandConfig::default(),
            "Music",
            Arc::new(NullControl),
            queues.outbound.clone(),
        ));
        let scheduler =
            Arc::new(Scheduler::new(queues.clone(), pool.clone(), processor, intervals));
        (scheduler, queues, pool)
    }

    fn chat_event(text: &str) -> ParsedEvent {
        let raw = format!(":alice!alice@host PRIVMSG #room :{}", text);
        ParsedEvent::from_message(Message::parse(&raw).unwrap(), &raw)
    }

    /// Connect a pooled connection over an in-memory transport
    async fn connected(
        pool: &ConnectionPool,
    ) -> (Arc<Connection>, BufReader<DuplexStream>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (connector, mut accepted) = MemoryConnector::new();
        let config =
            ConnectionConfig::new("memory", 1, "volbot", Some(TransportKind::Raw)).unwrap();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let connection = Connection::new(Arc::new(config), Arc::new(connector), events_tx);
        pool.add(connection.clone());

        connection.connect();
        let MemoryPeer { stream, .. } = accepted.recv().await.unwrap();
        match events.recv().await.unwrap() {
            ConnectionEvent::Connected { .. } => {}
            other => panic!("unexpected event {:?}", other),
        }

        (connection, BufReader::new(stream), events)
    }

    async fn read_until(peer: &mut BufReader<DuplexStream>, command: &str) -> String {
        loop {
            let mut line = String::new();
            tokio::time::timeout(Duration::from_secs(5), peer.read_line(&mut line))
                .await
                .expect("timed out reading from client")
                .unwrap();
            if line.contains(command) {
                return line;
            }
        }
    }

    #[tokio::test]
    async fn test_join_normalizes_channel() {
        let (scheduler, queues, pool) = scheduler(QueueIntervals::default());
        let (_connection, mut peer, _events) = connected(&pool).await;

        queues.join.push(JoinRequest::new("room"));
        assert_eq!(scheduler.tick_join(), TickOutcome::Dispatched);
        assert_eq!(read_until(&mut peer, "JOIN").await, "JOIN #room\r\n");

        queues.join.push(JoinRequest::new("#other"));
        assert_eq!(scheduler.tick_join(), TickOutcome::Dispatched);
        assert_eq!(read_until(&mut peer, "JOIN").await, "JOIN #other\r\n");

        assert_eq!(scheduler.tick_join(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_outbound_reply_is_threaded() {
        let (scheduler, queues, pool) = scheduler(QueueIntervals::default());
        let (_connection, mut peer, _events) = connected(&pool).await;

        queues
            .outbound
            .push(OutboundMessage::new("room", "hello there").in_reply_to(Some("abc")));
        assert_eq!(scheduler.tick_outbound(), TickOutcome::Dispatched);
        assert_eq!(
            read_until(&mut peer, "PRIVMSG").await,
            "@reply-parent-msg-id=abc PRIVMSG #room :hello there\r\n"
        );

        queues.outbound.push(OutboundMessage::new("#room", "hi"));
        assert_eq!(scheduler.tick_outbound(), TickOutcome::Dispatched);
        assert_eq!(read_until(&mut peer, "PRIVMSG").await, "PRIVMSG #room hi\r\n");
    }

    #[tokio::test]
    async fn test_items_dropped_when_connection_not_connected() {
        let (scheduler, queues, pool) = scheduler(QueueIntervals::default());
        let (connector, _accepted) = MemoryConnector::new();
        let config =
            ConnectionConfig::new("memory", 1, "volbot", Some(TransportKind::Raw)).unwrap();
        let (events_tx, _events) = mpsc::unbounded_channel();
        pool.add(Connection::new(Arc::new(config), Arc::new(connector), events_tx));

        queues.join.push(JoinRequest::new("room"));
        queues.outbound.push(OutboundMessage::new("room", "hi"));
        assert_eq!(scheduler.tick_join(), TickOutcome::Dropped);
        assert_eq!(scheduler.tick_outbound(), TickOutcome::Dropped);
        assert!(queues.join.is_empty());
        assert!(queues.outbound.is_empty());
    }

    #[tokio::test]
    async fn test_items_deferred_on_empty_pool() {
        let (scheduler, queues, _pool) = scheduler(QueueIntervals::default());

        queues.join.push(JoinRequest::new("room"));
        assert_eq!(scheduler.tick_join(), TickOutcome::Deferred);
        assert_eq!(queues.join.len(), 1);
        assert_eq!(scheduler.tick_connect(), TickOutcome::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_item_per_tick() {
        let intervals = QueueIntervals {
            connect: Duration::from_millis(100),
            join: Duration::from_millis(100),
            outbound: Duration::from_millis(100),
            inbound: Duration::from_millis(100),
        };
        let (scheduler, queues, _pool) = scheduler(intervals);
        for i in 0..10 {
            queues.inbound.push(chat_event(&format!("message {}", i)));
        }

        scheduler.start();
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queues.inbound.len(), 10);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queues.inbound.len(), 9);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queues.inbound.len(), 8);

        scheduler.stop();
        assert!(!scheduler.is_running());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(queues.inbound.len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_join_per_interval() {
        let intervals = QueueIntervals {
            join: Duration::from_millis(100),
            ..QueueIntervals::default()
        };
        let (scheduler, queues, pool) = scheduler(intervals);
        let (connection, mut peer, _events) = connected(&pool).await;
        for i in 0..10 {
            queues.join.push(JoinRequest::new(&format!("room{}", i)));
        }

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queues.join.len(), 10);

        for remaining in (7..10).rev() {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(queues.join.len(), remaining);
        }
        scheduler.stop();

        // Closing the transport ends the stream after everything written so far
        connection.close();
        let mut joins = Vec::new();
        loop {
            let mut line = String::new();
            if peer.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            if line.starts_with("JOIN") {
                joins.push(line);
            }
        }
        assert_eq!(joins, vec!["JOIN #room0\r\n", "JOIN #room1\r\n", "JOIN #room2\r\n"]);
    }
}
