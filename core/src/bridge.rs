//! Chat bridge
//!
//! Owns the connection pool, the dispatch queues and the scheduler, and reacts
//! to connection events: joins the channel once a connection is up, feeds chat
//! messages to the command processor and replaces dropped connections.

use crate::config::{Config, ConnectionConfig};
use crate::connection::{Connection, ConnectionEvent};
use crate::message::ParsedEvent;
use crate::pool::{ConnectionPool, ConnectionSelector, RandomSelector};
use crate::processor::{CommandProcessor, ControlApi};
use crate::queue::{DispatchQueues, JoinRequest};
use crate::scheduler::{QueueIntervals, Scheduler};
use crate::transport::{Connector, NetworkConnector};
use crate::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Reconnect backoff for one account
#[derive(Debug, Clone, Default)]
pub struct ReconnectBackoff {
    /// Consecutive drops without a successful connect in between
    pub attempts: u32,
}

impl ReconnectBackoff {
    /// Delay before the next reconnect.
    /// The first reconnect is immediate, then `base * 2^(n-1)` capped at `max`.
    pub fn next_delay(&mut self, base: Duration, max: Duration) -> Duration {
        let attempts = self.attempts;
        self.attempts = self.attempts.saturating_add(1);
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u32.saturating_pow((attempts - 1).min(16));
        base.saturating_mul(factor).min(max)
    }

    /// Forget previous drops after a successful connect
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Chat bridge tying connections, queues and the command processor together
pub struct Bridge {
    config: Config,
    connector: Arc<dyn Connector>,
    pool: Arc<ConnectionPool>,
    queues: Arc<DispatchQueues>,
    scheduler: Arc<Scheduler>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    respawn_tx: mpsc::UnboundedSender<Arc<ConnectionConfig>>,
    respawn: mpsc::UnboundedReceiver<Arc<ConnectionConfig>>,
    backoff: HashMap<String, ReconnectBackoff>,
}

impl Bridge {
    /// Create a bridge that dials the configured chat server
    pub fn new(config: Config, control: Arc<dyn ControlApi>) -> Self {
        Self::with_parts(
            config,
            control,
            Arc::new(NetworkConnector),
            Box::new(RandomSelector::new()),
        )
    }

    /// Create a bridge with a custom connector and connection selector
    pub fn with_parts(
        config: Config,
        control: Arc<dyn ControlApi>,
        connector: Arc<dyn Connector>,
        selector: Box<dyn ConnectionSelector>,
    ) -> Self {
        let queues = Arc::new(DispatchQueues::new(config.scheduler.queue_capacity));
        let pool = Arc::new(ConnectionPool::new(selector));
        let processor = Arc::new(CommandProcessor::new(
            &config.command,
            &config.control.source_name,
            control,
            queues.outbound.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            queues.clone(),
            pool.clone(),
            processor,
            QueueIntervals::from(&config.scheduler),
        ));

        let (events_tx, events) = mpsc::unbounded_channel();
        let (respawn_tx, respawn) = mpsc::unbounded_channel();

        Self {
            config,
            connector,
            pool,
            queues,
            scheduler,
            events_tx,
            events,
            respawn_tx,
            respawn,
            backoff: HashMap::new(),
        }
    }

    /// Connection pool
    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    /// Dispatch queues
    pub fn queues(&self) -> Arc<DispatchQueues> {
        self.queues.clone()
    }

    /// Queue one connection per account and start the scheduler
    pub fn start(&mut self) -> Result<()> {
        for config in self.config.connection_configs()? {
            self.spawn_connection(Arc::new(config));
        }
        self.scheduler.start();
        Ok(())
    }

    /// Run until `shutdown` resolves
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start()?;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(config) = self.respawn.recv() => self.spawn_connection(config),
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Stop the scheduler, close every connection and discard pending work
    pub fn shutdown(&mut self) {
        info!("Shutting down chat bridge");
        self.scheduler.stop();
        for connection in self.pool.connections() {
            self.pool.remove(connection.id());
            connection.close();
        }
        self.queues.clear();
    }

    fn spawn_connection(&mut self, config: Arc<ConnectionConfig>) {
        debug!("Queueing connection for {}", config.nick());
        let connection =
            Connection::new(config.clone(), self.connector.clone(), self.events_tx.clone());
        self.pool.add(connection.clone());
        if !self.queues.connect.push(connection.clone()) {
            self.pool.remove(connection.id());
            self.schedule_respawn(config);
        }
    }

    /// Replace the connection for `config` once its backoff delay has passed
    fn schedule_respawn(&mut self, config: Arc<ConnectionConfig>) {
        let delay = self
            .backoff
            .entry(config.nick().to_string())
            .or_default()
            .next_delay(
                Duration::from_millis(self.config.scheduler.reconnect_base_delay_ms),
                Duration::from_millis(self.config.scheduler.reconnect_max_delay_ms),
            );

        let respawn = self.respawn_tx.clone();
        if delay.is_zero() {
            let _ = respawn.send(config);
            return;
        }

        debug!("Reconnecting {} in {:?}", config.nick(), delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = respawn.send(config);
        });
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        trace!("Event from connection {}", event.connection_id());
        match event {
            ConnectionEvent::Connected { id } => self.on_connected(id),
            ConnectionEvent::Disconnected { id, reason } => self.on_disconnected(id, &reason),
            ConnectionEvent::Message { event, .. } => self.on_message(event),
        }
    }

    fn on_connected(&mut self, id: uuid::Uuid) {
        let Some(connection) = self.pool.get(id) else {
            return;
        };
        let config = connection.config();
        info!(
            "{} connected with {} on port {} over {}",
            config.host(),
            config.nick(),
            config.port(),
            config.transport()
        );

        if let Some(backoff) = self.backoff.get_mut(config.nick()) {
            backoff.reset();
        }
        self.queues.join.push(JoinRequest::new(&self.config.channel.name));
    }

    fn on_disconnected(&mut self, id: uuid::Uuid, reason: &str) {
        let Some(connection) = self.pool.remove(id) else {
            trace!("Ignoring disconnect of untracked connection {}", id);
            return;
        };
        let config = connection.config().clone();
        warn!(
            "{} disconnected on port {} over {} ({})",
            config.host(),
            config.port(),
            config.transport(),
            reason
        );
        self.schedule_respawn(config);
    }

    fn on_message(&mut self, event: ParsedEvent) {
        if event.command == "privmsg" {
            self.queues.inbound.push(event);
        } else {
            trace!("Unhandled {} event", event.command);
        }
    }
}
