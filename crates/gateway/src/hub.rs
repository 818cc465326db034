//! Hub: routes client operations to topic actors.
//!
//! The hub owns the topic registry and is the only task that mutates it.
//! It reads from two sources: client operations on a bounded mailbox and
//! topic/worker events on an unbounded channel. Existence checks run on
//! spawned tasks and report back as events, so a slow store never stalls
//! routing. Sends into a topic mailbox wait at most `command_timeout`; a
//! topic that stays full that long is evicted as stuck.

use crate::client::{ClientEvent, ClientHandle};
use crate::config::{HubConfig, TopicConfig};
use crate::error::{GatewayError, Result};
use crate::protocol::{topic_missing_frame, topic_unavailable_frame, OpKind, TopicId};
use crate::topic::{Registration, TopicActor, TopicCommand};
use log_store::SharedLogStore;
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One client request, as forwarded by a client actor.
#[derive(Debug)]
pub struct Operation {
    pub kind: OpKind,
    pub topics: Vec<TopicId>,
    pub client: ClientHandle,
}

/// Messages accepted on the hub mailbox.
#[derive(Debug)]
pub enum HubMessage {
    Operation(Operation),
    Stats(oneshot::Sender<HubStats>),
}

/// Snapshot of the hub registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Running topics, sorted.
    pub topics: Vec<TopicId>,
    /// Topics with an existence check in flight.
    pub pending_checks: usize,
}

/// Events reported to the hub by topics and check workers.
#[derive(Debug)]
pub enum HubEvent {
    /// The topic has no subscribers left and is draining.
    Idle { topic_id: TopicId, generation: u64 },
    /// The topic gave up after repeated panics.
    Crashed { topic_id: TopicId, generation: u64 },
    /// A registration reached a topic that can no longer accept it.
    Reroute {
        topic_id: TopicId,
        registration: Registration,
    },
    /// Result of an existence check.
    Checked { topic_id: TopicId, exists: bool },
}

/// Cloneable address of the hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubMessage>,
}

impl HubHandle {
    /// Queue an operation, waiting for mailbox space.
    pub async fn submit(&self, op: Operation) -> Result<()> {
        self.tx
            .send(HubMessage::Operation(op))
            .await
            .map_err(|_| GatewayError::HubUnavailable)
    }

    /// Ask the hub for a registry snapshot.
    pub async fn stats(&self) -> Result<HubStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(HubMessage::Stats(reply_tx))
            .await
            .map_err(|_| GatewayError::HubUnavailable)?;
        reply_rx.await.map_err(|_| GatewayError::HubUnavailable)
    }

    /// A handle whose mailbox is read by the caller instead of a hub.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<HubMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

struct TopicEntry {
    generation: u64,
    commands: mpsc::Sender<TopicCommand>,
    cancel: CancellationToken,
}

/// A command that did not reach its topic.
enum Undelivered {
    /// No running topic, or its task has ended.
    Gone(TopicCommand),
    /// The topic mailbox stayed full; the topic was evicted.
    Stuck(TopicCommand),
}

/// Hub actor state. Consumed by [`Hub::run`].
pub struct Hub {
    store: SharedLogStore,
    config: Arc<TopicConfig>,
    command_timeout: Duration,
    topics: HashMap<TopicId, TopicEntry>,
    /// Registrations waiting on an existence check, keyed by topic.
    pending: HashMap<TopicId, Vec<Registration>>,
    inbox: mpsc::Receiver<HubMessage>,
    events_tx: mpsc::UnboundedSender<HubEvent>,
    events: mpsc::UnboundedReceiver<HubEvent>,
    next_generation: u64,
    shutdown: CancellationToken,
}

impl Hub {
    /// Build the hub and its handle. Cancelling `shutdown` stops the hub and
    /// every topic it started.
    pub fn new(store: SharedLogStore, config: HubConfig, shutdown: CancellationToken) -> (Self, HubHandle) {
        let (tx, inbox) = mpsc::channel(config.mailbox);
        let (events_tx, events) = mpsc::unbounded_channel();
        let hub = Self {
            store,
            config: Arc::new(config.topic),
            command_timeout: config.command_timeout,
            topics: HashMap::new(),
            pending: HashMap::new(),
            inbox,
            events_tx,
            events,
            next_generation: 1,
            shutdown,
        };
        (hub, HubHandle { tx })
    }

    /// Run until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Hub running");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Hub received shutdown signal");
                    break;
                }

                Some(event) = self.events.recv() => self.handle_event(event).await,

                msg = self.inbox.recv() => match msg {
                    Some(HubMessage::Operation(op)) => self.handle_operation(op).await,
                    Some(HubMessage::Stats(reply)) => {
                        let _ = reply.send(self.stats());
                    }
                    None => {
                        info!("All hub handles dropped");
                        break;
                    }
                },
            }
        }

        for (topic_id, entry) in self.topics.drain() {
            debug!("Stopping topic {}", topic_id);
            let _ = entry.commands.try_send(TopicCommand::Stop);
            gauge!("gateway_active_topics").decrement(1.0);
        }
        info!("Hub stopped");
    }

    fn stats(&self) -> HubStats {
        let mut topics: Vec<TopicId> = self.topics.keys().cloned().collect();
        topics.sort();
        HubStats {
            topics,
            pending_checks: self.pending.len(),
        }
    }

    async fn handle_operation(&mut self, op: Operation) {
        match op.kind {
            OpKind::Subscribe => self.subscribe(op.client, op.topics).await,
            OpKind::Unsubscribe => self.unsubscribe(op.client, op.topics).await,
            OpKind::Other(name) => debug!("Ignoring op {} from client {}", name, op.client.id()),
        }
    }

    async fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Idle { topic_id, generation } => {
                self.remove_topic(&topic_id, generation, "idle");
            }
            HubEvent::Crashed { topic_id, generation } => {
                self.remove_topic(&topic_id, generation, "crashed");
            }
            HubEvent::Reroute { topic_id, registration } => {
                self.route_register(topic_id, registration).await;
            }
            HubEvent::Checked { topic_id, exists } => {
                self.resolve_check(topic_id, exists).await;
            }
        }
    }

    async fn subscribe(&mut self, client: ClientHandle, topics: Vec<TopicId>) {
        counter!("gateway_subscriptions_total").increment(topics.len() as u64);
        let args: Arc<[TopicId]> = topics.clone().into();
        for topic_id in topics {
            let registration = Registration {
                client: client.clone(),
                args: args.clone(),
            };
            self.route_register(topic_id, registration).await;
        }
    }

    async fn unsubscribe(&mut self, client: ClientHandle, topics: Vec<TopicId>) {
        for topic_id in topics {
            if self.topics.contains_key(&topic_id) {
                // A stuck topic is evicted and releases its subscribers itself.
                let unregister = TopicCommand::Unregister(client.clone());
                if let Err(Undelivered::Gone(_)) = self.send_command(&topic_id, unregister).await {
                    debug!("Topic {} gone before unregister", topic_id);
                }
            } else if let Some(waiting) = self.pending.get_mut(&topic_id) {
                waiting.retain(|r| r.client.id() != client.id());
            }
        }
    }

    /// Hand a registration to the running topic, or queue it on an
    /// existence check.
    async fn route_register(&mut self, topic_id: TopicId, registration: Registration) {
        let register = TopicCommand::Register(registration);
        let registration = match self.send_command(&topic_id, register).await {
            Ok(()) => return,
            Err(Undelivered::Gone(TopicCommand::Register(registration))) => registration,
            Err(Undelivered::Stuck(TopicCommand::Register(registration))) => {
                let frame = topic_unavailable_frame(&topic_id);
                if !registration.client.deliver_now(ClientEvent::Frame(frame)) {
                    debug!("Client {} mailbox unavailable, dropping error", registration.client.id());
                }
                return;
            }
            Err(_) => return,
        };

        if let Some(waiting) = self.pending.get_mut(&topic_id) {
            waiting.push(registration);
            return;
        }
        self.pending.insert(topic_id.clone(), vec![registration]);
        self.spawn_existence_check(topic_id);
    }

    /// Queue a command on a running topic, waiting at most `command_timeout`
    /// for mailbox space.
    async fn send_command(
        &mut self,
        topic_id: &str,
        command: TopicCommand,
    ) -> std::result::Result<(), Undelivered> {
        let target = self
            .topics
            .get(topic_id)
            .map(|entry| (entry.generation, entry.commands.clone()));
        let Some((generation, commands)) = target else {
            return Err(Undelivered::Gone(command));
        };

        let command = match commands.try_send(command) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(command)) => command,
            Err(TrySendError::Closed(command)) => {
                warn!("Topic {} (generation {}) stopped unexpectedly", topic_id, generation);
                self.remove_topic(topic_id, generation, "closed");
                return Err(Undelivered::Gone(command));
            }
        };

        match commands.send_timeout(command, self.command_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(command)) => {
                warn!("Topic {} (generation {}) stopped unexpectedly", topic_id, generation);
                self.remove_topic(topic_id, generation, "closed");
                Err(Undelivered::Gone(command))
            }
            Err(SendTimeoutError::Timeout(command)) => {
                warn!(
                    "Topic {} (generation {}) mailbox full for {:?}, evicting",
                    topic_id, generation, self.command_timeout
                );
                counter!("gateway_stuck_topics_total").increment(1);
                if let Some(entry) = self.topics.get(topic_id) {
                    if entry.generation == generation {
                        entry.cancel.cancel();
                    }
                }
                self.remove_topic(topic_id, generation, "stuck");
                Err(Undelivered::Stuck(command))
            }
        }
    }

    fn spawn_existence_check(&self, topic_id: TopicId) {
        let store = self.store.clone();
        let key = self.config.layout.existence_key(&topic_id);
        let events = self.events_tx.clone();
        let limit = self.config.store_timeout;

        tokio::spawn(async move {
            let exists = match timeout(limit, store.exists(&key)).await {
                Ok(Ok(exists)) => exists,
                Ok(Err(e)) => {
                    warn!("Existence check for {} failed: {}", key, e);
                    counter!("gateway_store_errors_total", "op" => "exists").increment(1);
                    false
                }
                Err(_) => {
                    warn!("Existence check for {} timed out", key);
                    counter!("gateway_store_errors_total", "op" => "exists").increment(1);
                    false
                }
            };
            let _ = events.send(HubEvent::Checked { topic_id, exists });
        });
    }

    async fn resolve_check(&mut self, topic_id: TopicId, exists: bool) {
        let Some(waiting) = self.pending.remove(&topic_id) else {
            return;
        };

        if !exists {
            debug!("Topic {} does not exist, rejecting {} clients", topic_id, waiting.len());
            counter!("gateway_unknown_topic_total").increment(waiting.len() as u64);
            let frame = topic_missing_frame(&topic_id);
            for registration in waiting {
                if !registration
                    .client
                    .deliver_now(ClientEvent::Frame(frame.clone()))
                {
                    debug!("Client {} mailbox unavailable, dropping error", registration.client.id());
                }
            }
            return;
        }

        if waiting.is_empty() {
            debug!("No clients left waiting on topic {}", topic_id);
            return;
        }
        self.spawn_topic(topic_id.clone());
        for registration in waiting {
            self.route_register(topic_id.clone(), registration).await;
        }
    }

    fn spawn_topic(&mut self, topic_id: TopicId) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let cancel = self.shutdown.child_token();
        let (actor, commands) = TopicActor::new(
            topic_id.clone(),
            generation,
            self.store.clone(),
            self.config.clone(),
            self.events_tx.clone(),
            cancel.clone(),
        );
        tokio::spawn(actor.run());

        info!("Created topic {} (generation {})", topic_id, generation);
        counter!("gateway_topics_created_total").increment(1);
        gauge!("gateway_active_topics").increment(1.0);
        self.topics.insert(
            topic_id,
            TopicEntry {
                generation,
                commands,
                cancel,
            },
        );
    }

    /// Drop the registry entry if it still belongs to `generation`, then
    /// tell the topic to stop. Later lookups create a fresh topic.
    fn remove_topic(&mut self, topic_id: &str, generation: u64, reason: &str) {
        match self.topics.get(topic_id) {
            Some(entry) if entry.generation == generation => {}
            _ => {
                debug!("Ignoring {} for stale topic {} (generation {})", reason, topic_id, generation);
                return;
            }
        }
        let Some(entry) = self.topics.remove(topic_id) else {
            return;
        };

        // Everything routed before this point is already queued ahead of Stop.
        let _ = entry.commands.try_send(TopicCommand::Stop);
        info!("Removed topic {} (generation {}, {})", topic_id, generation, reason);
        counter!("gateway_topics_removed_total").increment(1);
        gauge!("gateway_active_topics").decrement(1.0);
    }
}
