//! Client actor: one per WebSocket connection.
//!
//! The actor owns the connection's outbound mailbox and its local view of
//! which topics it belongs to. Inbound requests are parsed and forwarded to
//! the hub; everything the rest of the system wants to tell the client
//! arrives as a [`ClientEvent`] in the mailbox.

use crate::config::ClientConfig;
use crate::error::{GatewayError, Result};
use crate::hub::{HubHandle, Operation};
use crate::protocol::{error_frame, ClientRequest, Frame, OpKind, TopicId, MALFORMED_REQUEST};
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Message delivered into a client's mailbox.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Text frame to write to the socket.
    Frame(Frame),
    /// A topic accepted this client.
    Joined(TopicId),
    /// A topic dropped this client.
    Left(TopicId),
}

/// Why a delivery did not reach the client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Mailbox stayed full past the send timeout; the client was evicted.
    #[error("slow consumer")]
    SlowConsumer,
    /// The client actor is gone.
    #[error("client closed")]
    Closed,
}

/// Cloneable address of a client actor, held by topics.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    mailbox: mpsc::Sender<ClientEvent>,
    kill: CancellationToken,
}

impl ClientHandle {
    pub fn new(mailbox: mpsc::Sender<ClientEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mailbox,
            kill: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Deliver an event, waiting at most `wait` for mailbox space.
    ///
    /// A client whose mailbox stays full for the whole window is evicted:
    /// its connection is closed and the caller should drop it.
    pub async fn deliver(
        &self,
        event: ClientEvent,
        wait: Duration,
    ) -> std::result::Result<(), DeliveryError> {
        let event = match self.mailbox.try_send(event) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(DeliveryError::Closed),
            Err(TrySendError::Full(event)) => event,
        };

        match self.mailbox.send_timeout(event, wait).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!("Client {} mailbox full for {:?}, evicting", self.id, wait);
                counter!("gateway_slow_consumers_total").increment(1);
                self.evict();
                Err(DeliveryError::SlowConsumer)
            }
        }
    }

    /// Deliver without waiting. Returns false if the mailbox is full or closed.
    pub fn deliver_now(&self, event: ClientEvent) -> bool {
        self.mailbox.try_send(event).is_ok()
    }

    /// Force the client to disconnect.
    pub fn evict(&self) {
        self.kill.cancel();
    }

    pub fn is_evicted(&self) -> bool {
        self.kill.is_cancelled()
    }
}

/// Client actor state. Consumed by [`ClientActor::run`].
pub struct ClientActor {
    handle: ClientHandle,
    mailbox: mpsc::Receiver<ClientEvent>,
    /// Topics this client was last told it belongs to.
    subscriptions: HashSet<TopicId>,
    hub: HubHandle,
    config: ClientConfig,
}

impl ClientActor {
    pub fn new(hub: HubHandle, config: ClientConfig) -> Self {
        let (tx, mailbox) = mpsc::channel(config.mailbox);
        Self {
            handle: ClientHandle::new(tx),
            mailbox,
            subscriptions: HashSet::new(),
            hub,
            config,
        }
    }

    pub fn id(&self) -> ClientId {
        self.handle.id
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Run the actor until the connection ends, then unsubscribe from every
    /// topic it belongs to and close the connection.
    ///
    /// `initial_topics` are subscribed before any inbound frame is read.
    pub async fn run<R, W, E>(mut self, mut inbound: R, mut outbound: W, initial_topics: Vec<TopicId>)
    where
        R: Stream<Item = std::result::Result<Message, E>> + Unpin,
        W: Sink<Message> + Unpin,
        W::Error: fmt::Display,
        E: fmt::Display,
    {
        let client_id = self.id();
        info!("Client {} connected", client_id);

        let reason = if self.forward(OpKind::Subscribe, initial_topics).await {
            self.process(&mut inbound, &mut outbound).await
        } else {
            "hub unavailable"
        };

        self.terminate(&mut outbound).await;
        info!("Client {} disconnected: {}", client_id, reason);
    }

    async fn process<R, W, E>(&mut self, inbound: &mut R, outbound: &mut W) -> &'static str
    where
        R: Stream<Item = std::result::Result<Message, E>> + Unpin,
        W: Sink<Message> + Unpin,
        W::Error: fmt::Display,
        E: fmt::Display,
    {
        // Unbiased, so a busy mailbox cannot keep a close or ping waiting.
        loop {
            tokio::select! {
                _ = self.handle.kill.cancelled() => return "evicted",

                event = self.mailbox.recv() => {
                    // The actor holds a sender itself, so the mailbox never closes here.
                    let Some(event) = event else { return "mailbox closed" };
                    match event {
                        ClientEvent::Frame(frame) => {
                            if let Err(e) = write(outbound, Message::Text(frame), self.config.write_timeout).await {
                                warn!("Write to client {} failed: {}", self.handle.id, e);
                                return "write failed";
                            }
                        }
                        ClientEvent::Joined(topic_id) => {
                            self.subscriptions.insert(topic_id);
                        }
                        ClientEvent::Left(topic_id) => {
                            self.subscriptions.remove(&topic_id);
                        }
                    }
                }

                msg = inbound.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !self.handle_request(text.as_str()).await {
                                return "hub unavailable";
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write(outbound, Message::Pong(data), self.config.pong_timeout).await {
                                warn!("Pong to client {} failed: {}", self.handle.id, e);
                                return "write failed";
                            }
                        }
                        Some(Ok(Message::Close(_))) => return "close frame",
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("Read from client {} failed: {}", self.handle.id, e);
                            return "read error";
                        }
                        None => return "connection closed",
                    }
                }
            }
        }
    }

    /// Parse and forward one request. Returns false once the hub is gone.
    async fn handle_request(&mut self, text: &str) -> bool {
        let request = match ClientRequest::parse(text) {
            Ok(request) => request,
            Err(e) => {
                debug!("Malformed request from client {}: {}", self.handle.id, e);
                counter!("gateway_malformed_requests_total").increment(1);
                if !self.handle.deliver_now(ClientEvent::Frame(error_frame(MALFORMED_REQUEST))) {
                    warn!("Client {} mailbox full, dropping error frame", self.handle.id);
                }
                return true;
            }
        };

        self.forward(request.kind(), request.topic_ids()).await
    }

    async fn forward(&mut self, kind: OpKind, topics: Vec<TopicId>) -> bool {
        let topics: Vec<TopicId> = match kind {
            // Only topics that confirmed membership are worth unsubscribing from.
            OpKind::Unsubscribe => topics
                .into_iter()
                .filter(|topic_id| self.subscriptions.contains(topic_id))
                .collect(),
            _ => topics,
        };
        if topics.is_empty() {
            return true;
        }

        debug!("Client {} {:?} {:?}", self.handle.id, kind, topics);
        let op = Operation {
            kind,
            topics,
            client: self.handle.clone(),
        };

        tokio::select! {
            result = self.hub.submit(op) => match result {
                Ok(()) => true,
                Err(e) => {
                    warn!("Client {} could not reach hub: {}", self.handle.id, e);
                    false
                }
            },
            _ = self.handle.kill.cancelled() => true,
        }
    }

    async fn terminate<W>(&mut self, outbound: &mut W)
    where
        W: Sink<Message> + Unpin,
    {
        // Reject further deliveries, then apply membership changes that were
        // already queued so the final unsubscribe covers them.
        self.mailbox.close();
        while let Ok(event) = self.mailbox.try_recv() {
            match event {
                ClientEvent::Joined(topic_id) => {
                    self.subscriptions.insert(topic_id);
                }
                ClientEvent::Left(topic_id) => {
                    self.subscriptions.remove(&topic_id);
                }
                ClientEvent::Frame(_) => {}
            }
        }

        let topics: Vec<TopicId> = self.subscriptions.drain().collect();
        if !topics.is_empty() {
            let op = Operation {
                kind: OpKind::Unsubscribe,
                topics,
                client: self.handle.clone(),
            };
            if self.hub.submit(op).await.is_err() {
                debug!("Hub gone while client {} was unsubscribing", self.handle.id);
            }
        }

        self.handle.kill.cancel();
        let _ = outbound.close().await;
    }
}

async fn write<W>(outbound: &mut W, msg: Message, deadline: Duration) -> Result<()>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    match timeout(deadline, outbound.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(GatewayError::WebSocket(e.to_string())),
        Err(_) => Err(GatewayError::WebSocket(format!("write timed out after {:?}", deadline))),
    }
}
