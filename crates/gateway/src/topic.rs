//! Topic actor: one per active topic.
//!
//! Owns the topic's subscriber set and per-sub-stream replay caches, and
//! drives a paired [`TailReader`]. Lifecycle:
//!
//! ```text
//! Initializing ──seed caches, start reader──▶ Running
//! Running ──last subscriber leaves──▶ Draining (Idle sent to hub)
//! Draining ──Stop from hub──▶ stopped (reader cancelled)
//! ```
//!
//! Registrations that reach a draining topic are bounced back to the hub,
//! which routes them to a fresh generation.

use crate::cache::MessageCache;
use crate::client::{ClientEvent, ClientHandle, ClientId};
use crate::config::TopicConfig;
use crate::hub::HubEvent;
use crate::protocol::{ack_frame, data_frame, topic_unavailable_frame, Frame, TopicId};
use crate::reader::{Delivery, TailReader};
use futures::FutureExt;
use log_store::{compare_ids, EntryId, SharedLogStore, FROM_START};
use metrics::counter;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Request to join a topic.
#[derive(Debug, Clone)]
pub struct Registration {
    pub client: ClientHandle,
    /// Topic ids of the originating subscribe request, echoed in the ack.
    pub args: Arc<[TopicId]>,
}

/// Commands accepted by a topic actor, processed in FIFO order.
#[derive(Debug)]
pub enum TopicCommand {
    Register(Registration),
    Unregister(ClientHandle),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicState {
    Initializing,
    Running,
    Draining,
}

pub struct TopicActor {
    id: TopicId,
    generation: u64,
    /// Store keys, parallel to `caches`.
    streams: Vec<String>,
    caches: Vec<MessageCache<Frame>>,
    /// Id of the last entry fanned out per sub-stream.
    delivered: Vec<Option<EntryId>>,
    subscribers: HashMap<ClientId, ClientHandle>,
    state: TopicState,
    commands: mpsc::Receiver<TopicCommand>,
    deliveries_tx: mpsc::Sender<Delivery>,
    deliveries: mpsc::Receiver<Delivery>,
    hub: mpsc::UnboundedSender<HubEvent>,
    store: SharedLogStore,
    config: Arc<TopicConfig>,
    cancel: CancellationToken,
    reader_cancel: Option<CancellationToken>,
}

impl TopicActor {
    /// Build a topic actor and the sender for its command mailbox.
    pub fn new(
        id: TopicId,
        generation: u64,
        store: SharedLogStore,
        config: Arc<TopicConfig>,
        hub: mpsc::UnboundedSender<HubEvent>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Sender<TopicCommand>) {
        let (commands_tx, commands) = mpsc::channel(config.command_mailbox);
        let (deliveries_tx, deliveries) = mpsc::channel(config.delivery_mailbox);
        let streams = config.layout.stream_keys(&id);
        let caches = config
            .layout
            .sub_streams
            .iter()
            .map(|sub| MessageCache::new(sub.capacity))
            .collect();

        let delivered = vec![None; streams.len()];
        let actor = Self {
            id,
            generation,
            streams,
            caches,
            delivered,
            subscribers: HashMap::new(),
            state: TopicState::Initializing,
            commands,
            deliveries_tx,
            deliveries,
            hub,
            store,
            config,
            cancel,
            reader_cancel: None,
        };
        (actor, commands_tx)
    }

    /// Run until stopped by the hub, restarting after panics up to the
    /// configured limit.
    pub async fn run(mut self) {
        info!("Topic {} starting (generation {})", self.id, self.generation);
        let cancel = self.cancel.clone();
        let mut restarts: u32 = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Ok(()),
                outcome = AssertUnwindSafe(async {
                    self.initialize().await;
                    self.process().await;
                })
                .catch_unwind() => outcome,
            };
            self.stop_reader();

            let Err(panic) = outcome else {
                break;
            };
            restarts += 1;
            counter!("gateway_topic_restarts_total").increment(1);
            if restarts > self.config.max_restarts {
                error!(
                    "Topic {} panicked {} times ({}), abandoning",
                    self.id,
                    restarts,
                    panic_message(panic.as_ref())
                );
                self.abandon().await;
                break;
            }
            warn!(
                "Topic {} panicked ({}), restarting {}/{}",
                self.id,
                panic_message(panic.as_ref()),
                restarts,
                self.config.max_restarts
            );
        }

        self.release();
        self.cancel.cancel();
        info!("Topic {} stopped (generation {})", self.id, self.generation);
    }

    /// Seed the caches and cursors from the store and start the reader.
    ///
    /// Seeding as a whole is bounded by `store_timeout`. Store failures and
    /// timeouts leave a cache empty and a cursor at the start of the stream
    /// rather than failing the topic. After a restart, each sub-stream resumes
    /// from the last entry it fanned out.
    async fn initialize(&mut self) {
        let deadline = Instant::now() + self.config.store_timeout;
        let mut cursors: Vec<EntryId> = Vec::with_capacity(self.streams.len());

        for (index, key) in self.streams.iter().enumerate() {
            let resume = self.delivered[index].clone();
            let cache = &mut self.caches[index];
            cache.clear();

            let mut newest: Option<EntryId> = None;
            if cache.capacity() > 0 {
                match timeout_at(deadline, self.store.reverse_range(key, cache.capacity())).await {
                    Ok(Ok(entries)) => {
                        newest = entries.first().map(|(id, _)| id.clone());
                        for (id, fields) in entries.iter().rev() {
                            // Anything past the last fan-out is read again live.
                            if resume
                                .as_ref()
                                .is_some_and(|last| compare_ids(id, last) == Ordering::Greater)
                            {
                                continue;
                            }
                            match data_frame(fields) {
                                Ok(frame) => cache.push(frame),
                                Err(e) => warn!("Skipping entry {} of {}: {}", id, key, e),
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("Seeding cache for {} failed: {}", key, e);
                        counter!("gateway_store_errors_total", "op" => "reverse_range").increment(1);
                    }
                    Err(_) => {
                        warn!("Seeding cache for {} timed out", key);
                        counter!("gateway_store_errors_total", "op" => "reverse_range").increment(1);
                    }
                }
            }

            let cursor = match (resume, newest) {
                (Some(id), _) | (None, Some(id)) => id,
                (None, None) => match timeout_at(deadline, self.store.latest_id(key)).await {
                    Ok(Ok(Some(id))) => id,
                    Ok(Ok(None)) => FROM_START.to_string(),
                    Ok(Err(e)) => {
                        warn!("Cursor lookup for {} failed: {}", key, e);
                        counter!("gateway_store_errors_total", "op" => "latest_id").increment(1);
                        FROM_START.to_string()
                    }
                    Err(_) => {
                        warn!("Cursor lookup for {} timed out", key);
                        counter!("gateway_store_errors_total", "op" => "latest_id").increment(1);
                        FROM_START.to_string()
                    }
                },
            };
            cursors.push(cursor);
        }

        if self.state == TopicState::Initializing {
            self.state = TopicState::Running;
        }
        self.start_reader(cursors);
    }

    fn start_reader(&mut self, cursors: Vec<EntryId>) {
        let cancel = self.cancel.child_token();
        let reader = TailReader::new(
            self.id.clone(),
            self.streams.clone(),
            cursors,
            self.store.clone(),
            self.deliveries_tx.clone(),
            self.config.reader.clone(),
            cancel.clone(),
        );
        tokio::spawn(reader.run());
        self.reader_cancel = Some(cancel);
    }

    fn stop_reader(&mut self) {
        if let Some(cancel) = self.reader_cancel.take() {
            cancel.cancel();
        }
        // Queued payloads are read again from the `delivered` cursors.
        while self.deliveries.try_recv().is_ok() {}
    }

    /// Let go of every client still attached: subscribers are told they left
    /// and queued registrations are refused.
    fn release(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                TopicCommand::Register(registration) => {
                    let frame = topic_unavailable_frame(&self.id);
                    registration.client.deliver_now(ClientEvent::Frame(frame));
                }
                TopicCommand::Unregister(client) => {
                    client.deliver_now(ClientEvent::Left(self.id.clone()));
                }
                TopicCommand::Stop => {}
            }
        }
        for (_, client) in self.subscribers.drain() {
            client.deliver_now(ClientEvent::Left(self.id.clone()));
        }
    }

    async fn process(&mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return,

                command = self.commands.recv() => match command {
                    Some(TopicCommand::Register(registration)) => self.register(registration).await,
                    Some(TopicCommand::Unregister(client)) => self.unregister(client).await,
                    Some(TopicCommand::Stop) | None => return,
                },

                Some(delivery) = self.deliveries.recv() => self.fan_out(delivery).await,
            }
        }
    }

    async fn register(&mut self, registration: Registration) {
        if self.state == TopicState::Draining {
            debug!(
                "Topic {} draining, rerouting client {}",
                self.id,
                registration.client.id()
            );
            self.reroute(registration);
            return;
        }

        let client = registration.client;
        self.subscribers.insert(client.id(), client.clone());
        debug!("Client {} joined topic {}", client.id(), self.id);

        let mut reachable = self.deliver(&client, ClientEvent::Joined(self.id.clone())).await;
        if reachable {
            match ack_frame(&registration.args) {
                Ok(ack) => reachable = self.deliver(&client, ClientEvent::Frame(ack)).await,
                Err(e) => warn!("Failed to serialize ack for topic {}: {}", self.id, e),
            }
        }

        let mut replayed: u64 = 0;
        if reachable {
            'replay: for cache in &self.caches {
                for frame in cache.iter() {
                    if !self.deliver(&client, ClientEvent::Frame(frame.clone())).await {
                        reachable = false;
                        break 'replay;
                    }
                    replayed += 1;
                }
            }
        }
        counter!("gateway_replay_frames_total").increment(replayed);

        if !reachable {
            self.subscribers.remove(&client.id());
            self.check_idle();
        }
    }

    async fn unregister(&mut self, client: ClientHandle) {
        if self.subscribers.remove(&client.id()).is_some() {
            debug!("Client {} left topic {}", client.id(), self.id);
        }
        // The client may already be gone; its membership view no longer matters then.
        let _ = self.deliver(&client, ClientEvent::Left(self.id.clone())).await;
        self.check_idle();
    }

    async fn fan_out(&mut self, delivery: Delivery) {
        if let Some(cache) = self.caches.get_mut(delivery.sub_stream) {
            cache.push(delivery.payload.clone());
            self.delivered[delivery.sub_stream] = Some(delivery.id.clone());
        }
        if self.subscribers.is_empty() {
            return;
        }

        let mut dropped = Vec::new();
        for (id, client) in &self.subscribers {
            if !self.deliver(client, ClientEvent::Frame(delivery.payload.clone())).await {
                dropped.push(*id);
            }
        }
        counter!("gateway_messages_fanned_out_total")
            .increment((self.subscribers.len() - dropped.len()) as u64);

        if !dropped.is_empty() {
            for id in &dropped {
                self.subscribers.remove(id);
            }
            debug!("Topic {} dropped {} unreachable clients", self.id, dropped.len());
            self.check_idle();
        }
    }

    async fn deliver(&self, client: &ClientHandle, event: ClientEvent) -> bool {
        match client.deliver(event, self.config.send_timeout).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Topic {} could not deliver to client {}: {}", self.id, client.id(), e);
                false
            }
        }
    }

    /// Ask the hub for removal once the last subscriber is gone.
    fn check_idle(&mut self) {
        if self.state != TopicState::Running || !self.subscribers.is_empty() {
            return;
        }
        info!("Topic {} has no subscribers, requesting removal", self.id);
        self.state = TopicState::Draining;
        let idle = HubEvent::Idle {
            topic_id: self.id.clone(),
            generation: self.generation,
        };
        if self.hub.send(idle).is_err() {
            debug!("Hub gone, topic {} will stop with its mailbox", self.id);
        }
    }

    fn reroute(&self, registration: Registration) {
        let reroute = HubEvent::Reroute {
            topic_id: self.id.clone(),
            registration,
        };
        if self.hub.send(reroute).is_err() {
            debug!("Hub gone, dropping rerouted registration for {}", self.id);
        }
    }

    /// Give up after repeated panics: release every subscriber, report the
    /// crash and bounce whatever the hub routed here before it noticed.
    async fn abandon(&mut self) {
        self.state = TopicState::Draining;
        for (_, client) in self.subscribers.drain() {
            client.deliver_now(ClientEvent::Left(self.id.clone()));
        }
        let crashed = HubEvent::Crashed {
            topic_id: self.id.clone(),
            generation: self.generation,
        };
        if self.hub.send(crashed).is_err() {
            return;
        }

        while let Some(command) = self.commands.recv().await {
            match command {
                TopicCommand::Register(registration) => self.reroute(registration),
                TopicCommand::Unregister(client) => {
                    client.deliver_now(ClientEvent::Left(self.id.clone()));
                }
                TopicCommand::Stop => break,
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::config::ReaderConfig;
    use async_trait::async_trait;
    use log_store::{Fields, LogStore, MemoryLogStore, StreamEntry};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    /// Memory store whose `reverse_range` panics a set number of times.
    struct PanickyStore {
        inner: MemoryLogStore,
        panics_left: AtomicU32,
    }

    #[async_trait]
    impl LogStore for PanickyStore {
        async fn exists(&self, key: &str) -> log_store::Result<bool> {
            self.inner.exists(key).await
        }

        async fn tail_read(
            &self,
            cursors: &[(String, EntryId)],
            count: usize,
            block: Duration,
        ) -> log_store::Result<Vec<StreamEntry>> {
            self.inner.tail_read(cursors, count, block).await
        }

        async fn latest_id(&self, key: &str) -> log_store::Result<Option<EntryId>> {
            self.inner.latest_id(key).await
        }

        async fn reverse_range(
            &self,
            key: &str,
            count: usize,
        ) -> log_store::Result<Vec<(EntryId, Fields)>> {
            let left = self.panics_left.load(Ordering::SeqCst);
            if left > 0 {
                self.panics_left.store(left - 1, Ordering::SeqCst);
                panic!("store exploded");
            }
            self.inner.reverse_range(key, count).await
        }
    }

    /// Memory store whose `reverse_range` never answers.
    struct StallingStore {
        inner: MemoryLogStore,
    }

    #[async_trait]
    impl LogStore for StallingStore {
        async fn exists(&self, key: &str) -> log_store::Result<bool> {
            self.inner.exists(key).await
        }

        async fn tail_read(
            &self,
            cursors: &[(String, EntryId)],
            count: usize,
            block: Duration,
        ) -> log_store::Result<Vec<StreamEntry>> {
            self.inner.tail_read(cursors, count, block).await
        }

        async fn latest_id(&self, key: &str) -> log_store::Result<Option<EntryId>> {
            self.inner.latest_id(key).await
        }

        async fn reverse_range(
            &self,
            _key: &str,
            _count: usize,
        ) -> log_store::Result<Vec<(EntryId, Fields)>> {
            std::future::pending().await
        }
    }

    /// Memory store that tracks tail reads in flight.
    struct CountingStore {
        inner: MemoryLogStore,
        active_reads: AtomicUsize,
    }

    struct ActiveRead<'a>(&'a AtomicUsize);

    impl Drop for ActiveRead<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl LogStore for CountingStore {
        async fn exists(&self, key: &str) -> log_store::Result<bool> {
            self.inner.exists(key).await
        }

        async fn tail_read(
            &self,
            cursors: &[(String, EntryId)],
            count: usize,
            block: Duration,
        ) -> log_store::Result<Vec<StreamEntry>> {
            self.active_reads.fetch_add(1, Ordering::SeqCst);
            let _active = ActiveRead(&self.active_reads);
            self.inner.tail_read(cursors, count, block).await
        }

        async fn latest_id(&self, key: &str) -> log_store::Result<Option<EntryId>> {
            self.inner.latest_id(key).await
        }

        async fn reverse_range(
            &self,
            key: &str,
            count: usize,
        ) -> log_store::Result<Vec<(EntryId, Fields)>> {
            self.inner.reverse_range(key, count).await
        }
    }

    async fn wait_for_reads(store: &CountingStore, expected: usize) {
        for _ in 0..200 {
            if store.active_reads.load(Ordering::SeqCst) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tail reads in flight never reached {}", expected);
    }

    fn config(max_restarts: u32) -> Arc<TopicConfig> {
        Arc::new(TopicConfig {
            send_timeout: Duration::from_millis(50),
            max_restarts,
            reader: ReaderConfig {
                block_timeout: Duration::from_millis(500),
                read_count: 16,
                backoff: BackoffPolicy {
                    first: Duration::from_millis(10),
                    max: Duration::from_millis(40),
                    factor: 2.0,
                },
            },
            ..TopicConfig::default()
        })
    }

    struct Harness {
        commands: mpsc::Sender<TopicCommand>,
        hub: mpsc::UnboundedReceiver<HubEvent>,
        task: JoinHandle<()>,
    }

    fn spawn_topic(store: SharedLogStore, config: Arc<TopicConfig>) -> Harness {
        spawn_topic_with(store, config, CancellationToken::new())
    }

    fn spawn_topic_with(
        store: SharedLogStore,
        config: Arc<TopicConfig>,
        cancel: CancellationToken,
    ) -> Harness {
        let (hub_tx, hub) = mpsc::unbounded_channel();
        let (actor, commands) =
            TopicActor::new("ABC".to_string(), 7, store, config, hub_tx, cancel);
        Harness {
            commands,
            hub,
            task: tokio::spawn(actor.run()),
        }
    }

    fn client(capacity: usize) -> (ClientHandle, mpsc::Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ClientHandle::new(tx), rx)
    }

    fn registration(client: &ClientHandle, args: &[&str]) -> TopicCommand {
        TopicCommand::Register(Registration {
            client: client.clone(),
            args: args.iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn next_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("client mailbox closed")
    }

    async fn next_frame(rx: &mut mpsc::Receiver<ClientEvent>) -> String {
        match next_event(rx).await {
            ClientEvent::Frame(frame) => frame.as_str().to_string(),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    async fn expect_joined(rx: &mut mpsc::Receiver<ClientEvent>) {
        match next_event(rx).await {
            ClientEvent::Joined(topic_id) => assert_eq!(topic_id, "ABC"),
            other => panic!("expected join, got {:?}", other),
        }
    }

    async fn next_hub_event(rx: &mut mpsc::UnboundedReceiver<HubEvent>) -> HubEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for hub event")
            .expect("topic dropped hub sender")
    }

    #[tokio::test]
    async fn test_register_acks_then_replays_oldest_first() {
        let store = Arc::new(MemoryLogStore::new());
        for n in 0..35 {
            store.append("ABC::public_trades", [("n", n.to_string())]);
        }
        store.append("ABC::public_bid", [("px", "1")]);
        store.append("ABC::public_bid", [("px", "2")]);
        let harness = spawn_topic(store, config(3));

        let (handle, mut rx) = client(64);
        harness
            .commands
            .send(registration(&handle, &["ABC", "DEF"]))
            .await
            .unwrap();

        expect_joined(&mut rx).await;
        assert_eq!(
            next_frame(&mut rx).await,
            r#"{"success":"true","subscriptions":["ABC","DEF"]}"#
        );
        for n in 5..35 {
            assert_eq!(next_frame(&mut rx).await, format!(r#"{{"n":"{}"}}"#, n));
        }
        assert_eq!(next_frame(&mut rx).await, r#"{"px":"2"}"#);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fans_out_live_entries_to_every_subscriber() {
        let store = Arc::new(MemoryLogStore::new());
        let harness = spawn_topic(store.clone(), config(3));

        let (first, mut first_rx) = client(16);
        let (second, mut second_rx) = client(16);
        for handle in [&first, &second] {
            harness.commands.send(registration(handle, &["ABC"])).await.unwrap();
        }
        for rx in [&mut first_rx, &mut second_rx] {
            expect_joined(rx).await;
            next_frame(rx).await;
        }

        store.append("ABC::public_trades", [("n", "1")]);
        store.append("ABC::public_ask", [("px", "3")]);

        for rx in [&mut first_rx, &mut second_rx] {
            let mut frames = vec![next_frame(rx).await, next_frame(rx).await];
            frames.sort();
            assert_eq!(frames, vec![r#"{"n":"1"}"#, r#"{"px":"3"}"#]);
        }
    }

    #[tokio::test]
    async fn test_duplicate_register_keeps_one_membership() {
        let store = Arc::new(MemoryLogStore::new());
        let harness = spawn_topic(store.clone(), config(3));

        let (handle, mut rx) = client(16);
        for _ in 0..2 {
            harness.commands.send(registration(&handle, &["ABC"])).await.unwrap();
            expect_joined(&mut rx).await;
            next_frame(&mut rx).await;
        }

        store.append("ABC::public_trades", [("n", "1")]);
        assert_eq!(next_frame(&mut rx).await, r#"{"n":"1"}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_last_unregister_drains_and_reroutes() {
        let store = Arc::new(MemoryLogStore::new());
        let mut harness = spawn_topic(store, config(3));

        let (handle, mut rx) = client(16);
        harness.commands.send(registration(&handle, &["ABC"])).await.unwrap();
        expect_joined(&mut rx).await;
        next_frame(&mut rx).await;

        harness
            .commands
            .send(TopicCommand::Unregister(handle.clone()))
            .await
            .unwrap();
        match next_event(&mut rx).await {
            ClientEvent::Left(topic_id) => assert_eq!(topic_id, "ABC"),
            other => panic!("expected leave, got {:?}", other),
        }
        match next_hub_event(&mut harness.hub).await {
            HubEvent::Idle { topic_id, generation } => {
                assert_eq!(topic_id, "ABC");
                assert_eq!(generation, 7);
            }
            other => panic!("expected idle, got {:?}", other),
        }

        let (late, _late_rx) = client(16);
        harness.commands.send(registration(&late, &["ABC"])).await.unwrap();
        match next_hub_event(&mut harness.hub).await {
            HubEvent::Reroute { topic_id, registration } => {
                assert_eq!(topic_id, "ABC");
                assert_eq!(registration.client.id(), late.id());
            }
            other => panic!("expected reroute, got {:?}", other),
        }

        harness.commands.send(TopicCommand::Stop).await.unwrap();
        timeout(Duration::from_secs(1), harness.task)
            .await
            .expect("topic should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_slow_consumer_is_evicted() {
        let store = Arc::new(MemoryLogStore::new());
        let mut harness = spawn_topic(store.clone(), config(3));

        // Room for the join and the ack only.
        let (handle, _rx) = client(2);
        harness.commands.send(registration(&handle, &["ABC"])).await.unwrap();

        store.append("ABC::public_trades", [("n", "1")]);
        match next_hub_event(&mut harness.hub).await {
            HubEvent::Idle { topic_id, .. } => assert_eq!(topic_id, "ABC"),
            other => panic!("expected idle, got {:?}", other),
        }
        assert!(handle.is_evicted());
    }

    #[tokio::test]
    async fn test_restarts_after_panic() {
        let store = Arc::new(PanickyStore {
            inner: MemoryLogStore::new(),
            panics_left: AtomicU32::new(1),
        });
        store.inner.append("ABC::public_trades", [("n", "0")]);
        let harness = spawn_topic(store.clone(), config(3));

        let (handle, mut rx) = client(16);
        harness.commands.send(registration(&handle, &["ABC"])).await.unwrap();
        expect_joined(&mut rx).await;
        next_frame(&mut rx).await;
        assert_eq!(next_frame(&mut rx).await, r#"{"n":"0"}"#);

        store.inner.append("ABC::public_trades", [("n", "1")]);
        assert_eq!(next_frame(&mut rx).await, r#"{"n":"1"}"#);
    }

    #[tokio::test]
    async fn test_abandons_after_repeated_panics() {
        let store = Arc::new(PanickyStore {
            inner: MemoryLogStore::new(),
            panics_left: AtomicU32::new(u32::MAX),
        });
        let mut harness = spawn_topic(store, config(1));

        match next_hub_event(&mut harness.hub).await {
            HubEvent::Crashed { topic_id, generation } => {
                assert_eq!(topic_id, "ABC");
                assert_eq!(generation, 7);
            }
            other => panic!("expected crash, got {:?}", other),
        }

        let (handle, _rx) = client(16);
        harness.commands.send(registration(&handle, &["ABC"])).await.unwrap();
        match next_hub_event(&mut harness.hub).await {
            HubEvent::Reroute { registration, .. } => {
                assert_eq!(registration.client.id(), handle.id())
            }
            other => panic!("expected reroute, got {:?}", other),
        }

        drop(harness.commands);
        timeout(Duration::from_secs(1), harness.task)
            .await
            .expect("abandoned topic should stop once the hub lets go")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_tail_reader() {
        let store = Arc::new(CountingStore {
            inner: MemoryLogStore::new(),
            active_reads: AtomicUsize::new(0),
        });
        let mut config = (*config(3)).clone();
        config.reader.block_timeout = Duration::from_secs(30);
        let mut harness = spawn_topic(store.clone(), Arc::new(config));

        let (handle, mut rx) = client(16);
        harness.commands.send(registration(&handle, &["ABC"])).await.unwrap();
        expect_joined(&mut rx).await;
        next_frame(&mut rx).await;
        wait_for_reads(&store, 1).await;

        harness
            .commands
            .send(TopicCommand::Unregister(handle.clone()))
            .await
            .unwrap();
        assert!(matches!(
            next_hub_event(&mut harness.hub).await,
            HubEvent::Idle { .. }
        ));
        harness.commands.send(TopicCommand::Stop).await.unwrap();

        timeout(Duration::from_secs(1), harness.task)
            .await
            .expect("topic should stop")
            .unwrap();
        wait_for_reads(&store, 0).await;
    }

    #[tokio::test]
    async fn test_seeding_timeout_fails_open() {
        let store = Arc::new(StallingStore {
            inner: MemoryLogStore::new(),
        });
        let mut config = (*config(3)).clone();
        config.store_timeout = Duration::from_millis(100);
        let harness = spawn_topic(store.clone(), Arc::new(config));

        let (handle, mut rx) = client(16);
        harness.commands.send(registration(&handle, &["ABC"])).await.unwrap();
        expect_joined(&mut rx).await;
        assert_eq!(
            next_frame(&mut rx).await,
            r#"{"success":"true","subscriptions":["ABC"]}"#
        );

        store.inner.append("ABC::public_trades", [("n", "1")]);
        assert_eq!(next_frame(&mut rx).await, r#"{"n":"1"}"#);
    }

    #[tokio::test]
    async fn test_cancel_releases_clients() {
        let store = Arc::new(StallingStore {
            inner: MemoryLogStore::new(),
        });
        let mut config = (*config(3)).clone();
        config.store_timeout = Duration::from_secs(30);
        let cancel = CancellationToken::new();
        let harness = spawn_topic_with(store, Arc::new(config), cancel.clone());

        let (handle, mut rx) = client(16);
        harness.commands.send(registration(&handle, &["ABC"])).await.unwrap();
        cancel.cancel();

        timeout(Duration::from_secs(1), harness.task)
            .await
            .expect("cancelled topic should stop while seeding")
            .unwrap();
        assert_eq!(next_frame(&mut rx).await, "error: Topic unavailable ABC");
    }

    #[tokio::test]
    async fn test_restart_resumes_from_last_fanned_out_entry() {
        let store = Arc::new(MemoryLogStore::new());
        let first = store.append("ABC::public_trades", [("n", "1")]);
        store.append("ABC::public_trades", [("n", "2")]);
        let third = store.append("ABC::public_trades", [("n", "3")]);

        let (hub_tx, _hub) = mpsc::unbounded_channel();
        let (mut actor, _commands) = TopicActor::new(
            "ABC".to_string(),
            7,
            store,
            config(3),
            hub_tx,
            CancellationToken::new(),
        );
        actor.delivered[0] = Some(first);
        actor.initialize().await;

        let cached: Vec<&str> = actor.caches[0].iter().map(Frame::as_str).collect();
        assert_eq!(cached, vec![r#"{"n":"1"}"#]);

        for n in ["2", "3"] {
            let delivery = timeout(Duration::from_secs(2), actor.deliveries.recv())
                .await
                .expect("timed out waiting for delivery")
                .expect("reader stopped");
            assert_eq!(delivery.payload.as_str(), format!(r#"{{"n":"{}"}}"#, n));
            actor.fan_out(delivery).await;
        }
        assert_eq!(actor.delivered[0], Some(third));
        assert_eq!(actor.caches[0].len(), 3);
        actor.stop_reader();
    }
}
