// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the crate tests.
//!
//! Models the subset of RabbitMQ behaviour the channel engine depends on: declarations
//! that fail on inequivalent arguments, topic/direct/fanout routing, exclusive consumers
//! denied with contention, per-channel prefetch, round-robin dispatch and the requeue of
//! unacknowledged messages when a channel closes. A failing operation closes the channel,
//! as the broker does.

use crate::{
    broker::{BrokerChannel, BrokerDelivery, BrokerSession, BrokerTransport, DeliveryStream},
    errors::HutchError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::{mpsc, watch};

type DeliverySender = mpsc::UnboundedSender<Result<BrokerDelivery, HutchError>>;

#[derive(Clone)]
struct Stored {
    data: Vec<u8>,
    routing_key: String,
    properties: BasicProperties,
    redelivered: bool,
}

struct Subscriber {
    channel: u64,
    tag: String,
    exclusive: bool,
    tx: DeliverySender,
}

struct FakeQueue {
    durable: bool,
    ready: VecDeque<Stored>,
    subscribers: Vec<Subscriber>,
    next: usize,
}

struct ChannelRecord {
    session: u64,
    open: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, (String, Stored)>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, (ExchangeKind, bool)>,
    queues: HashMap<String, FakeQueue>,
    bindings: Vec<(String, String, String)>,
    channels: HashMap<u64, ChannelRecord>,
    sessions: HashMap<u64, Arc<watch::Sender<Option<HutchError>>>>,
    refuse: Option<HutchError>,
    next_id: u64,
}

impl State {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn dispatch(&mut self, queue: &str) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };

        while !q.ready.is_empty() && !q.subscribers.is_empty() {
            let count = q.subscribers.len();
            let eligible = (0..count).map(|i| (q.next + i) % count).find(|&i| {
                self.channels
                    .get(&q.subscribers[i].channel)
                    .is_some_and(|c| c.prefetch == 0 || c.unacked.len() < c.prefetch as usize)
            });
            let Some(idx) = eligible else {
                return;
            };
            q.next = idx + 1;

            let Some(message) = q.ready.pop_front() else {
                return;
            };
            let subscriber = &q.subscribers[idx];
            let Some(channel) = self.channels.get_mut(&subscriber.channel) else {
                return;
            };

            channel.next_tag += 1;
            let delivery = BrokerDelivery {
                delivery_tag: channel.next_tag,
                data: message.data.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
            };

            if subscriber.tx.send(Ok(delivery)).is_ok() {
                channel
                    .unacked
                    .insert(channel.next_tag, (queue.to_owned(), message));
            } else {
                q.ready.push_front(message);
                q.subscribers.remove(idx);
            }
        }
    }

    fn requeue(&mut self, queue: &str, mut message: Stored) {
        if let Some(q) = self.queues.get_mut(queue) {
            message.redelivered = true;
            q.ready.push_front(message);
        }
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        let mut unacked: Vec<_> = channel.unacked.drain().collect();

        let mut touched = HashSet::new();
        for (name, q) in self.queues.iter_mut() {
            let before = q.subscribers.len();
            q.subscribers.retain(|s| s.channel != id);
            if q.subscribers.len() != before {
                touched.insert(name.clone());
            }
        }

        unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, (queue, message)) in unacked {
            self.requeue(&queue, message);
            touched.insert(queue);
        }

        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn routes(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        let kind = self.exchanges.get(exchange).map(|(kind, _)| kind.clone());

        self.bindings
            .iter()
            .filter(|(ex, _, _)| ex == exchange)
            .filter(|(_, _, pattern)| match kind {
                Some(ExchangeKind::Topic) => topic_matches(pattern, routing_key),
                Some(ExchangeKind::Direct) => pattern == routing_key,
                _ => true,
            })
            .map(|(_, queue, _)| queue.clone())
            .collect()
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

/// A broker shared by every instance connected to it.
#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<State>>,
    calls: Arc<AtomicUsize>,
}

impl FakeBroker {
    pub(crate) fn new() -> FakeBroker {
        FakeBroker::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of broker operations performed so far.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Makes every following connect fail with `err`, or succeed again with `None`.
    pub(crate) fn refuse_connections(&self, err: Option<HutchError>) {
        self.state().refuse = err;
    }

    /// Forcibly closes every open connection, as a broker restart would.
    pub(crate) fn drop_connections(&self) {
        let mut state = self.state();
        let sessions: Vec<_> = state.sessions.drain().collect();

        for (session, lost) in sessions {
            let channels: Vec<u64> = state
                .channels
                .iter()
                .filter(|(_, c)| c.session == session)
                .map(|(id, _)| *id)
                .collect();
            for id in channels {
                state.close_channel(id);
            }
            lost.send_replace(Some(HutchError::ConnectionError(
                "CONNECTION_FORCED - broker forced connection closure".to_owned(),
            )));
        }
    }

    pub(crate) fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    pub(crate) fn has_exchange(&self, exchange: &str) -> bool {
        self.state().exchanges.contains_key(exchange)
    }

    pub(crate) fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map_or(0, |q| q.subscribers.len())
    }

    pub(crate) fn ready_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }
}

#[async_trait]
impl BrokerTransport for FakeBroker {
    async fn connect(
        &self,
        _uri: &str,
        _connection_name: &str,
    ) -> Result<Arc<dyn BrokerSession>, HutchError> {
        self.call();
        let mut state = self.state();

        if let Some(err) = state.refuse.clone() {
            return Err(err);
        }

        let id = state.id();
        let (lost, _) = watch::channel(None);
        let lost = Arc::new(lost);
        state.sessions.insert(id, lost.clone());

        Ok(Arc::new(FakeSession {
            broker: self.clone(),
            id,
            lost,
        }))
    }
}

struct FakeSession {
    broker: FakeBroker,
    id: u64,
    lost: Arc<watch::Sender<Option<HutchError>>>,
}

#[async_trait]
impl BrokerSession for FakeSession {
    fn is_connected(&self) -> bool {
        self.broker.state().sessions.contains_key(&self.id)
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, HutchError> {
        self.broker.call();
        let mut state = self.broker.state();

        if !state.sessions.contains_key(&self.id) {
            return Err(HutchError::ChannelError("connection is closed".to_owned()));
        }

        let id = state.id();
        state.channels.insert(
            id,
            ChannelRecord {
                session: self.id,
                open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: HashMap::default(),
            },
        );

        Ok(Arc::new(FakeChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn closed(&self) -> HutchError {
        let mut rx = self.lost.subscribe();
        let cause = match rx.wait_for(|cause| cause.is_some()).await {
            Ok(cause) => cause.clone(),
            Err(_) => None,
        };

        cause.unwrap_or_else(|| HutchError::ConnectionError("connection lost".to_owned()))
    }

    async fn close(&self) -> Result<(), HutchError> {
        let mut state = self.broker.state();
        state.sessions.remove(&self.id);

        let channels: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.session == self.id)
            .map(|(id, _)| *id)
            .collect();
        for id in channels {
            state.close_channel(id);
        }

        Ok(())
    }
}

struct FakeChannel {
    broker: FakeBroker,
    id: u64,
}

impl FakeChannel {
    /// Locks the broker for an operation on this channel, failing if it is closed.
    fn open(&self) -> Result<MutexGuard<'_, State>, HutchError> {
        self.broker.call();
        let state = self.broker.state();

        if state.channels.get(&self.id).is_some_and(|c| c.open) {
            Ok(state)
        } else {
            Err(HutchError::ChannelError("channel is closed".to_owned()))
        }
    }

    /// Closes the channel and hands back `err`, as the broker does for channel-level errors.
    fn fail(&self, mut state: MutexGuard<'_, State>, err: HutchError) -> HutchError {
        state.close_channel(self.id);
        err
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.broker
            .state()
            .channels
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), HutchError> {
        let mut state = self.open()?;
        let declared = (def.kind.clone(), def.durable);
        let existing = state.exchanges.get(&def.name).cloned();

        match existing {
            Some(existing) if existing != declared => Err(self.fail(
                state,
                HutchError::TopologyError(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                    def.name
                )),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), declared);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), HutchError> {
        let mut state = self.open()?;
        let existing = state.queues.get(&def.name).map(|q| q.durable);

        match existing {
            Some(durable) if durable != def.durable => Err(self.fail(
                state,
                HutchError::TopologyError(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                    def.name
                )),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name.clone(),
                    FakeQueue {
                        durable: def.durable,
                        ready: VecDeque::new(),
                        subscribers: Vec::new(),
                        next: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), HutchError> {
        let mut state = self.open()?;

        if !state.queues.contains_key(&binding.queue_name)
            || !state.exchanges.contains_key(&binding.exchange_name)
        {
            return Err(self.fail(
                state,
                HutchError::TopologyError(format!(
                    "NOT_FOUND - no queue '{}' or exchange '{}'",
                    binding.queue_name, binding.exchange_name
                )),
            ));
        }

        let entry = (
            binding.exchange_name.clone(),
            binding.queue_name.clone(),
            binding.routing_key.clone(),
        );
        if !state.bindings.contains(&entry) {
            state.bindings.push(entry);
        }
        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), HutchError> {
        let mut state = self.open()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch;
        }
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), HutchError> {
        self.open().map(|_| ())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        exclusive: bool,
    ) -> Result<DeliveryStream, HutchError> {
        let mut state = self.open()?;

        if !state.queues.contains_key(queue) {
            return Err(self.fail(
                state,
                HutchError::ConsumerError(format!("NOT_FOUND - no queue '{queue}'")),
            ));
        }

        let locked = state.queues.get(queue).is_some_and(|q| {
            q.subscribers.iter().any(|s| s.exclusive) || (exclusive && !q.subscribers.is_empty())
        });
        if locked {
            return Err(self.fail(state, HutchError::AcquisitionContention(queue.to_owned())));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(q) = state.queues.get_mut(queue) {
            q.subscribers.push(Subscriber {
                channel: self.id,
                tag: consumer_tag.to_owned(),
                exclusive,
                tx,
            });
        }
        state.dispatch(queue);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), HutchError> {
        let mut state = self.open()?;
        for q in state.queues.values_mut() {
            q.subscribers
                .retain(|s| !(s.channel == self.id && s.tag == consumer_tag));
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), HutchError> {
        let mut state = self.open()?;

        if !state.exchanges.contains_key(exchange) {
            return Err(self.fail(
                state,
                HutchError::PublishingError(format!("NOT_FOUND - no exchange '{exchange}'")),
            ));
        }

        let message = Stored {
            data: payload.to_vec(),
            routing_key: routing_key.to_owned(),
            properties,
            redelivered: false,
        };

        for queue in state.routes(exchange, routing_key) {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(message.clone());
            }
            state.dispatch(&queue);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), HutchError> {
        let mut state = self.open()?;

        let settled = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag));

        match settled {
            Some((queue, _)) => {
                state.dispatch(&queue);
                Ok(())
            }
            None => Err(self.fail(
                state,
                HutchError::ChannelError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                )),
            )),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), HutchError> {
        let mut state = self.open()?;

        let settled = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag));

        match settled {
            Some((queue, message)) => {
                if requeue {
                    state.requeue(&queue, message);
                }
                state.dispatch(&queue);
                Ok(())
            }
            None => Err(self.fail(
                state,
                HutchError::ChannelError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                )),
            )),
        }
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), HutchError> {
        let mut state = self.open()?;
        state.queues.remove(queue);
        state.bindings.retain(|(_, q, _)| q != queue);
        Ok(())
    }

    async fn delete_exchange(&self, exchange: &str) -> Result<(), HutchError> {
        let mut state = self.open()?;
        state.exchanges.remove(exchange);
        state.bindings.retain(|(ex, _, _)| ex != exchange);
        Ok(())
    }

    async fn close(&self) -> Result<(), HutchError> {
        self.broker.call();
        self.broker.state().close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_topic_patterns() {
        assert!(topic_matches("#", "q1"));
        assert!(topic_matches("#", "orders.created.eu"));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("*.created.#", "orders.created.eu.west"));
        assert!(!topic_matches("orders", "payments"));
    }

    #[tokio::test]
    async fn second_exclusive_consumer_is_denied_and_its_channel_closed() {
        let broker = FakeBroker::new();
        let session = broker.connect("amqp://fake", "test").await.unwrap();

        let first = session.open_channel().await.unwrap();
        first.declare_queue(&QueueDefinition::new("q1")).await.unwrap();
        let _stream = first.consume("q1", "a", true).await.unwrap();

        let second = session.open_channel().await.unwrap();
        assert_eq!(
            second.consume("q1", "b", true).await.err(),
            Some(HutchError::AcquisitionContention("q1".to_owned()))
        );
        assert!(!second.is_open());

        first.close().await.unwrap();
        let third = session.open_channel().await.unwrap();
        assert!(third.consume("q1", "c", true).await.is_ok());
    }
}
