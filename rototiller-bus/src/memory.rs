//! Process-local event bus
//!
//! Same routing and settlement rules as the Postgres transport, held in
//! memory. Also records what was emitted and settled so tests can inspect it.

use async_trait::async_trait;
use rototiller_core::domain::event::{DeliveryTag, Event};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::{Consumer, EventBus, Subscription, delivery_tag, routing};

#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    config: BusConfig,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    bindings: Vec<(String, String)>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<DeliveryTag, (String, Event)>,
    next_tag: DeliveryTag,
    emitted: Vec<Event>,
    acked: Vec<Event>,
    nacked: Vec<(Event, bool)>,
    fail_publish: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Event>,
    notify: Arc<Notify>,
}

impl InMemoryEventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            inner: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every event accepted by `emit`, in order
    pub fn emitted(&self) -> Vec<Event> {
        self.lock().emitted.clone()
    }

    /// Emitted events of one type
    pub fn emitted_of(&self, event_type: &str) -> Vec<Event> {
        self.lock()
            .emitted
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn acked(&self) -> Vec<Event> {
        self.lock().acked.clone()
    }

    /// Nacked events with their requeue flag
    pub fn nacked(&self) -> Vec<(Event, bool)> {
        self.lock().nacked.clone()
    }

    /// Deliveries waiting in a queue
    pub fn pending(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Deliveries handed out and not yet settled
    pub fn unacked(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Makes `emit` fail until reset
    pub fn fail_publishes(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    /// Returns every unsettled delivery to its queue, as a broker does when
    /// a consumer connection drops
    pub fn requeue_unacked(&self) -> usize {
        let mut inner = self.lock();
        let mut pending: Vec<(DeliveryTag, (String, Event))> = inner.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));

        let count = pending.len();
        for (_, (queue, mut event)) in pending {
            event.delivery_tag = None;
            let state = inner.queues.entry(queue).or_default();
            state.ready.push_front(event);
            state.notify.notify_one();
        }
        count
    }
}

impl Inner {
    /// Pops the next ready event of a queue and marks it unacked
    fn deliver(&mut self, queue: &str) -> Option<Event> {
        let mut event = self.queues.get_mut(queue)?.ready.pop_front()?;
        self.next_tag += 1;
        let tag = self.next_tag;
        event.delivery_tag = Some(tag);
        self.unacked.insert(tag, (queue.to_string(), event.clone()));
        Some(event)
    }

    fn requeue(&mut self, tag: DeliveryTag) {
        if let Some((queue, mut event)) = self.unacked.remove(&tag) {
            event.delivery_tag = None;
            let state = self.queues.entry(queue).or_default();
            state.ready.push_front(event);
            state.notify.notify_one();
        }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn emit(&self, event: &Event) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_publish {
            return Err(BusError::Unavailable(format!(
                "publishing '{}' refused",
                event.event_type
            )));
        }

        let mut queues: Vec<String> = inner
            .bindings
            .iter()
            .filter(|(_, pattern)| routing::matches(pattern, &event.event_type))
            .map(|(queue, _)| queue.clone())
            .collect();
        queues.sort();
        queues.dedup();

        let mut published = event.clone();
        published.delivery_tag = None;

        for queue in &queues {
            let state = inner.queues.entry(queue.clone()).or_default();
            state.ready.push_back(published.clone());
            state.notify.notify_one();
        }
        if queues.is_empty() {
            debug!(event_type = %event.event_type, "No queue bound for event, dropping");
        }

        inner.emitted.push(published);
        Ok(())
    }

    async fn new_consumer(&self, consumer_id: &str, patterns: &[&str]) -> Result<Consumer> {
        for pattern in patterns {
            routing::validate_pattern(pattern)?;
        }

        let queue = self.config.queue_name(consumer_id);
        let mut inner = self.lock();
        inner.queues.entry(queue.clone()).or_default();
        for pattern in patterns {
            let binding = (queue.clone(), pattern.to_string());
            if !inner.bindings.contains(&binding) {
                inner.bindings.push(binding);
            }
        }

        Ok(Consumer {
            id: consumer_id.to_string(),
            queue,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        })
    }

    fn listen(&self, consumer: &Consumer) -> Subscription {
        let (event_tx, events) = mpsc::channel(1);
        let (_error_tx, errors) = mpsc::channel(1);
        let bus = self.clone();
        let queue = consumer.queue.clone();

        tokio::spawn(async move {
            // Keep the error channel open for the life of the listener
            let _error_tx = _error_tx;
            loop {
                let (next, notify) = {
                    let mut inner = bus.lock();
                    let notify = inner.queues.entry(queue.clone()).or_default().notify.clone();
                    (inner.deliver(&queue), notify)
                };

                match next {
                    Some(event) => {
                        let tag = event.delivery_tag;
                        if event_tx.send(event).await.is_err() {
                            if let Some(tag) = tag {
                                bus.lock().requeue(tag);
                            }
                            break;
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = notify.notified() => {}
                            _ = event_tx.closed() => break,
                        }
                    }
                }
            }
            debug!(queue = %queue, "Listener stopped");
        });

        Subscription { events, errors }
    }

    async fn ack(&self, event: &Event) -> Result<()> {
        let tag = delivery_tag(event)?;
        let mut inner = self.lock();
        if inner.unacked.remove(&tag).is_none() {
            debug!(tag, "Delivery already settled");
        }
        inner.acked.push(event.clone());
        Ok(())
    }

    async fn nack(&self, event: &Event, requeue: bool) -> Result<()> {
        let tag = delivery_tag(event)?;
        let mut inner = self.lock();
        if requeue {
            inner.requeue(tag);
        } else {
            inner.unacked.remove(&tag);
        }
        inner.nacked.push((event.clone(), requeue));
        Ok(())
    }
}
