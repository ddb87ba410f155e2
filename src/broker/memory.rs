use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tracing::*;
use uuid::Uuid;

use super::{Acker, BrokerError, Deliveries, Delivery, Message, Transport};

#[derive(Clone)]
struct MemoryQueue {
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    in_flight: Arc<AtomicUsize>,
}

impl MemoryQueue {
    fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        MemoryQueue {
            sender,
            receiver,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// In-process broker. Clones share the same queues; every client opens its
/// own [`MemoryConnection`].
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<String, MemoryQueue>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            broker: self.clone(),
            closed: AtomicBool::new(false),
            exclusive: Mutex::new(Vec::new()),
        }
    }

    /// Messages waiting in a queue, not counting unacknowledged deliveries.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.queue(name).map(|queue| queue.receiver.len())
    }

    /// Deliveries handed to a consumer and not yet acknowledged.
    pub fn in_flight(&self, name: &str) -> Option<usize> {
        self.queue(name)
            .map(|queue| queue.in_flight.load(Ordering::SeqCst))
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues().contains_key(name)
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, MemoryQueue>> {
        // A poisoned map is still consistent: every mutation is a single insert or remove.
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue(&self, name: &str) -> Option<MemoryQueue> {
        self.queues().get(name).cloned()
    }

    fn declare(&self, name: &str) {
        self.queues()
            .entry(name.to_owned())
            .or_insert_with(MemoryQueue::new);
    }

    fn delete(&self, name: &str) {
        if let Some(queue) = self.queues().remove(name) {
            queue.receiver.close();
        }
    }
}

/// Unacked deliveries held by one consumer, capped at its prefetch count.
struct Window {
    prefetch: usize,
    held: AtomicUsize,
    released: Notify,
}

impl Window {
    fn new(prefetch: u16) -> Self {
        Window {
            prefetch: usize::from(prefetch),
            held: AtomicUsize::new(0),
            released: Notify::new(),
        }
    }

    /// Waits until the consumer may take another delivery. A prefetch of 0
    /// means no limit.
    async fn acquire(&self) {
        while self.prefetch != 0 && self.held.load(Ordering::SeqCst) >= self.prefetch {
            self.released.notified().await;
        }
        self.held.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.held.fetch_sub(1, Ordering::SeqCst);
        self.released.notify_one();
    }
}

/// Unacknowledged work delivery. Dropping it without [`Unacked::ack`] puts
/// the message back on its queue, as a broker does when a consumer dies.
pub(crate) struct Unacked {
    message: Option<Message>,
    requeue: Sender<Message>,
    in_flight: Arc<AtomicUsize>,
    window: Arc<Window>,
}

impl Unacked {
    pub(crate) fn ack(mut self) {
        self.message = None;
    }
}

impl Drop for Unacked {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.window.release();
        if let Some(message) = self.message.take() {
            debug!(correlation_id = ?message.correlation_id, "Requeueing unacknowledged message");
            let _ = self.requeue.try_send(message);
        }
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    closed: AtomicBool,
    exclusive: Mutex<Vec<String>>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn exclusive(&self) -> MutexGuard<'_, Vec<String>> {
        self.exclusive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn existing(&self, queue: &str) -> Result<MemoryQueue, BrokerError> {
        self.broker
            .queue(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_owned()))
    }
}

#[async_trait]
impl Transport for MemoryConnection {
    async fn declare_work_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.declare(name);
        Ok(())
    }

    async fn declare_reply_queue(&self) -> Result<String, BrokerError> {
        self.ensure_open()?;
        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        self.broker.declare(&name);
        self.exclusive().push(name.clone());
        Ok(name)
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<(), BrokerError> {
        self.ensure_open()?;
        match self.broker.queue(queue) {
            Some(target) => {
                let _ = target.sender.try_send(message);
            }
            None => debug!(queue, "Dropping unroutable message"),
        }
        Ok(())
    }

    async fn consume_work(&self, queue: &str, prefetch: u16) -> Result<Deliveries, BrokerError> {
        self.ensure_open()?;
        let queue = self.existing(queue)?;
        let window = Arc::new(Window::new(prefetch));

        // A full window leaves further messages on the queue for other consumers.
        Ok(futures::stream::unfold((queue, window), |(queue, window)| async move {
            window.acquire().await;
            let message = match queue.receiver.recv().await {
                Ok(message) => message,
                Err(_) => {
                    window.release();
                    return None;
                }
            };
            queue.in_flight.fetch_add(1, Ordering::SeqCst);
            let unacked = Unacked {
                message: Some(message.clone()),
                requeue: queue.sender.clone(),
                in_flight: queue.in_flight.clone(),
                window: window.clone(),
            };
            Some((Ok(Delivery::new(message, Acker::Memory(unacked))), (queue, window)))
        })
        .boxed())
    }

    async fn consume_replies(&self, queue: &str) -> Result<Deliveries, BrokerError> {
        self.ensure_open()?;
        let receiver = self.existing(queue)?.receiver;

        Ok(futures::stream::unfold(receiver, |receiver| async move {
            let message = receiver.recv().await.ok()?;
            Some((Ok(Delivery::new(message, Acker::Auto)), receiver))
        })
        .boxed())
    }

    async fn release_reply_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.exclusive().retain(|name| name != queue);
        self.broker.delete(queue);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let exclusive = std::mem::take(&mut *self.exclusive());
        for queue in exclusive {
            self.broker.delete(&queue);
        }
        Ok(())
    }
}
