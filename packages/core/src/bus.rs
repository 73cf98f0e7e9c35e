//! Topic publish/subscribe.
//!
//! Two kinds of consumers:
//!
//! - **Push listeners** registered with [`TopicEventBus::on`] are invoked
//!   synchronously by `emit`, in registration order for a topic.
//! - **Pull subscribers** created with [`TopicEventBus::subscribe`] receive
//!   events into a private capped queue and read them with a blocking
//!   [`Subscriber::next`].
//!
//! `emit` never blocks on a pull subscriber. When a subscriber's queue is
//! full the oldest queued event is dropped and the drop is logged.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, ThreadId};

use crate::deadline::Deadline;
use crate::sync::lock;
use crate::value::Value;

/// Callback type for push listeners.
pub type ListenerFn = dyn Fn(&Value) + Send + Sync;

/// Counts from one `emit`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Push listeners invoked.
    pub listeners: usize,
    /// Pull subscribers that received the event.
    pub subscribers: usize,
    /// Older events discarded to make room.
    pub dropped: usize,
}

#[derive(Default)]
struct ListenerState {
    active: bool,
    delivering: Vec<ThreadId>,
}

struct Listener {
    id: u64,
    topic: String,
    callback: Arc<ListenerFn>,
    state: Mutex<ListenerState>,
    idle: Condvar,
}

impl Listener {
    /// Invoke the callback unless cancelled. Returns whether it ran.
    fn deliver(&self, data: &Value) -> bool {
        {
            let mut state = lock(&self.state);
            if !state.active {
                return false;
            }
            state.delivering.push(thread::current().id());
        }

        (self.callback)(data);

        let mut state = lock(&self.state);
        let me = thread::current().id();
        if let Some(pos) = state.delivering.iter().position(|id| *id == me) {
            state.delivering.swap_remove(pos);
        }
        drop(state);
        self.idle.notify_all();
        true
    }

    /// Deactivate and wait for deliveries running on other threads.
    fn deactivate(&self) {
        let me = thread::current().id();
        let mut state = lock(&self.state);
        state.active = false;
        while state.delivering.iter().any(|id| *id != me) {
            state = self
                .idle
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

struct SubscriberQueue {
    events: VecDeque<Value>,
    closed: bool,
    dropped: u64,
}

struct SubscriberShared {
    id: u64,
    topics: BTreeSet<String>,
    capacity: usize,
    queue: Mutex<SubscriberQueue>,
    ready: Condvar,
}

impl SubscriberShared {
    /// Enqueue without blocking. Returns (delivered, dropped_one).
    fn offer(&self, data: &Value) -> (bool, bool) {
        let mut queue = lock(&self.queue);
        if queue.closed {
            return (false, false);
        }
        let mut dropped = false;
        if queue.events.len() >= self.capacity {
            queue.events.pop_front();
            queue.dropped += 1;
            dropped = true;
        }
        queue.events.push_back(data.clone());
        drop(queue);
        self.ready.notify_one();
        (true, dropped)
    }
}

#[derive(Default)]
struct Registrations {
    listeners: HashMap<String, Vec<Arc<Listener>>>,
    subscribers: Vec<Weak<SubscriberShared>>,
}

impl Registrations {
    /// Forget subscribers whose handles are all gone.
    fn prune_subscribers(&mut self) {
        self.subscribers.retain(|weak| weak.strong_count() > 0);
    }
}

/// Publish/subscribe registry shared by every caller of one bus name.
pub struct TopicEventBus {
    subscriber_capacity: usize,
    next_id: AtomicU64,
    registrations: Mutex<Registrations>,
}

impl std::fmt::Debug for TopicEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicEventBus")
            .field("subscriber_capacity", &self.subscriber_capacity)
            .finish_non_exhaustive()
    }
}

impl TopicEventBus {
    /// Create a bus whose pull subscribers buffer at most
    /// `subscriber_capacity` events each (minimum 1).
    pub fn new(subscriber_capacity: usize) -> Self {
        Self {
            subscriber_capacity: subscriber_capacity.max(1),
            next_id: AtomicU64::new(1),
            registrations: Mutex::new(Registrations::default()),
        }
    }

    pub fn subscriber_capacity(&self) -> usize {
        self.subscriber_capacity
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish `data` on `topic`.
    ///
    /// Listener callbacks run on the calling thread after the registration
    /// lock is released, so a callback may itself emit, subscribe or cancel.
    pub fn emit(&self, topic: &str, data: Value) -> Delivery {
        let (listeners, subscribers) = {
            let mut regs = lock(&self.registrations);
            regs.prune_subscribers();
            let listeners = regs.listeners.get(topic).cloned().unwrap_or_default();
            let subscribers: Vec<Arc<SubscriberShared>> = regs
                .subscribers
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|sub| sub.topics.contains(topic))
                .collect();
            (listeners, subscribers)
        };

        let mut delivery = Delivery::default();
        for sub in &subscribers {
            let (delivered, dropped) = sub.offer(&data);
            if delivered {
                delivery.subscribers += 1;
            }
            if dropped {
                delivery.dropped += 1;
                tracing::warn!(
                    topic,
                    subscriber = sub.id,
                    capacity = self.subscriber_capacity,
                    "subscriber queue full, dropped oldest event"
                );
            }
        }
        for listener in &listeners {
            if listener.deliver(&data) {
                delivery.listeners += 1;
            }
        }
        delivery
    }

    /// Create a pull subscriber for `topics`.
    pub fn subscribe<I, S>(&self, topics: I) -> Subscriber
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let shared = Arc::new(SubscriberShared {
            id: self.next_id(),
            topics: topics.into_iter().map(Into::into).collect(),
            capacity: self.subscriber_capacity,
            queue: Mutex::new(SubscriberQueue {
                events: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            ready: Condvar::new(),
        });
        let mut regs = lock(&self.registrations);
        regs.prune_subscribers();
        regs.subscribers.push(Arc::downgrade(&shared));
        Subscriber { shared }
    }

    /// Register a push listener on `topic`.
    pub fn on<F>(self: &Arc<Self>, topic: impl Into<String>, callback: F) -> ListenerHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let listener = Arc::new(Listener {
            id: self.next_id(),
            topic: topic.clone(),
            callback: Arc::new(callback),
            state: Mutex::new(ListenerState {
                active: true,
                delivering: Vec::new(),
            }),
            idle: Condvar::new(),
        });
        lock(&self.registrations)
            .listeners
            .entry(topic)
            .or_default()
            .push(Arc::clone(&listener));
        ListenerHandle {
            bus: Arc::downgrade(self),
            listener,
        }
    }

    /// Number of live push listeners on `topic`.
    pub fn listener_count(&self, topic: &str) -> usize {
        lock(&self.registrations)
            .listeners
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Number of open pull subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.registrations)
            .subscribers
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|sub| !lock(&sub.queue).closed)
            .count()
    }

    fn unregister(&self, listener: &Listener) {
        let mut regs = lock(&self.registrations);
        if let Some(list) = regs.listeners.get_mut(&listener.topic) {
            list.retain(|l| l.id != listener.id);
            if list.is_empty() {
                regs.listeners.remove(&listener.topic);
            }
        }
    }
}

/// Pull-style consumer of one or more topics.
///
/// Clones share the same queue, so one thread can [`close`](Self::close)
/// a subscriber another thread is blocked on.
#[derive(Clone)]
pub struct Subscriber {
    shared: Arc<SubscriberShared>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.shared.id)
            .field("topics", &self.shared.topics)
            .finish()
    }
}

impl Subscriber {
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.shared.topics.iter().map(String::as_str)
    }

    /// Block until an event arrives. `None` once the subscriber is closed.
    pub fn next(&self) -> Option<Value> {
        self.next_until(&Deadline::never())
    }

    /// Block until an event arrives, the subscriber closes, or `deadline`.
    pub fn next_until(&self, deadline: &Deadline) -> Option<Value> {
        let (mut queue, ready) = deadline.wait_while(
            &self.shared.ready,
            lock(&self.shared.queue),
            |queue| queue.events.is_empty() && !queue.closed,
        );
        if !ready {
            return None;
        }
        queue.events.pop_front()
    }

    pub fn try_next(&self) -> Option<Value> {
        lock(&self.shared.queue).events.pop_front()
    }

    /// Stop receiving events and wake any blocked `next`.
    ///
    /// Events already queued are discarded. Idempotent.
    pub fn close(&self) {
        let mut queue = lock(&self.shared.queue);
        queue.closed = true;
        queue.events.clear();
        drop(queue);
        self.shared.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.queue).closed
    }

    /// Events discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        lock(&self.shared.queue).dropped
    }

    pub fn pending(&self) -> usize {
        lock(&self.shared.queue).events.len()
    }
}

/// Cancels a push listener.
pub struct ListenerHandle {
    bus: Weak<TopicEventBus>,
    listener: Arc<Listener>,
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.listener.id)
            .field("topic", &self.listener.topic)
            .finish()
    }
}

impl ListenerHandle {
    pub fn topic(&self) -> &str {
        &self.listener.topic
    }

    /// Stop deliveries to this listener.
    ///
    /// Once this returns no further call reaches the callback. A delivery
    /// running on another thread is allowed to finish first. Idempotent.
    pub fn cancel(&self) {
        self.listener.deactivate();
        if let Some(bus) = self.bus.upgrade() {
            bus.unregister(&self.listener);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        !lock(&self.listener.state).active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn recorder(bus: &Arc<TopicEventBus>, topic: &str) -> (ListenerHandle, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = bus.on(topic, move |v| sink.lock().unwrap().push(v.clone()));
        (handle, seen)
    }

    #[test]
    fn emit_reaches_listeners_and_subscribers() {
        let bus = Arc::new(TopicEventBus::new(16));
        let (_h, seen) = recorder(&bus, "t");
        let sub = bus.subscribe(["t", "other"]);
        let unrelated = bus.subscribe(["x"]);

        let delivery = bus.emit("t", Value::from("d"));
        assert_eq!(delivery.listeners, 1);
        assert_eq!(delivery.subscribers, 1);
        assert_eq!(*seen.lock().unwrap(), vec![Value::from("d")]);
        assert_eq!(sub.try_next(), Some(Value::from("d")));
        assert_eq!(unrelated.try_next(), None);
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = Arc::new(TopicEventBus::new(4));
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                bus.on("t", move |_| order.lock().unwrap().push(i))
            })
            .collect();
        bus.emit("t", Value::Null);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(handles.len(), 3);
    }

    #[test]
    fn cancelled_listener_receives_nothing() {
        let bus = Arc::new(TopicEventBus::new(4));
        let (handle, seen) = recorder(&bus, "t");
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(bus.emit("t", Value::from(1i64)).listeners, 0);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bus.listener_count("t"), 0);
        handle.cancel();
    }

    #[test]
    fn listener_may_cancel_itself() {
        let bus = Arc::new(TopicEventBus::new(4));
        let slot: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = {
            let slot = Arc::clone(&slot);
            let calls = Arc::clone(&calls);
            bus.on("t", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(h) = slot.lock().unwrap().as_ref() {
                    h.cancel();
                }
            })
        };
        *slot.lock().unwrap() = Some(handle);

        bus.emit("t", Value::Null);
        bus.emit("t", Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_waits_for_in_flight_delivery() {
        let bus = Arc::new(TopicEventBus::new(4));
        let (entered_tx, entered_rx) = mpsc::channel();
        let finished = Arc::new(AtomicUsize::new(0));
        let handle = {
            let finished = Arc::clone(&finished);
            bus.on("t", move |_| {
                entered_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(50));
                finished.fetch_add(1, Ordering::SeqCst);
            })
        };

        let emitter = {
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || bus.emit("t", Value::Null))
        };
        entered_rx.recv().unwrap();
        handle.cancel();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        emitter.join().unwrap();
        assert_eq!(bus.emit("t", Value::Null).listeners, 0);
    }

    #[test]
    fn full_subscriber_drops_oldest() {
        let bus = TopicEventBus::new(2);
        let sub = bus.subscribe(["t"]);
        bus.emit("t", Value::from(1i64));
        bus.emit("t", Value::from(2i64));
        let delivery = bus.emit("t", Value::from(3i64));
        assert_eq!(delivery.dropped, 1);
        assert_eq!(sub.dropped(), 1);
        assert_eq!(sub.try_next(), Some(Value::from(2i64)));
        assert_eq!(sub.try_next(), Some(Value::from(3i64)));
    }

    #[test]
    fn next_blocks_until_emit() {
        let bus = Arc::new(TopicEventBus::new(4));
        let sub = bus.subscribe(["t"]);
        let reader = std::thread::spawn(move || sub.next());
        std::thread::sleep(Duration::from_millis(30));
        bus.emit("t", Value::from("late"));
        assert_eq!(reader.join().unwrap(), Some(Value::from("late")));
    }

    #[test]
    fn close_unblocks_next() {
        let bus = TopicEventBus::new(4);
        let sub = bus.subscribe(["t"]);
        let closer = sub.clone();
        let reader = std::thread::spawn(move || sub.next());
        std::thread::sleep(Duration::from_millis(30));
        closer.close();
        assert_eq!(reader.join().unwrap(), None);
        assert!(closer.is_closed());
        assert_eq!(bus.emit("t", Value::Null).subscribers, 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn next_until_respects_deadline() {
        let bus = TopicEventBus::new(4);
        let sub = bus.subscribe(["t"]);
        let start = Instant::now();
        assert_eq!(sub.next_until(&Deadline::from_timeout_ms(40)), None);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let bus = TopicEventBus::new(4);
        let sub = bus.subscribe(["t"]);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.emit("t", Value::Null).subscribers, 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn subscribe_without_emit_stays_bounded() {
        let bus = TopicEventBus::new(4);
        for _ in 0..1000 {
            drop(bus.subscribe(["quiet"]));
        }
        let _kept = bus.subscribe(["quiet"]);
        assert_eq!(lock(&bus.registrations).subscribers.len(), 1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn listener_may_emit_reentrantly() {
        let bus = Arc::new(TopicEventBus::new(4));
        let (_h, seen) = recorder(&bus, "b");
        let relay = {
            let bus2 = Arc::downgrade(&bus);
            bus.on("a", move |v| {
                if let Some(bus) = bus2.upgrade() {
                    bus.emit("b", v.clone());
                }
            })
        };
        bus.emit("a", Value::from("hop"));
        assert_eq!(*seen.lock().unwrap(), vec![Value::from("hop")]);
        relay.cancel();
    }
}
