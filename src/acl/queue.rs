//! Queues between a connection and the scheduler
//!
//! Each ACL connection owns one [`AclBidiQueue`]: an outbound queue of whole upper layer
//! payloads waiting for the scheduler, and an inbound queue of ACL fragments received from the
//! controller waiting for the upper layer. The two ends of the pair are what get handed around,
//! the [`AclQueueUpEnd`] goes up to the protocol layers and the [`AclQueueDownEnd`] goes to the
//! scheduler.
//!
//! A consumer never blocks on a queue. It registers a dequeue callback and gets a post on its
//! own handler whenever there is something to take, then takes it with `try_dequeue`. The
//! callback can be posted spuriously (the item may already be gone by the time it runs), so a
//! `None` from `try_dequeue` inside the callback is normal and not an error.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::hci::acl::AclPacket;
use crate::module::thread::Handler;

/// An upper layer ACL payload, as handed to a connection's queue
///
/// This is a whole message from the upper layer's point of view, not a fragment. The scheduler
/// is the only thing that turns these into fragments.
pub type Payload = Box<[u8]>;

struct DequeueRegistration {
    handler: Handler,
    callback: Arc<dyn Fn() + Send + Sync>,
}

impl DequeueRegistration {
    fn notify(&self) {
        let callback = self.callback.clone();

        self.handler.post(move || callback());
    }
}

struct QueueInner<T> {
    fifo: VecDeque<T>,
    dequeue_registration: Option<DequeueRegistration>,
}

/// A FIFO with a registered-consumer notification
pub struct PacketQueue<T> {
    inner: Mutex<QueueInner<T>>,
}

impl<T: Send> PacketQueue<T> {
    pub fn new() -> Self {
        PacketQueue {
            inner: Mutex::new(QueueInner {
                fifo: VecDeque::new(),
                dequeue_registration: None,
            }),
        }
    }

    pub fn enqueue(&self, item: T) {
        let mut inner = self.inner.lock().expect("PacketQueue poisoned");

        inner.fifo.push_back(item);

        if let Some(ref registration) = inner.dequeue_registration {
            registration.notify();
        }
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.inner.lock().expect("PacketQueue poisoned").fifo.pop_front()
    }

    /// Register the consumer side callback
    ///
    /// The callback is posted to `handler` once per enqueue while registered, and immediately if
    /// the queue is already non empty.
    ///
    /// # Panics
    /// A queue has one consumer. Registering while a callback is registered is a programming
    /// error.
    pub fn register_dequeue(&self, handler: &Handler, callback: Arc<dyn Fn() + Send + Sync>) {
        let mut inner = self.inner.lock().expect("PacketQueue poisoned");

        if inner.dequeue_registration.is_some() {
            panic!("A dequeue callback is already registered on this queue");
        }

        let registration = DequeueRegistration {
            handler: handler.clone(),
            callback: callback,
        };

        if !inner.fifo.is_empty() {
            registration.notify();
        }

        inner.dequeue_registration = Some(registration);
    }

    pub fn unregister_dequeue(&self) {
        self.inner.lock().expect("PacketQueue poisoned").dequeue_registration = None;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("PacketQueue poisoned").fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The queue pair of one ACL connection
pub struct AclBidiQueue {
    outbound: Arc<PacketQueue<Payload>>,
    inbound: Arc<PacketQueue<AclPacket>>,
}

impl AclBidiQueue {
    pub fn new() -> Self {
        AclBidiQueue {
            outbound: Arc::new(PacketQueue::new()),
            inbound: Arc::new(PacketQueue::new()),
        }
    }

    /// The end used by the protocol layers above the HCI
    pub fn up_end(&self) -> AclQueueUpEnd {
        AclQueueUpEnd {
            outbound: self.outbound.clone(),
            inbound: self.inbound.clone(),
        }
    }

    /// The end used by the scheduler and the HCI layer
    pub fn down_end(&self) -> AclQueueDownEnd {
        AclQueueDownEnd {
            outbound: self.outbound.clone(),
            inbound: self.inbound.clone(),
        }
    }
}

/// Upper layer view of a connection's queues
///
/// Payloads go down whole. Fragments come up exactly as the controller framed them, so a
/// reader of this end is expected to reassemble.
#[derive(Clone)]
pub struct AclQueueUpEnd {
    outbound: Arc<PacketQueue<Payload>>,
    inbound: Arc<PacketQueue<AclPacket>>,
}

impl AclQueueUpEnd {
    pub fn enqueue_payload(&self, payload: Payload) {
        self.outbound.enqueue(payload);
    }

    pub fn try_dequeue_fragment(&self) -> Option<AclPacket> {
        self.inbound.try_dequeue()
    }

    pub fn register_dequeue(&self, handler: &Handler, callback: Arc<dyn Fn() + Send + Sync>) {
        self.inbound.register_dequeue(handler, callback);
    }

    pub fn unregister_dequeue(&self) {
        self.inbound.unregister_dequeue();
    }
}

/// Scheduler side view of a connection's queues
#[derive(Clone)]
pub struct AclQueueDownEnd {
    outbound: Arc<PacketQueue<Payload>>,
    inbound: Arc<PacketQueue<AclPacket>>,
}

impl AclQueueDownEnd {
    pub fn try_dequeue_payload(&self) -> Option<Payload> {
        self.outbound.try_dequeue()
    }

    pub fn register_dequeue(&self, handler: &Handler, callback: Arc<dyn Fn() + Send + Sync>) {
        self.outbound.register_dequeue(handler, callback);
    }

    pub fn unregister_dequeue(&self) {
        self.outbound.unregister_dequeue();
    }

    pub fn enqueue_fragment(&self, fragment: AclPacket) {
        self.inbound.enqueue(fragment);
    }

    pub fn pending_payloads(&self) -> usize {
        self.outbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::thread::Thread;
    use std::sync::mpsc::channel;

    #[test]
    fn dequeue_callback_fires_per_enqueue() {
        let thread = Thread::new("test");
        let handler = thread.new_handler();

        let queue = Arc::new(PacketQueue::<u32>::new());

        let (tx, rx) = channel();

        let queue_for_callback = queue.clone();

        queue.register_dequeue(&handler, Arc::new(move || {
            if let Some(item) = queue_for_callback.try_dequeue() {
                tx.send(item).unwrap();
            }
        }));

        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);

        assert_eq!( rx.iter().take(3).collect::<Vec<_>>(), [1, 2, 3] );
    }

    #[test]
    fn registration_on_non_empty_queue_notifies() {
        let thread = Thread::new("test");
        let handler = thread.new_handler();

        let queue = Arc::new(PacketQueue::<u32>::new());

        queue.enqueue(7);

        let (tx, rx) = channel();

        let queue_for_callback = queue.clone();

        queue.register_dequeue(&handler, Arc::new(move || {
            tx.send(queue_for_callback.try_dequeue()).unwrap();
        }));

        assert_eq!( rx.recv().unwrap(), Some(7) );
    }

    #[test]
    #[should_panic]
    fn double_registration_panics() {
        let thread = Thread::new("test");
        let handler = thread.new_handler();

        let queue = PacketQueue::<u32>::new();

        queue.register_dequeue(&handler, Arc::new(|| {}));
        queue.register_dequeue(&handler, Arc::new(|| {}));
    }

    #[test]
    fn unregister_stops_notifications() {
        let thread = Thread::new("test");
        let handler = thread.new_handler();

        let queue = Arc::new(PacketQueue::<u32>::new());

        let (tx, rx) = channel();

        queue.register_dequeue(&handler, Arc::new(move || { tx.send(()).unwrap(); }));

        queue.unregister_dequeue();

        queue.enqueue(1);

        // barrier so the worker has definitely processed anything that was posted
        let (barrier_tx, barrier_rx) = channel();

        handler.post(move || { barrier_tx.send(()).unwrap(); });

        barrier_rx.recv().unwrap();

        assert!( rx.try_recv().is_err() );
        assert_eq!( queue.len(), 1 );
    }

    #[test]
    fn bidi_ends_are_wired_straight() {
        use crate::hci::acl::{AclPacket, BoundaryFlag, BroadcastFlag, ConnectionHandle};

        let bidi = AclBidiQueue::new();

        let up = bidi.up_end();
        let down = bidi.down_end();

        up.enqueue_payload( Box::from(&[1u8, 2, 3][..]) );

        assert_eq!( down.try_dequeue_payload().as_deref(), Some(&[1u8, 2, 3][..]) );

        down.enqueue_fragment( AclPacket::new(
            ConnectionHandle::try_from(0x40).unwrap(),
            BoundaryFlag::FirstAutomaticallyFlushable,
            BroadcastFlag::PointToPoint,
            Box::from(&[9u8][..]),
        ));

        assert_eq!( up.try_dequeue_fragment().unwrap().get_payload(), &[9] );
    }
}
