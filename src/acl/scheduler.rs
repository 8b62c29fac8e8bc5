//! Round robin scheduling of outbound ACL data
//!
//! The controller has a fixed number of outbound ACL buffers, reported once at startup, and the
//! host must never have more packets in flight than that. The scheduler owns the two credit
//! pools (classic and LE), pulls whole payloads from the registered connections one at a time,
//! fragments each payload to the controller's buffer size, and feeds the fragments to the HCI
//! layer while credits last.
//!
//! Fairness works by rotation. A registration pass offers a dequeue to every idle connection
//! starting from a cursor, and the cursor moves one slot per pass, so no connection can claim
//! more than one payload before every other connection has had its chance. Once one payload is
//! taken its fragments are sent contiguously before any other payload is considered, which is
//! what keeps fragments of different payloads from interleaving on the wire.
//!
//! Credits come back through `Number Of Completed Packets`, routed here by the controller
//! component. A connection that disconnects has its in flight credits reclaimed immediately and
//! later completions for it are dropped, since the controller stops reporting for a handle once
//! the disconnection completes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::controller::{Controller, ControllerCapabilities};
use crate::hci::acl::{fragment_payload, AclPacket, ConnectionHandle};
use crate::hci::HciLayer;
use crate::module::thread::Handler;
use crate::module::{Module, ModuleContext, ModuleDescriptor};

use super::queue::AclQueueDownEnd;

/// Which transport a connection rides on
///
/// The two kinds have independent buffer geometry and independent credit accounting.
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum ConnectionKind {
    Classic,
    LowEnergy,
}

/// The buffer geometry the scheduler runs with
///
/// Derived from the controller capabilities. A controller reporting zero LE buffers multiplexes
/// LE data onto its classic buffers, in which case the LE side here is left empty and the
/// classic pool covers both kinds.
#[derive(Debug,Clone,Copy)]
pub struct BufferSettings {
    pub classic_mtu: usize,
    pub classic_credits: u16,
    pub le_mtu: usize,
    pub le_credits: u16,
}

impl BufferSettings {
    pub fn from_capabilities( capabilities: &ControllerCapabilities ) -> Self {
        BufferSettings {
            classic_mtu: capabilities.get_acl_buffer_length() as usize,
            classic_credits: capabilities.get_acl_buffer_count(),
            le_mtu: capabilities.get_le_buffer_length() as usize,
            le_credits: capabilities.get_le_buffer_count(),
        }
    }
}

struct CreditPool {
    available: u16,
    maximum: u16,
}

impl CreditPool {
    fn new( maximum: u16 ) -> Self {
        CreditPool {
            available: maximum,
            maximum: maximum,
        }
    }

    fn take_one(&mut self) {
        assert!( self.available > 0, "ACL credit underflow, a fragment was sent without a credit" );

        self.available -= 1;
    }

    fn give(&mut self, count: u16) {
        self.available += count;

        assert!(
            self.available <= self.maximum,
            "ACL credit pool exceeded its maximum of {}",
            self.maximum
        );
    }

    fn is_exhausted(&self) -> bool {
        self.available == 0
    }
}

struct ScheduledConnection {
    handle: ConnectionHandle,
    kind: ConnectionKind,
    queue: AclQueueDownEnd,
    dequeue_registered: bool,
    /// Fragments sent to the controller and not yet reported completed
    outstanding_fragments: u16,
    disconnected: bool,
}

struct SchedulerInner {
    connections: BTreeMap<u16, ScheduledConnection>,
    classic_pool: CreditPool,
    le_pool: Option<CreditPool>,
    classic_mtu: usize,
    le_mtu: usize,
    fragments: VecDeque<(ConnectionKind, AclPacket)>,
    starting_point: usize,
    enqueue_registered: bool,
}

impl SchedulerInner {
    fn pool_mut(&mut self, kind: ConnectionKind) -> &mut CreditPool {
        match kind {
            ConnectionKind::Classic => &mut self.classic_pool,
            ConnectionKind::LowEnergy => match self.le_pool {
                Some(ref mut pool) => pool,
                None => &mut self.classic_pool,
            },
        }
    }

    fn mtu_for(&self, kind: ConnectionKind) -> usize {
        match kind {
            ConnectionKind::Classic => self.classic_mtu,
            ConnectionKind::LowEnergy => self.le_mtu,
        }
    }

    fn any_credits(&mut self) -> bool {
        !self.pool_mut(ConnectionKind::Classic).is_exhausted()
            || !self.pool_mut(ConnectionKind::LowEnergy).is_exhausted()
    }
}

/// The round robin ACL scheduler
///
/// All state lives behind one lock and every deferred step runs on the scheduler's handler, so
/// the phases below never race each other.
pub struct RoundRobinScheduler {
    handler: Handler,
    hci: Arc<HciLayer>,
    weak_self: std::sync::Weak<RoundRobinScheduler>,
    inner: Mutex<SchedulerInner>,
}

impl RoundRobinScheduler {
    pub fn new( handler: Handler, hci: Arc<HciLayer>, settings: BufferSettings ) -> Arc<Self> {
        let le_shares_classic = settings.le_credits == 0;

        Arc::new_cyclic(|weak| RoundRobinScheduler {
            handler: handler,
            hci: hci,
            weak_self: weak.clone(),
            inner: Mutex::new( SchedulerInner {
                connections: BTreeMap::new(),
                classic_pool: CreditPool::new(settings.classic_credits),
                le_pool: if le_shares_classic {
                    None
                } else {
                    Some( CreditPool::new(settings.le_credits) )
                },
                classic_mtu: settings.classic_mtu,
                le_mtu: if le_shares_classic { settings.classic_mtu } else { settings.le_mtu },
                fragments: VecDeque::new(),
                starting_point: 0,
                enqueue_registered: false,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerInner> {
        self.inner.lock().expect("Scheduler state poisoned")
    }

    /// Add a connection and kick the scheduler if it was idle
    ///
    /// # Panics
    /// The handle must not already be registered.
    pub fn register(
        &self,
        kind: ConnectionKind,
        handle: ConnectionHandle,
        queue: AclQueueDownEnd,
    ) {
        {
            let mut inner = self.lock();

            let raw = handle.get_raw_handle();

            if inner.connections.contains_key(&raw) {
                panic!("Connection handle {} registered twice with the scheduler", handle);
            }

            inner.connections.insert(raw, ScheduledConnection {
                handle: handle,
                kind: kind,
                queue: queue,
                dequeue_registered: false,
                outstanding_fragments: 0,
                disconnected: false,
            });
        }

        self.schedule_round_robin();
    }

    /// Remove a connection
    ///
    /// Any fragments the connection still has in flight (a disconnected handle can have drained
    /// fragments after its reclaim) give their credits back here, and the rotation cursor goes
    /// back to the start of the map.
    ///
    /// # Panics
    /// The handle must be registered.
    pub fn unregister( &self, handle: ConnectionHandle ) {
        let resume = {
            let mut inner = self.lock();

            let raw = handle.get_raw_handle();

            let connection = match inner.connections.remove(&raw) {
                Some(connection) => connection,
                None => panic!("Unregister of unknown connection handle {}", handle),
            };

            if connection.dequeue_registered {
                connection.queue.unregister_dequeue();
            }

            // fragments never sent never spent a credit, and their connection is gone
            inner.fragments.retain(|(_, fragment)| fragment.get_handle() != handle);

            inner.starting_point = 0;

            if connection.outstanding_fragments > 0 {
                let pool = inner.pool_mut(connection.kind);

                let was_exhausted = pool.is_exhausted();

                pool.give(connection.outstanding_fragments);

                was_exhausted
            } else {
                false
            }
        };

        if resume {
            self.schedule_round_robin();
        }
    }

    /// Mark a connection disconnected and reclaim its in flight credits
    ///
    /// The controller stops reporting completions for a handle once its disconnection
    /// completes, so waiting for the reports would leak the credits. They come back here
    /// instead, and any report that does still arrive for the handle is dropped.
    ///
    /// # Panics
    /// The handle must be registered.
    pub fn set_disconnect( &self, handle: ConnectionHandle ) {
        let resume = {
            let mut inner = self.lock();

            let raw = handle.get_raw_handle();

            let (kind, reclaimed) = {
                let connection = match inner.connections.get_mut(&raw) {
                    Some(connection) => connection,
                    None => panic!("SetDisconnect on unknown connection handle {}", handle),
                };

                if connection.disconnected {
                    return;
                }

                connection.disconnected = true;

                if connection.dequeue_registered {
                    connection.queue.unregister_dequeue();
                    connection.dequeue_registered = false;
                }

                let reclaimed = connection.outstanding_fragments;

                connection.outstanding_fragments = 0;

                (connection.kind, reclaimed)
            };

            if reclaimed > 0 {
                let pool = inner.pool_mut(kind);

                let was_exhausted = pool.is_exhausted();

                pool.give(reclaimed);

                was_exhausted
            } else {
                false
            }
        };

        if resume {
            self.schedule_round_robin();
        }
    }

    /// Credit return from a `Number Of Completed Packets` report
    ///
    /// Reports for unknown handles are dropped with a warning, reports for disconnected handles
    /// are dropped quietly since their credits were already reclaimed.
    pub fn incoming_acl_credits( &self, handle: ConnectionHandle, credits: u16 ) {
        if credits == 0 {
            return;
        }

        let resume = {
            let mut inner = self.lock();

            let raw = handle.get_raw_handle();

            let (kind, returned) = {
                let connection = match inner.connections.get_mut(&raw) {
                    Some(connection) => connection,
                    None => {
                        log::warn!(
                            "Dropping {} completed packets for unknown connection handle {}",
                            credits,
                            handle
                        );
                        return;
                    }
                };

                if connection.disconnected {
                    log::debug!(
                        "Dropping {} completed packets for disconnected handle {}, their \
                        credits were reclaimed at disconnect",
                        credits,
                        handle
                    );
                    return;
                }

                let returned = if credits > connection.outstanding_fragments {
                    log::error!(
                        "The controller returned {} credits for handle {} with only {} \
                        fragments outstanding",
                        credits,
                        handle,
                        connection.outstanding_fragments
                    );

                    connection.outstanding_fragments
                } else {
                    credits
                };

                connection.outstanding_fragments -= returned;

                (connection.kind, returned)
            };

            if returned > 0 {
                let pool = inner.pool_mut(kind);

                let was_exhausted = pool.is_exhausted();

                pool.give(returned);

                was_exhausted
            } else {
                false
            }
        };

        if resume {
            self.schedule_round_robin();
        }
    }

    /// Drop every connection and queued fragment
    pub fn shutdown(&self) {
        let mut inner = self.lock();

        for (_, connection) in inner.connections.iter() {
            if connection.dequeue_registered {
                connection.queue.unregister_dequeue();
            }
        }

        inner.connections.clear();
        inner.fragments.clear();
        inner.enqueue_registered = false;
    }

    fn schedule_round_robin( &self ) {
        let weak = self.weak_self.clone();

        self.handler.post(move || {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.round_robin();
            }
        });
    }

    /// The registration phase
    ///
    /// Offers a dequeue to every idle connection, starting at the rotation cursor, and moves
    /// the cursor one slot. Skipped entirely while fragments wait or while both pools are dry.
    fn round_robin( &self ) {
        let mut inner = self.lock();

        if inner.enqueue_registered {
            return;
        }

        if !inner.fragments.is_empty() {
            self.ensure_enqueue(&mut inner);
            return;
        }

        if !inner.any_credits() {
            return;
        }

        let handles = inner.connections.keys().cloned().collect::<Vec<_>>();

        if handles.is_empty() {
            return;
        }

        let count = handles.len();

        let start = inner.starting_point % count;

        let mut registered_any = false;

        for offset in 0..count {
            let raw = handles[(start + offset) % count];

            let weak = self.weak_self.clone();

            let connection = inner.connections.get_mut(&raw).unwrap();

            if connection.disconnected || connection.dequeue_registered {
                continue;
            }

            connection.dequeue_registered = true;

            connection.queue.register_dequeue(
                &self.handler,
                Arc::new(move || {
                    if let Some(scheduler) = weak.upgrade() {
                        scheduler.on_payload_ready(raw);
                    }
                }),
            );

            registered_any = true;
        }

        if registered_any {
            inner.starting_point = (start + 1) % count;
        }
    }

    /// The buffering phase, one connection delivered a payload
    ///
    /// Fragments the payload, parks the pieces in the fragment FIFO, pulls the dequeue offer
    /// from every connection so nothing else can slip a payload in between the pieces, and
    /// moves on to emitting.
    fn on_payload_ready( &self, raw_handle: u16 ) {
        let mut inner = self.lock();

        let (kind, handle, payload) = {
            let connection = match inner.connections.get_mut(&raw_handle) {
                Some(connection) => connection,
                None => return,
            };

            if !connection.dequeue_registered || connection.disconnected {
                return;
            }

            let payload = match connection.queue.try_dequeue_payload() {
                Some(payload) => payload,
                None => return,
            };

            (connection.kind, connection.handle, payload)
        };

        let mtu = inner.mtu_for(kind);

        for fragment in fragment_payload(handle, &payload, mtu) {
            inner.fragments.push_back( (kind, fragment) );
        }

        for (_, connection) in inner.connections.iter_mut() {
            if connection.dequeue_registered {
                connection.queue.unregister_dequeue();
                connection.dequeue_registered = false;
            }
        }

        self.ensure_enqueue(&mut inner);
    }

    /// Enter the emit phase if there is anything to emit and a credit to spend on it
    fn ensure_enqueue( &self, inner: &mut SchedulerInner ) {
        if inner.enqueue_registered || inner.fragments.is_empty() {
            return;
        }

        let front_kind = inner.fragments.front().unwrap().0;

        if inner.pool_mut(front_kind).is_exhausted() {
            // parked until incoming_acl_credits refills the pool
            return;
        }

        inner.enqueue_registered = true;

        let weak = self.weak_self.clone();

        self.hci.register_acl_enqueue( Box::new(move || {
            weak.upgrade().and_then(|scheduler| scheduler.next_fragment())
        }));
    }

    /// The emit phase, one pull from the HCI layer
    ///
    /// Spends a credit and hands over the front fragment. Reports `None` (detaching the HCI
    /// pull loop) when the FIFO runs dry or the next fragment's pool does.
    fn next_fragment( &self ) -> Option<AclPacket> {
        let mut inner = self.lock();

        if !inner.enqueue_registered {
            return None;
        }

        let front_kind = match inner.fragments.front() {
            Some((kind, _)) => *kind,
            None => {
                inner.enqueue_registered = false;
                self.schedule_round_robin();
                return None;
            }
        };

        if inner.pool_mut(front_kind).is_exhausted() {
            inner.enqueue_registered = false;
            return None;
        }

        inner.pool_mut(front_kind).take_one();

        let (_, fragment) = inner.fragments.pop_front().unwrap();

        if let Some(connection) = inner.connections.get_mut(&fragment.get_handle().get_raw_handle()) {
            connection.outstanding_fragments += 1;
        }
        else {
            log::debug!(
                "Sending a leftover fragment for unregistered handle {}",
                fragment.get_handle()
            );
        }

        if inner.fragments.is_empty() {
            inner.enqueue_registered = false;
            self.schedule_round_robin();
        }

        Some(fragment)
    }

    #[cfg(test)]
    pub(crate) fn classic_credits_available(&self) -> u16 {
        self.lock().classic_pool.available
    }

    #[cfg(test)]
    pub(crate) fn le_credits_available(&self) -> Option<u16> {
        self.lock().le_pool.as_ref().map(|pool| pool.available)
    }

    #[cfg(test)]
    pub(crate) fn outstanding_for(&self, handle: ConnectionHandle) -> u16 {
        self.lock()
            .connections
            .get(&handle.get_raw_handle())
            .map(|connection| connection.outstanding_fragments)
            .unwrap_or(0)
    }
}

struct SchedulerModule {
    scheduler: Option<Arc<RoundRobinScheduler>>,
}

fn new_scheduler_module() -> Box<dyn Module> {
    Box::new( SchedulerModule { scheduler: None } )
}

pub static MODULE: ModuleDescriptor = ModuleDescriptor::new("acl_scheduler", new_scheduler_module);

static SCHEDULER_DEPENDENCIES: &[&ModuleDescriptor] = &[
    &crate::hci::MODULE,
    &crate::controller::MODULE,
];

impl Module for SchedulerModule {
    fn dependencies(&self) -> &'static [&'static ModuleDescriptor] {
        SCHEDULER_DEPENDENCIES
    }

    fn start(&mut self, context: &ModuleContext<'_>) -> Arc<dyn std::any::Any + Send + Sync> {
        let hci = context.get_dependency::<HciLayer>(&crate::hci::MODULE);

        let controller = context.get_dependency::<Controller>(&crate::controller::MODULE);

        let handler = context.get_handler();

        let settings = BufferSettings::from_capabilities( controller.get_capabilities() );

        let scheduler = RoundRobinScheduler::new( handler.clone(), hci, settings );

        let for_credits = scheduler.clone();

        controller.register_completed_acl_packets_callback(&handler, Arc::new(move |completed| {
            for (handle, credits) in completed {
                for_credits.incoming_acl_credits(handle, credits);
            }
        }));

        self.scheduler = Some(scheduler.clone());

        scheduler
    }

    fn stop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
    }
}
