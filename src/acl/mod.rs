//! ACL connection management
//!
//! The manager turns HCI connection events into owned [`AclConnection`] objects for the
//! protocol layers, and keeps the [scheduler](scheduler/index.html) map in step with the
//! controller's handle assignments. Both transports land here: classic connections through the
//! Connection Complete event, LE connections through the LE meta Connection Complete subevent.
//!
//! Inbound ACL fragments are routed by handle into the owning connection's queue and nothing
//! more. Reassembling them into L2CAP frames is the business of whoever holds the connection's
//! [queue end](queue/struct.AclQueueUpEnd.html).

pub mod queue;
pub mod scheduler;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::hci::acl::{AclPacket, ConnectionHandle};
use crate::hci::error::Status;
use crate::hci::events::{
    ConnectionCompleteData,
    DisconnectionCompleteData,
    EventCode,
    LeConnectionCompleteData,
    LeSubeventCode,
};
use crate::hci::opcodes::{HciCommand, LinkControl};
use crate::hci::{CommandInterface, HciLayer, ReplyExpectation};
use crate::module::thread::Handler;
use crate::module::{Module, ModuleContext, ModuleDescriptor};
use crate::BluetoothDeviceAddress;

use self::queue::{AclBidiQueue, AclQueueUpEnd};
use self::scheduler::{ConnectionKind, RoundRobinScheduler};

/// Standard packet types offered on an outgoing classic connection (all ACL packet types)
const DEFAULT_PACKET_TYPES: u16 = 0xCC18;

/// Where connection outcomes are delivered
pub trait ConnectionCallbacks: Send + Sync {
    /// An outgoing or incoming connection is up, the receiver owns the connection object
    fn on_connect_success(&self, connection: AclConnection);

    /// A connection attempt to `peer` failed with the controller's reason
    fn on_connect_fail(&self, peer: BluetoothDeviceAddress, reason: Status);
}

struct DisconnectSubscriber {
    handler: Handler,
    callback: Arc<dyn Fn(Status) + Send + Sync>,
}

struct ConnectionShared {
    handle: ConnectionHandle,
    address: BluetoothDeviceAddress,
    kind: ConnectionKind,
    queue: AclBidiQueue,
    disconnect_subscriber: Mutex<Option<DisconnectSubscriber>>,
    manager: Weak<AclManager>,
}

/// One live ACL connection
///
/// Handed out by [`ConnectionCallbacks::on_connect_success`]. Dropping this does not tear the
/// link down, call [`disconnect`](#method.disconnect) or [`finish`](#method.finish) for that.
#[derive(Clone)]
pub struct AclConnection {
    shared: Arc<ConnectionShared>,
}

impl AclConnection {
    pub fn get_address(&self) -> BluetoothDeviceAddress {
        self.shared.address
    }

    pub fn get_handle(&self) -> ConnectionHandle {
        self.shared.handle
    }

    pub fn get_kind(&self) -> ConnectionKind {
        self.shared.kind
    }

    /// The endpoint for sending payloads and receiving fragments on this connection
    pub fn get_acl_queue_end(&self) -> AclQueueUpEnd {
        self.shared.queue.up_end()
    }

    /// Be told when the link goes away
    ///
    /// The callback gets the disconnect reason reported by the controller, posted to `handler`.
    pub fn register_disconnect_callback(
        &self,
        handler: &Handler,
        callback: Arc<dyn Fn(Status) + Send + Sync>,
    ) {
        *self.shared.disconnect_subscriber
            .lock()
            .expect("Connection state poisoned") = Some( DisconnectSubscriber {
                handler: handler.clone(),
                callback,
            });
    }

    /// Ask the controller to take the link down
    ///
    /// The connection object stays alive until the Disconnection Complete event comes back and
    /// the disconnect callback fires.
    pub fn disconnect(&self, reason: Status) {
        match self.shared.manager.upgrade() {
            Some(manager) => manager.send_disconnect(self.shared.handle, reason),
            None => log::warn!(
                "Disconnect of handle {} after the ACL manager stopped",
                self.shared.handle
            ),
        }
    }

    /// Tear the host side state down right now
    ///
    /// For when the upper layer is done with a connection it already knows is dead, without
    /// waiting on (or getting) a Disconnection Complete event.
    pub fn finish(&self) {
        if let Some(manager) = self.shared.manager.upgrade() {
            manager.finish_connection(self.shared.handle);
        }
    }
}

struct ManagerInner {
    connections: HashMap<u16, Arc<ConnectionShared>>,
    callbacks: Option<(Handler, Arc<dyn ConnectionCallbacks>)>,
    pending_connects: Vec<BluetoothDeviceAddress>,
}

/// The facade of the ACL manager module
pub struct AclManager {
    handler: Handler,
    scheduler: Arc<RoundRobinScheduler>,
    command_interface: CommandInterface,
    weak_self: Weak<AclManager>,
    inner: Mutex<ManagerInner>,
}

impl AclManager {
    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerInner> {
        self.inner.lock().expect("AclManager state poisoned")
    }

    /// Register the sink for connection outcomes
    ///
    /// # Panics
    /// One sink. Registering twice is a programming error.
    pub fn register_callbacks(
        &self,
        handler: &Handler,
        callbacks: Arc<dyn ConnectionCallbacks>,
    ) {
        let mut inner = self.lock();

        if inner.callbacks.is_some() {
            panic!("Connection callbacks are already registered with the ACL manager");
        }

        inner.callbacks = Some( (handler.clone(), callbacks) );
    }

    /// Start an outgoing classic connection
    ///
    /// The outcome arrives through the registered [`ConnectionCallbacks`], either side of it.
    pub fn create_connection( &self, peer: BluetoothDeviceAddress ) {
        self.lock().pending_connects.push(peer);

        let mut parameters = Vec::with_capacity(13);

        parameters.extend_from_slice( &peer );
        parameters.extend_from_slice( &DEFAULT_PACKET_TYPES.to_le_bytes() );
        parameters.push( 0x02 ); // page scan repetition mode R2
        parameters.push( 0x00 ); // reserved
        parameters.extend_from_slice( &0u16.to_le_bytes() ); // no clock offset
        parameters.push( 0x01 ); // allow role switch

        let weak = self.weak_self.clone();

        self.command_interface.enqueue_command(
            HciCommand::LinkControl(LinkControl::CreateConnection),
            &parameters,
            ReplyExpectation::CommandStatus,
            &self.handler,
            Box::new(move |result| {
                let manager = match weak.upgrade() {
                    Some(manager) => manager,
                    None => return,
                };

                match result {
                    Ok(command_return) if command_return.status.is_success() => (),
                    Ok(command_return) => {
                        manager.connect_attempt_failed(peer, command_return.status);
                    }
                    Err(reason) => {
                        log::error!("Create Connection could not be issued: {}", reason);

                        manager.connect_attempt_failed(peer, Status::UnspecifiedError);
                    }
                }
            }),
        );
    }

    /// Abort an outgoing classic connection attempt
    ///
    /// The attempt still finishes through the callbacks, normally as a failure with the
    /// "unknown connection identifier" reason once the cancel lands.
    pub fn cancel_connect( &self, peer: BluetoothDeviceAddress ) {
        self.command_interface.enqueue_command(
            HciCommand::LinkControl(LinkControl::CreateConnectionCancel),
            &peer,
            ReplyExpectation::CommandComplete,
            &self.handler,
            Box::new(move |result| {
                if let Err(reason) = result {
                    log::error!("Create Connection Cancel could not be issued: {}", reason);
                }
            }),
        );
    }

    fn send_disconnect( &self, handle: ConnectionHandle, reason: Status ) {
        let mut parameters = Vec::with_capacity(3);

        parameters.extend_from_slice( &handle.get_raw_handle().to_le_bytes() );
        parameters.push( reason.into_raw() );

        self.command_interface.enqueue_command(
            HciCommand::LinkControl(LinkControl::Disconnect),
            &parameters,
            ReplyExpectation::CommandStatus,
            &self.handler,
            Box::new(move |result| {
                match result {
                    Ok(command_return) if command_return.status.is_success() => (),
                    Ok(command_return) => log::error!(
                        "Disconnect of handle {} refused: {}",
                        handle,
                        command_return.status
                    ),
                    Err(reason) => log::error!(
                        "Disconnect of handle {} could not be issued: {}",
                        handle,
                        reason
                    ),
                }
            }),
        );
    }

    fn connect_attempt_failed( &self, peer: BluetoothDeviceAddress, reason: Status ) {
        let callbacks = {
            let mut inner = self.lock();

            inner.pending_connects.retain(|pending| *pending != peer);

            inner.callbacks.clone()
        };

        match callbacks {
            Some((handler, callbacks)) => {
                handler.post(move || callbacks.on_connect_fail(peer, reason));
            }
            None => log::warn!(
                "A connection attempt to {} failed ({}) with no callbacks registered",
                crate::bluetooth_address_into_string(peer),
                reason
            ),
        }
    }

    fn establish_connection(
        &self,
        kind: ConnectionKind,
        handle: ConnectionHandle,
        address: BluetoothDeviceAddress,
    ) {
        let queue = AclBidiQueue::new();

        let shared = Arc::new( ConnectionShared {
            handle: handle,
            address: address,
            kind: kind,
            queue: queue,
            disconnect_subscriber: Mutex::new(None),
            manager: self.weak_self.clone(),
        });

        let callbacks = {
            let mut inner = self.lock();

            inner.pending_connects.retain(|pending| *pending != address);

            inner.connections.insert( handle.get_raw_handle(), shared.clone() );

            inner.callbacks.clone()
        };

        self.scheduler.register( kind, handle, shared.queue.down_end() );

        log::debug!(
            "ACL connection up, handle {} to {}",
            handle,
            crate::bluetooth_address_into_string(address)
        );

        match callbacks {
            Some((handler, callbacks)) => {
                let connection = AclConnection { shared };

                handler.post(move || callbacks.on_connect_success(connection));
            }
            None => log::warn!(
                "Connection handle {} came up with no callbacks registered, it is unreachable \
                until the stack disconnects",
                handle
            ),
        }
    }

    fn on_connection_complete( &self, data: ConnectionCompleteData ) {
        if data.status.is_success() {
            self.establish_connection(ConnectionKind::Classic, data.connection_handle, data.address);
        }
        else {
            self.connect_attempt_failed(data.address, data.status);
        }
    }

    fn on_le_connection_complete( &self, data: LeConnectionCompleteData ) {
        if data.status.is_success() {
            self.establish_connection(
                ConnectionKind::LowEnergy,
                data.connection_handle,
                data.peer_address,
            );
        }
        else {
            self.connect_attempt_failed(data.peer_address, data.status);
        }
    }

    fn on_disconnection_complete( &self, data: DisconnectionCompleteData ) {
        if !data.status.is_success() {
            log::error!(
                "A Disconnection Complete for handle {} carried failure status {}",
                data.connection_handle,
                data.status
            );
            return;
        }

        let raw = data.connection_handle.get_raw_handle();

        let shared = match self.lock().connections.remove(&raw) {
            Some(shared) => shared,
            None => {
                log::warn!(
                    "Disconnection Complete for unknown handle {}",
                    data.connection_handle
                );
                return;
            }
        };

        // reclaim the in flight credits first, then drop the scheduler's borrow of the queue
        self.scheduler.set_disconnect(data.connection_handle);
        self.scheduler.unregister(data.connection_handle);

        let subscriber = shared.disconnect_subscriber
            .lock()
            .expect("Connection state poisoned")
            .take();

        match subscriber {
            Some(subscriber) => {
                let callback = subscriber.callback;
                let reason = data.reason;

                subscriber.handler.post(move || callback(reason));
            }
            None => log::debug!(
                "Handle {} disconnected ({}) with no disconnect callback registered",
                data.connection_handle,
                data.reason
            ),
        }
    }

    fn finish_connection( &self, handle: ConnectionHandle ) {
        let removed = self.lock().connections.remove(&handle.get_raw_handle());

        if removed.is_some() {
            self.scheduler.set_disconnect(handle);
            self.scheduler.unregister(handle);
        }
    }

    fn on_inbound_fragment( &self, packet: AclPacket ) {
        let raw = packet.get_handle().get_raw_handle();

        let connection = self.lock().connections.get(&raw).cloned();

        match connection {
            Some(connection) => connection.queue.down_end().enqueue_fragment(packet),
            None => log::warn!(
                "Dropping an inbound ACL fragment for unknown handle {}",
                packet.get_handle()
            ),
        }
    }

    fn shutdown(&self) {
        let mut inner = self.lock();

        inner.connections.clear();
        inner.callbacks = None;
        inner.pending_connects.clear();
    }
}

struct AclManagerModule {
    manager: Option<Arc<AclManager>>,
    hci: Option<Arc<HciLayer>>,
}

fn new_acl_manager_module() -> Box<dyn Module> {
    Box::new( AclManagerModule { manager: None, hci: None } )
}

pub static MODULE: ModuleDescriptor = ModuleDescriptor::new("acl_manager", new_acl_manager_module);

static ACL_MANAGER_DEPENDENCIES: &[&ModuleDescriptor] = &[
    &crate::hci::MODULE,
    &self::scheduler::MODULE,
];

impl Module for AclManagerModule {
    fn dependencies(&self) -> &'static [&'static ModuleDescriptor] {
        ACL_MANAGER_DEPENDENCIES
    }

    fn start(&mut self, context: &ModuleContext<'_>) -> Arc<dyn Any + Send + Sync> {
        let hci = context.get_dependency::<HciLayer>(&crate::hci::MODULE);

        let scheduler =
            context.get_dependency::<RoundRobinScheduler>(&self::scheduler::MODULE);

        let handler = context.get_handler();

        let manager = Arc::new_cyclic(|weak| AclManager {
            handler: handler.clone(),
            scheduler: scheduler,
            command_interface: hci.acl_command_interface(),
            weak_self: weak.clone(),
            inner: Mutex::new( ManagerInner {
                connections: HashMap::new(),
                callbacks: None,
                pending_connects: Vec::new(),
            }),
        });

        let for_connections = manager.clone();

        hci.register_event_handler(
            EventCode::ConnectionComplete,
            &handler,
            Arc::new(move |packet| {
                match ConnectionCompleteData::try_from(packet.get_parameters()) {
                    Ok(data) => for_connections.on_connection_complete(data),
                    Err(reason) => log::error!(
                        "Dropping a malformed Connection Complete event: {}",
                        reason
                    ),
                }
            }),
        );

        let for_disconnections = manager.clone();

        hci.register_event_handler(
            EventCode::DisconnectionComplete,
            &handler,
            Arc::new(move |packet| {
                match DisconnectionCompleteData::try_from(packet.get_parameters()) {
                    Ok(data) => for_disconnections.on_disconnection_complete(data),
                    Err(reason) => log::error!(
                        "Dropping a malformed Disconnection Complete event: {}",
                        reason
                    ),
                }
            }),
        );

        let for_le_connections = manager.clone();

        hci.register_le_meta_event_handler(
            LeSubeventCode::ConnectionComplete,
            &handler,
            Arc::new(move |packet| {
                let parsed = crate::hci::events::LeMetaData::try_from(packet.get_parameters())
                    .and_then(|meta| LeConnectionCompleteData::try_from(&meta.parameters));

                match parsed {
                    Ok(data) => for_le_connections.on_le_connection_complete(data),
                    Err(reason) => log::error!(
                        "Dropping a malformed LE Connection Complete event: {}",
                        reason
                    ),
                }
            }),
        );

        let for_ingress = manager.clone();

        hci.register_acl_ingress(&handler, Arc::new(move |packet| {
            for_ingress.on_inbound_fragment(packet);
        }));

        self.manager = Some(manager.clone());
        self.hci = Some(hci);

        manager
    }

    fn stop(&mut self) {
        if let Some(hci) = self.hci.take() {
            hci.unregister_event_handler(EventCode::ConnectionComplete);
            hci.unregister_event_handler(EventCode::DisconnectionComplete);
            hci.unregister_le_meta_event_handler(LeSubeventCode::ConnectionComplete);
            hci.unregister_acl_ingress();
        }

        if let Some(manager) = self.manager.take() {
            manager.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackManager;
    use crate::test_util::{self, TestHal};
    use std::sync::mpsc::channel;

    const PEER: BluetoothDeviceAddress = [0x13, 0x71, 0xDA, 0x7D, 0x1A, 0x00];

    enum ConnectionOutcome {
        Success(AclConnection),
        Fail(BluetoothDeviceAddress, Status),
    }

    struct Recorder {
        sender: Mutex<std::sync::mpsc::Sender<ConnectionOutcome>>,
    }

    impl ConnectionCallbacks for Recorder {
        fn on_connect_success(&self, connection: AclConnection) {
            self.sender
                .lock()
                .unwrap()
                .send( ConnectionOutcome::Success(connection) )
                .unwrap();
        }

        fn on_connect_fail(&self, peer: BluetoothDeviceAddress, reason: Status) {
            self.sender
                .lock()
                .unwrap()
                .send( ConnectionOutcome::Fail(peer, reason) )
                .unwrap();
        }
    }

    struct TestStack {
        stack: StackManager,
        hal: Arc<TestHal>,
        manager: Arc<AclManager>,
        outcomes: std::sync::mpsc::Receiver<ConnectionOutcome>,
    }

    fn start_stack() -> TestStack {
        test_util::init_test_logger();

        let hal = TestHal::new();

        crate::controller::tests::script_startup_replies(&hal, 4, 27);

        let stack = StackManager::start( hal.clone() );

        let manager = stack.get::<AclManager>(&MODULE);

        let (tx, rx) = channel();

        let handler = stack.new_handler();

        manager.register_callbacks(&handler, Arc::new( Recorder {
            sender: Mutex::new(tx),
        }));

        TestStack { stack, hal, manager, outcomes: rx }
    }

    fn expect_success( stack: &TestStack ) -> AclConnection {
        match stack.outcomes.recv().unwrap() {
            ConnectionOutcome::Success(connection) => connection,
            ConnectionOutcome::Fail(_, reason) => panic!("Connection failed with {}", reason),
        }
    }

    #[test]
    fn connection_complete_yields_a_working_connection() {
        let stack = start_stack();

        stack.hal.script_reply( 0x0405, test_util::command_status_bytes(0x00, 1, 0x0405) );

        stack.manager.create_connection(PEER);

        stack.hal.inject_event( &test_util::connection_complete_bytes(0x00, 0x0040, PEER) );

        let connection = expect_success(&stack);

        assert_eq!( connection.get_address(), PEER );
        assert_eq!( connection.get_handle().get_raw_handle(), 0x0040 );
        assert_eq!( connection.get_kind(), ConnectionKind::Classic );

        // the outbound path reaches the wire through the scheduler
        let queue_end = connection.get_acl_queue_end();

        queue_end.enqueue_payload( Box::from(&[1u8, 2, 3][..]) );

        stack.settle();

        let sent = stack.hal.take_sent_acl();

        assert_eq!( sent.len(), 1 );
        assert_eq!( &sent[0][4..], &[1, 2, 3] );

        // the inbound path reaches the connection's queue end
        let (rx_tx, rx_rx) = channel();

        let for_callback = queue_end.clone();

        queue_end.register_dequeue( &stack.stack.new_handler(), Arc::new(move || {
            if let Some(fragment) = for_callback.try_dequeue_fragment() {
                rx_tx.send(fragment).unwrap();
            }
        }));

        stack.hal.inject_acl( &[0x40, 0x20, 0x02, 0x00, 0xAB, 0xCD] );

        let fragment = rx_rx.recv().unwrap();

        assert_eq!( fragment.get_payload(), &[0xAB, 0xCD] );

        stack.stack.shutdown();
    }

    #[test]
    fn failed_connection_surfaces_the_reason() {
        let stack = start_stack();

        stack.hal.script_reply( 0x0405, test_util::command_status_bytes(0x00, 1, 0x0405) );

        stack.manager.create_connection(PEER);

        stack.hal.inject_event( &test_util::connection_complete_bytes(0x04, 0x0040, PEER) );

        match stack.outcomes.recv().unwrap() {
            ConnectionOutcome::Fail(peer, reason) => {
                assert_eq!( peer, PEER );
                assert_eq!( reason, Status::PageTimeout );
            }
            ConnectionOutcome::Success(_) => panic!("The connection should have failed"),
        }

        stack.stack.shutdown();
    }

    #[test]
    fn create_connection_failure_status_fails_the_attempt() {
        let stack = start_stack();

        // the controller refuses the command itself
        stack.hal.script_reply( 0x0405, test_util::command_status_bytes(0x0C, 1, 0x0405) );

        stack.manager.create_connection(PEER);

        match stack.outcomes.recv().unwrap() {
            ConnectionOutcome::Fail(peer, reason) => {
                assert_eq!( peer, PEER );
                assert_eq!( reason, Status::CommandDisallowed );
            }
            ConnectionOutcome::Success(_) => panic!("The attempt should have failed"),
        }

        stack.stack.shutdown();
    }

    #[test]
    fn disconnection_fires_the_callback_and_reclaims_credits() {
        let stack = start_stack();

        stack.hal.script_reply( 0x0405, test_util::command_status_bytes(0x00, 1, 0x0405) );

        stack.manager.create_connection(PEER);

        stack.hal.inject_event( &test_util::connection_complete_bytes(0x00, 0x0040, PEER) );

        let connection = expect_success(&stack);

        // put a packet in flight so the disconnect has a credit to reclaim
        connection.get_acl_queue_end().enqueue_payload( Box::from(&[7u8; 4][..]) );

        stack.settle();

        let scheduler = stack.stack.get::<RoundRobinScheduler>(&scheduler::MODULE);

        assert_eq!( scheduler.classic_credits_available(), 3 );

        let (tx, rx) = channel();

        connection.register_disconnect_callback( &stack.stack.new_handler(), Arc::new(move |reason| {
            tx.send(reason).unwrap();
        }));

        stack.hal.inject_event( &test_util::disconnection_complete_bytes(0x00, 0x0040, 0x13) );

        assert_eq!( rx.recv().unwrap(), Status::RemoteUserTerminatedConnection );

        stack.settle();

        assert_eq!( scheduler.classic_credits_available(), 4 );

        // completion reports for the dead handle are discarded
        stack.hal.inject_event( &test_util::number_of_completed_packets_bytes(&[(0x0040, 1)]) );

        stack.settle();

        assert_eq!( scheduler.classic_credits_available(), 4 );

        stack.stack.shutdown();
    }

    #[test]
    fn le_connections_register_as_low_energy() {
        let stack = start_stack();

        stack.hal.inject_event( &test_util::le_connection_complete_bytes(0x00, 0x0041, PEER) );

        let connection = expect_success(&stack);

        assert_eq!( connection.get_kind(), ConnectionKind::LowEnergy );
        assert_eq!( connection.get_handle().get_raw_handle(), 0x0041 );

        stack.stack.shutdown();
    }

    #[test]
    fn create_connection_sends_the_right_command() {
        let stack = start_stack();

        stack.hal.script_reply( 0x0405, test_util::command_status_bytes(0x00, 1, 0x0405) );

        let before = stack.hal.sent_command_count();

        stack.manager.create_connection(PEER);

        stack.settle();

        let sent = stack.hal.sent_commands();

        assert_eq!( sent.len(), before + 1 );

        let command = &sent[sent.len() - 1];

        assert_eq!( u16::from_le_bytes([command[0], command[1]]), 0x0405 );
        assert_eq!( command[2], 13 );
        assert_eq!( &command[3..9], &PEER );

        stack.stack.shutdown();
    }

    #[test]
    fn cancel_connect_sends_the_cancel_command() {
        let stack = start_stack();

        stack.hal.script_reply( 0x0405, test_util::command_status_bytes(0x00, 1, 0x0405) );
        stack.hal.script_reply( 0x0408, test_util::command_complete_bytes(1, 0x0408, &[0x00]) );

        stack.manager.create_connection(PEER);
        stack.manager.cancel_connect(PEER);

        stack.settle();

        let sent = stack.hal.sent_commands();

        let command = &sent[sent.len() - 1];

        assert_eq!( u16::from_le_bytes([command[0], command[1]]), 0x0408 );
        assert_eq!( &command[3..9], &PEER );

        stack.stack.shutdown();
    }

    #[test]
    fn disconnect_issues_the_disconnect_command() {
        let stack = start_stack();

        stack.hal.script_reply( 0x0405, test_util::command_status_bytes(0x00, 1, 0x0405) );
        stack.hal.script_reply( 0x0406, test_util::command_status_bytes(0x00, 1, 0x0406) );

        stack.manager.create_connection(PEER);

        stack.hal.inject_event( &test_util::connection_complete_bytes(0x00, 0x0040, PEER) );

        let connection = expect_success(&stack);

        connection.disconnect(Status::RemoteUserTerminatedConnection);

        stack.settle();

        let sent = stack.hal.sent_commands();

        let command = &sent[sent.len() - 1];

        assert_eq!( u16::from_le_bytes([command[0], command[1]]), 0x0406 );
        assert_eq!( u16::from_le_bytes([command[3], command[4]]), 0x0040 );
        assert_eq!( command[5], 0x13 );

        stack.stack.shutdown();
    }

    #[test]
    fn finish_unregisters_the_connection() {
        let stack = start_stack();

        stack.hal.inject_event( &test_util::le_connection_complete_bytes(0x00, 0x0041, PEER) );

        let connection = expect_success(&stack);

        connection.finish();

        // inbound data for the finished handle is dropped rather than queued
        stack.hal.inject_acl( &[0x41, 0x20, 0x01, 0x00, 0xEE] );

        stack.settle();

        assert!( test_util::warning_count_containing("0x0041") >= 1 );

        stack.stack.shutdown();
    }

    impl TestStack {
        fn settle(&self) {
            let handler = self.stack.new_handler();

            for _ in 0..64 {
                test_util::sync(&handler);
            }
        }
    }
}
