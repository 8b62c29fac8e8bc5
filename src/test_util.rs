//! Shared helpers for the crate's tests
//!
//! The important piece is [`TestHal`], a scripted in-memory driver. Tests capture what the
//! stack sends and inject controller-to-host packets by hand, or queue canned replies per
//! opcode for flows (like controller startup) that issue a whole sequence of commands.
//!
//! There is also a recording logger so tests can assert that a code path warned. The log
//! records are global to the test binary and never cleared, so assertions should count
//! records containing something unique to the test rather than the total.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex, Once};

use crate::hal::{HalCallbacks, HciHal};
use crate::module::thread::Handler;

struct TestHalInner {
    callbacks: Option<Arc<dyn HalCallbacks>>,
    sent_commands: Vec<Box<[u8]>>,
    sent_acl: Vec<Box<[u8]>>,
    scripted_replies: HashMap<u16, VecDeque<Vec<u8>>>,
    closed: bool,
}

/// An in-memory HCI driver for tests
pub struct TestHal {
    inner: Mutex<TestHalInner>,
}

impl TestHal {
    pub fn new() -> Arc<Self> {
        Arc::new( TestHal {
            inner: Mutex::new( TestHalInner {
                callbacks: None,
                sent_commands: Vec::new(),
                sent_acl: Vec::new(),
                scripted_replies: HashMap::new(),
                closed: false,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TestHalInner> {
        self.inner.lock().expect("TestHal poisoned")
    }

    /// Queue an event to inject as soon as a command with `opcode` is sent
    pub fn script_reply( &self, opcode: u16, event_bytes: Vec<u8> ) {
        self.lock()
            .scripted_replies
            .entry(opcode)
            .or_insert_with(VecDeque::new)
            .push_back(event_bytes);
    }

    /// Inject an event packet as if the controller sent it
    pub fn inject_event( &self, event_bytes: &[u8] ) {
        let callbacks = self.lock().callbacks.clone();

        callbacks
            .expect("No callbacks registered with the TestHal")
            .event_received(event_bytes);
    }

    /// Inject an ACL data packet as if the controller sent it
    pub fn inject_acl( &self, acl_bytes: &[u8] ) {
        let callbacks = self.lock().callbacks.clone();

        callbacks
            .expect("No callbacks registered with the TestHal")
            .acl_received(acl_bytes);
    }

    /// Report the transport as lost
    pub fn close_transport(&self) {
        let callbacks = self.lock().callbacks.clone();

        callbacks
            .expect("No callbacks registered with the TestHal")
            .transport_closed();
    }

    pub fn sent_command_count(&self) -> usize {
        self.lock().sent_commands.len()
    }

    pub fn sent_commands(&self) -> Vec<Box<[u8]>> {
        self.lock().sent_commands.clone()
    }

    /// Take everything sent on the ACL channel so far
    pub fn take_sent_acl(&self) -> Vec<Box<[u8]>> {
        self.lock().sent_acl.split_off(0)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl HciHal for TestHal {
    fn register_callbacks(&self, callbacks: Arc<dyn HalCallbacks>) {
        self.lock().callbacks = Some(callbacks);
    }

    fn send_command(&self, packet: &[u8]) {
        let (callbacks, reply) = {
            let mut inner = self.lock();

            inner.sent_commands.push( Box::from(packet) );

            let opcode = u16::from_le_bytes( [packet[0], packet[1]] );

            let reply = inner.scripted_replies
                .get_mut(&opcode)
                .and_then(|queue| queue.pop_front());

            (inner.callbacks.clone(), reply)
        };

        if let (Some(callbacks), Some(reply)) = (callbacks, reply) {
            callbacks.event_received(&reply);
        }
    }

    fn send_acl(&self, packet: &[u8]) {
        self.lock().sent_acl.push( Box::from(packet) );
    }

    fn close(&self) {
        let mut inner = self.lock();

        inner.closed = true;
        inner.callbacks = None;
    }
}

/// Wait until the handler's thread has run everything posted before this call
pub fn sync( handler: &Handler ) {
    let (tx, rx) = channel();

    handler.post(move || { tx.send(()).ok(); });

    rx.recv().expect("The stack thread died");
}

// ---- canned event packets ----

pub fn command_complete_bytes( credits: u8, opcode: u16, return_parameters: &[u8] ) -> Vec<u8> {
    let mut event = vec![ 0x0E, 3 + return_parameters.len() as u8, credits ];

    event.extend_from_slice( &opcode.to_le_bytes() );

    event.extend_from_slice( return_parameters );

    event
}

pub fn command_status_bytes( status: u8, credits: u8, opcode: u16 ) -> Vec<u8> {
    let mut event = vec![ 0x0F, 4, status, credits ];

    event.extend_from_slice( &opcode.to_le_bytes() );

    event
}

pub fn connection_complete_bytes(
    status: u8,
    handle: u16,
    address: crate::BluetoothDeviceAddress,
) -> Vec<u8> {
    let mut event = vec![ 0x03, 11, status ];

    event.extend_from_slice( &handle.to_le_bytes() );

    event.extend_from_slice( &address );

    event.push( 0x01 ); // ACL link
    event.push( 0x00 ); // encryption off

    event
}

pub fn disconnection_complete_bytes( status: u8, handle: u16, reason: u8 ) -> Vec<u8> {
    let mut event = vec![ 0x05, 4, status ];

    event.extend_from_slice( &handle.to_le_bytes() );

    event.push(reason);

    event
}

pub fn number_of_completed_packets_bytes( completed: &[(u16, u16)] ) -> Vec<u8> {
    let mut event = vec![ 0x13, 1 + 4 * completed.len() as u8, completed.len() as u8 ];

    for (handle, count) in completed {
        event.extend_from_slice( &handle.to_le_bytes() );
        event.extend_from_slice( &count.to_le_bytes() );
    }

    event
}

pub fn le_connection_complete_bytes(
    status: u8,
    handle: u16,
    address: crate::BluetoothDeviceAddress,
) -> Vec<u8> {
    let mut event = vec![ 0x3E, 19, 0x01, status ];

    event.extend_from_slice( &handle.to_le_bytes() );

    event.push( 0x00 ); // central
    event.push( 0x00 ); // public peer address

    event.extend_from_slice( &address );

    event.extend_from_slice( &0x0028u16.to_le_bytes() ); // interval
    event.extend_from_slice( &0x0000u16.to_le_bytes() ); // latency
    event.extend_from_slice( &0x00C8u16.to_le_bytes() ); // supervision timeout

    event.push( 0x00 ); // clock accuracy

    event
}

// ---- recording logger ----

struct RecordingLogger {
    records: Mutex<Vec<(log::Level, String)>>,
}

impl log::Log for RecordingLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        self.records
            .lock()
            .expect("RecordingLogger poisoned")
            .push( (record.level(), format!("{}", record.args())) );
    }

    fn flush(&self) {}
}

lazy_static::lazy_static! {
    static ref RECORDING_LOGGER: RecordingLogger = RecordingLogger {
        records: Mutex::new(Vec::new()),
    };
}

/// Install the recording logger (idempotent across the test binary)
pub fn init_test_logger() {
    static INSTALL: Once = Once::new();

    INSTALL.call_once(|| {
        log::set_logger(&*RECORDING_LOGGER).expect("Another logger is installed");

        log::set_max_level(log::LevelFilter::Trace);
    });
}

/// How many warning records so far contain `needle`
pub fn warning_count_containing( needle: &str ) -> usize {
    RECORDING_LOGGER.records
        .lock()
        .expect("RecordingLogger poisoned")
        .iter()
        .filter(|(level, message)| *level == log::Level::Warn && message.contains(needle))
        .count()
}
