//! The HCI layer
//!
//! This module turns the byte pipes of the [HAL](../hal/index.html) into a typed host controller
//! interface with four surfaces:
//!
//! * command submission with one reply per command, see
//!   [`enqueue_command`](struct.HciLayer.html#method.enqueue_command)
//! * event subscription by event code (and LE meta subevent code)
//! * the ACL data path, ingress routed to a registered consumer and egress pulled from a
//!   registered fragment source
//! * restricted [command interfaces](struct.CommandInterface.html) for the protocol components
//!   above, each limited to the opcodes that component is supposed to issue
//!
//! The command pipeline respects the controller's command credit count. Commands beyond the
//! credit limit wait in a queue inside the layer, and every reply restores the credit its
//! `Num_HCI_Command_Packets` field reports. Pairing a reply to its command is done by opcode
//! against the oldest outstanding command.

pub mod acl;
pub mod error;
pub mod events;
pub mod opcodes;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use crate::hal::{HalCallbacks, HalFacade, HciHal};
use crate::module::thread::Handler;
use crate::module::{Module, ModuleContext, ModuleDescriptor};

use self::acl::AclPacket;
use self::error::{Error, Status};
use self::events::{CommandCompleteData, CommandStatusData, EventCode, EventPacket, LeMetaData};
use self::opcodes::{HciCommand, LinkControl, LeController};

/// Which kind of reply the submitter of a command expects
///
/// Whether a given opcode is answered with Command Complete or Command Status is fixed by the
/// bluetooth specification, so the caller declares it and a controller answering with the other
/// kind is a protocol error.
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum ReplyExpectation {
    CommandComplete,
    CommandStatus,
}

/// A serialized HCI command packet
pub struct CommandPacket {
    command: HciCommand,
    bytes: Box<[u8]>,
}

impl CommandPacket {
    pub fn new( command: HciCommand, parameters: &[u8] ) -> Self {
        // 3 header bytes, the opcode pair and the parameter length
        let mut buffer = Vec::with_capacity( parameters.len() + 3 );

        buffer.extend_from_slice( &command.as_opcode().to_le_bytes() );

        buffer.push( parameters.len() as u8 );

        buffer.extend_from_slice( parameters );

        CommandPacket {
            command: command,
            bytes: buffer.into_boxed_slice(),
        }
    }

    pub fn get_command(&self) -> HciCommand {
        self.command
    }

    pub fn get_opcode(&self) -> u16 {
        self.command.as_opcode()
    }

    pub fn get_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// The reply to one command
#[derive(Debug,Clone,PartialEq)]
pub struct CommandReturn {
    pub opcode: u16,
    pub kind: ReplyExpectation,
    pub status: Status,
    /// Return parameters after the status byte for Command Complete, empty for Command Status
    pub return_parameters: Box<[u8]>,
}

pub type CommandCallback = Box<dyn FnOnce(Result<CommandReturn, Error>) + Send>;

/// A source of outbound ACL fragments, polled by the layer until it reports `None`
pub type AclSource = Box<dyn FnMut() -> Option<AclPacket> + Send>;

struct CommandSlot {
    opcode: u16,
    bytes: Box<[u8]>,
    expectation: ReplyExpectation,
    reply_handler: Handler,
    callback: CommandCallback,
}

impl CommandSlot {
    fn finish(self, result: Result<CommandReturn, Error>) {
        let callback = self.callback;

        self.reply_handler.post(move || callback(result));
    }
}

struct EventSubscription {
    handler: Handler,
    callback: Arc<dyn Fn(EventPacket) + Send + Sync>,
}

impl EventSubscription {
    fn deliver(&self, packet: EventPacket) {
        let callback = self.callback.clone();

        self.handler.post(move || callback(packet));
    }
}

struct AclIngress {
    handler: Handler,
    callback: Arc<dyn Fn(AclPacket) + Send + Sync>,
}

struct HciInner {
    command_credits: u16,
    pending_commands: VecDeque<CommandSlot>,
    outstanding_commands: VecDeque<CommandSlot>,
    event_subscriptions: HashMap<u8, EventSubscription>,
    subevent_subscriptions: HashMap<u8, EventSubscription>,
    acl_ingress: Option<AclIngress>,
    closed: bool,
}

/// The HCI layer
///
/// Shared by every component that talks to the controller. All internal state mutation happens
/// with the layer's lock held for the duration of one small step, and all externally visible
/// callbacks are posted to the callback owner's handler rather than invoked inline.
pub struct HciLayer {
    handler: Handler,
    hal: Arc<dyn HciHal>,
    weak_self: Weak<HciLayer>,
    inner: Mutex<HciInner>,
}

impl HciLayer {
    /// Build the layer on top of a driver and hook the driver's receive side up
    pub fn new( handler: Handler, hal: Arc<dyn HciHal> ) -> Arc<Self> {
        let layer = Arc::new_cyclic(|weak| HciLayer {
            handler: handler,
            hal: hal.clone(),
            weak_self: weak.clone(),
            inner: Mutex::new( HciInner {
                command_credits: 1,
                pending_commands: VecDeque::new(),
                outstanding_commands: VecDeque::new(),
                event_subscriptions: HashMap::new(),
                subevent_subscriptions: HashMap::new(),
                acl_ingress: None,
                closed: false,
            }),
        });

        hal.register_callbacks( Arc::new( HalEventForwarder {
            layer: Arc::downgrade(&layer),
        }));

        layer
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HciInner> {
        self.inner.lock().expect("HciLayer state poisoned")
    }

    fn shared(&self) -> Arc<HciLayer> {
        self.weak_self.upgrade().expect("The HCI layer is gone")
    }

    /// Submit a command
    ///
    /// The command is sent to the controller once a command credit is available and every
    /// earlier submission has been sent. Exactly one result is posted to `reply_handler`: the
    /// paired reply, or an error if the reply violates the protocol or the transport dies
    /// first.
    pub fn enqueue_command(
        &self,
        packet: CommandPacket,
        expectation: ReplyExpectation,
        reply_handler: &Handler,
        callback: CommandCallback,
    ) {
        let slot = CommandSlot {
            opcode: packet.get_opcode(),
            bytes: packet.bytes,
            expectation: expectation,
            reply_handler: reply_handler.clone(),
            callback: callback,
        };

        let mut inner = self.lock();

        if inner.closed {
            drop(inner);
            slot.finish( Err(Error::TransportClosed) );
            return;
        }

        inner.pending_commands.push_back(slot);

        self.try_issue_commands(&mut inner);
    }

    /// Send queued commands while credits last
    fn try_issue_commands(&self, inner: &mut HciInner) {
        while inner.command_credits > 0 {
            let slot = match inner.pending_commands.pop_front() {
                Some(slot) => slot,
                None => break,
            };

            log::debug!("Sending command with opcode {:#06x}", slot.opcode);

            inner.command_credits -= 1;

            self.hal.send_command(&slot.bytes);

            inner.outstanding_commands.push_back(slot);
        }
    }

    /// Subscribe to an event code
    ///
    /// # Panics
    /// One subscriber per event code. Registering over a live subscription, or registering for
    /// a code the layer consumes itself (Command Complete, Command Status, LE Meta), is a
    /// programming error.
    pub fn register_event_handler(
        &self,
        event_code: EventCode,
        handler: &Handler,
        callback: Arc<dyn Fn(EventPacket) + Send + Sync>,
    ) {
        match event_code {
            EventCode::CommandComplete | EventCode::CommandStatus | EventCode::LeMeta => {
                panic!("The {:?} event is handled inside the HCI layer", event_code);
            }
            _ => (),
        }

        let mut inner = self.lock();

        let occupied = inner.event_subscriptions
            .insert(
                event_code.into_raw(),
                EventSubscription { handler: handler.clone(), callback },
            )
            .is_some();

        if occupied {
            panic!("The {:?} event already has a subscriber", event_code);
        }
    }

    pub fn unregister_event_handler(&self, event_code: EventCode) {
        self.lock().event_subscriptions.remove(&event_code.into_raw());
    }

    /// Subscribe to an LE meta subevent code
    ///
    /// # Panics
    /// Same single subscriber rule as [`register_event_handler`].
    pub fn register_le_meta_event_handler(
        &self,
        subevent_code: events::LeSubeventCode,
        handler: &Handler,
        callback: Arc<dyn Fn(EventPacket) + Send + Sync>,
    ) {
        let mut inner = self.lock();

        let occupied = inner.subevent_subscriptions
            .insert(
                subevent_code.into_raw(),
                EventSubscription { handler: handler.clone(), callback },
            )
            .is_some();

        if occupied {
            panic!("The LE {:?} subevent already has a subscriber", subevent_code);
        }
    }

    pub fn unregister_le_meta_event_handler(&self, subevent_code: events::LeSubeventCode) {
        self.lock().subevent_subscriptions.remove(&subevent_code.into_raw());
    }

    /// Register the consumer of inbound ACL fragments
    ///
    /// Fragments are delivered exactly as framed by the controller. This layer never
    /// reassembles.
    ///
    /// # Panics
    /// One consumer at a time.
    pub fn register_acl_ingress(
        &self,
        handler: &Handler,
        callback: Arc<dyn Fn(AclPacket) + Send + Sync>,
    ) {
        let mut inner = self.lock();

        if inner.acl_ingress.is_some() {
            panic!("An ACL ingress consumer is already registered");
        }

        inner.acl_ingress = Some( AclIngress { handler: handler.clone(), callback } );
    }

    pub fn unregister_acl_ingress(&self) {
        self.lock().acl_ingress = None;
    }

    /// Attach an outbound fragment source and drain it
    ///
    /// The source is polled on the layer's handler until it returns `None`, each produced
    /// fragment going straight to the driver. The draining is a posted loop, not recursion, so
    /// a source that refills itself cannot blow the stack. Once the source reports `None` it is
    /// dropped and must be registered again to resume.
    pub fn register_acl_enqueue( &self, mut source: AclSource ) {
        let weak = self.weak_self.clone();

        self.handler.post(move || {
            let layer = match weak.upgrade() {
                Some(layer) => layer,
                None => return,
            };

            while let Some(fragment) = source() {
                layer.send_acl_fragment(fragment);
            }
        });
    }

    fn send_acl_fragment(&self, fragment: AclPacket) {
        if self.lock().closed {
            log::warn!(
                "Dropping an outbound ACL fragment for handle {}, the transport is closed",
                fragment.get_handle()
            );
            return;
        }

        log::debug!(
            "Sending ACL fragment for handle {} ({} bytes)",
            fragment.get_handle(),
            fragment.get_payload().len()
        );

        self.hal.send_acl( &fragment.into_bytes() );
    }

    /// Stop the layer
    ///
    /// Every queued and outstanding command fails with
    /// [`TransportClosed`](error/enum.Error.html#variant.TransportClosed), the subscription
    /// tables empty out and the driver is released. Submissions after this fail immediately.
    pub fn shutdown(&self) {
        let (pending, outstanding) = {
            let mut inner = self.lock();

            if inner.closed {
                return;
            }

            inner.closed = true;

            inner.event_subscriptions.clear();
            inner.subevent_subscriptions.clear();
            inner.acl_ingress = None;

            (
                inner.pending_commands.split_off(0),
                inner.outstanding_commands.split_off(0),
            )
        };

        for slot in outstanding.into_iter().chain(pending) {
            slot.finish( Err(Error::TransportClosed) );
        }

        self.hal.close();
    }

    fn process_event_bytes(&self, bytes: &[u8]) {
        let packet = match EventPacket::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(reason) => {
                log::error!("Dropping a malformed event packet: {}", reason);
                return;
            }
        };

        match EventCode::from_raw(packet.get_event_code()) {
            Some(EventCode::CommandComplete) => self.process_command_complete(&packet),
            Some(EventCode::CommandStatus) => self.process_command_status(&packet),
            Some(EventCode::LeMeta) => self.process_le_meta(packet),
            _ => self.dispatch_event(packet),
        }
    }

    fn process_command_complete(&self, packet: &EventPacket) {
        match CommandCompleteData::try_from(packet.get_parameters()) {
            Ok(data) => {
                // Command Complete return parameters lead with the status byte
                let status = data.return_parameters
                    .first()
                    .map(|raw| Status::from_raw(*raw))
                    .unwrap_or(Status::Success);

                self.process_command_reply(
                    ReplyExpectation::CommandComplete,
                    data.number_of_hci_command_packets,
                    data.command_opcode,
                    status,
                    data.return_parameters,
                );
            }
            Err(reason) => log::error!("Dropping a malformed Command Complete event: {}", reason),
        }
    }

    fn process_command_status(&self, packet: &EventPacket) {
        match CommandStatusData::try_from(packet.get_parameters()) {
            Ok(data) => {
                self.process_command_reply(
                    ReplyExpectation::CommandStatus,
                    data.number_of_hci_command_packets,
                    data.command_opcode,
                    data.status,
                    Box::from(&[][..]),
                );
            }
            Err(reason) => log::error!("Dropping a malformed Command Status event: {}", reason),
        }
    }

    fn process_command_reply(
        &self,
        kind: ReplyExpectation,
        restored_credits: u8,
        reply_opcode: Option<u16>,
        status: Status,
        return_parameters: Box<[u8]>,
    ) {
        let mut finished: Vec<(CommandSlot, Result<CommandReturn, Error>)> = Vec::new();

        {
            let mut inner = self.lock();

            inner.command_credits = inner.command_credits.saturating_add(restored_credits as u16);

            if let Some(opcode) = reply_opcode {
                loop {
                    let slot = match inner.outstanding_commands.pop_front() {
                        Some(slot) => slot,
                        None => {
                            log::warn!(
                                "Received a reply for opcode {:#06x} with no outstanding command",
                                opcode
                            );
                            break;
                        }
                    };

                    if slot.opcode != opcode {
                        log::error!(
                            "Reply opcode {:#06x} doesn't match the outstanding command \
                            {:#06x}, failing that command",
                            opcode,
                            slot.opcode
                        );

                        let protocol_error = Error::Protocol( format!(
                            "The controller replied to opcode {:#06x} while {:#06x} was \
                            outstanding",
                            opcode,
                            slot.opcode
                        ));

                        finished.push( (slot, Err(protocol_error)) );

                        // try to pair against the next outstanding command
                        continue;
                    }

                    if slot.expectation != kind {
                        let protocol_error = Error::Protocol( format!(
                            "Opcode {:#06x} expected {:?} but the controller sent {:?}",
                            opcode,
                            slot.expectation,
                            kind
                        ));

                        finished.push( (slot, Err(protocol_error)) );
                    }
                    else {
                        let command_return = CommandReturn {
                            opcode: opcode,
                            kind: kind,
                            status: status,
                            return_parameters: return_parameters.clone(),
                        };

                        finished.push( (slot, Ok(command_return)) );
                    }

                    break;
                }
            }

            self.try_issue_commands(&mut inner);
        }

        for (slot, result) in finished {
            slot.finish(result);
        }
    }

    fn process_le_meta(&self, packet: EventPacket) {
        let meta = match LeMetaData::try_from(packet.get_parameters()) {
            Ok(meta) => meta,
            Err(reason) => {
                log::error!("Dropping a malformed LE Meta event: {}", reason);
                return;
            }
        };

        let inner = self.lock();

        match inner.subevent_subscriptions.get(&meta.subevent_code) {
            Some(subscription) => subscription.deliver(packet),
            None => log::warn!(
                "Dropping an LE Meta event with subevent code {:#04x}, nothing subscribed",
                meta.subevent_code
            ),
        }
    }

    fn dispatch_event(&self, packet: EventPacket) {
        let inner = self.lock();

        match inner.event_subscriptions.get(&packet.get_event_code()) {
            Some(subscription) => subscription.deliver(packet),
            None => log::warn!(
                "Dropping an event with code {:#04x}, nothing subscribed",
                packet.get_event_code()
            ),
        }
    }

    fn process_acl_bytes(&self, bytes: &[u8]) {
        let packet = match AclPacket::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(reason) => {
                log::error!("Dropping a malformed inbound ACL packet: {}", reason);
                return;
            }
        };

        let inner = self.lock();

        match inner.acl_ingress {
            Some(ref ingress) => {
                let callback = ingress.callback.clone();

                ingress.handler.post(move || callback(packet));
            }
            None => log::warn!(
                "Dropping an inbound ACL fragment for handle {}, no consumer registered",
                packet.get_handle()
            ),
        }
    }
}

/// Forwards driver callbacks onto the HCI layer's handler
///
/// Holds the layer weakly so a dangling driver cannot keep a stopped stack alive.
struct HalEventForwarder {
    layer: Weak<HciLayer>,
}

impl HalCallbacks for HalEventForwarder {
    fn event_received(&self, packet: &[u8]) {
        if let Some(layer) = self.layer.upgrade() {
            let bytes = packet.to_vec();

            let for_task = layer.clone();

            layer.handler.post(move || for_task.process_event_bytes(&bytes));
        }
    }

    fn acl_received(&self, packet: &[u8]) {
        if let Some(layer) = self.layer.upgrade() {
            let bytes = packet.to_vec();

            let for_task = layer.clone();

            layer.handler.post(move || for_task.process_acl_bytes(&bytes));
        }
    }

    fn transport_closed(&self) {
        if let Some(layer) = self.layer.upgrade() {
            log::error!("The HCI transport closed underneath the stack");

            let for_task = layer.clone();

            layer.handler.post(move || for_task.shutdown());
        }
    }
}

/// A restricted view of [`HciLayer::enqueue_command`]
///
/// Each protocol component gets one of these rather than the whole layer, limited to the
/// opcodes that component legitimately issues. Submitting anything else is a programming error.
pub struct CommandInterface {
    layer: Arc<HciLayer>,
    name: &'static str,
    allowed: &'static [HciCommand],
}

impl CommandInterface {
    pub fn enqueue_command(
        &self,
        command: HciCommand,
        parameters: &[u8],
        expectation: ReplyExpectation,
        reply_handler: &Handler,
        callback: CommandCallback,
    ) {
        if !self.allowed.contains(&command) {
            panic!(
                "Command {:?} is outside the scope of the '{}' command interface",
                command,
                self.name
            );
        }

        self.layer.enqueue_command(
            CommandPacket::new(command, parameters),
            expectation,
            reply_handler,
            callback,
        );
    }
}

static ACL_CONNECTION_COMMANDS: &[HciCommand] = &[
    HciCommand::LinkControl(LinkControl::CreateConnection),
    HciCommand::LinkControl(LinkControl::CreateConnectionCancel),
    HciCommand::LinkControl(LinkControl::Disconnect),
    HciCommand::LeController(LeController::CreateConnection),
    HciCommand::LeController(LeController::CreateConnectionCancel),
];

static SECURITY_COMMANDS: &[HciCommand] = &[
    HciCommand::LinkControl(LinkControl::AuthenticationRequested),
    HciCommand::LinkControl(LinkControl::SetConnectionEncryption),
];

static LE_SECURITY_COMMANDS: &[HciCommand] = &[
    HciCommand::LeController(LeController::StartEncryption),
    HciCommand::LeController(LeController::LongTermKeyRequestReply),
];

static ADVERTISING_COMMANDS: &[HciCommand] = &[
    HciCommand::LeController(LeController::SetAdvertisingParameters),
    HciCommand::LeController(LeController::SetAdvertisingData),
    HciCommand::LeController(LeController::SetAdvertisingEnable),
];

static SCANNING_COMMANDS: &[HciCommand] = &[
    HciCommand::LeController(LeController::SetScanParameters),
    HciCommand::LeController(LeController::SetScanEnable),
];

impl HciLayer {
    pub fn acl_command_interface( &self ) -> CommandInterface {
        CommandInterface {
            layer: self.shared(),
            name: "ACL connection management",
            allowed: ACL_CONNECTION_COMMANDS,
        }
    }

    pub fn security_command_interface( &self ) -> CommandInterface {
        CommandInterface {
            layer: self.shared(),
            name: "classic security",
            allowed: SECURITY_COMMANDS,
        }
    }

    pub fn le_security_command_interface( &self ) -> CommandInterface {
        CommandInterface {
            layer: self.shared(),
            name: "LE security",
            allowed: LE_SECURITY_COMMANDS,
        }
    }

    pub fn advertising_command_interface( &self ) -> CommandInterface {
        CommandInterface {
            layer: self.shared(),
            name: "advertising",
            allowed: ADVERTISING_COMMANDS,
        }
    }

    pub fn scanning_command_interface( &self ) -> CommandInterface {
        CommandInterface {
            layer: self.shared(),
            name: "scanning",
            allowed: SCANNING_COMMANDS,
        }
    }
}

struct HciModule {
    layer: Option<Arc<HciLayer>>,
}

fn new_hci_module() -> Box<dyn Module> {
    Box::new( HciModule { layer: None } )
}

pub static MODULE: ModuleDescriptor = ModuleDescriptor::new("hci", new_hci_module);

static HCI_DEPENDENCIES: &[&ModuleDescriptor] = &[&crate::hal::MODULE];

impl Module for HciModule {
    fn dependencies(&self) -> &'static [&'static ModuleDescriptor] {
        HCI_DEPENDENCIES
    }

    fn start(&mut self, context: &ModuleContext<'_>) -> Arc<dyn std::any::Any + Send + Sync> {
        let hal = context.get_dependency::<HalFacade>(&crate::hal::MODULE).get_hal();

        let layer = HciLayer::new( context.get_handler(), hal );

        self.layer = Some(layer.clone());

        layer
    }

    fn stop(&mut self) {
        if let Some(layer) = self.layer.take() {
            layer.shutdown();
        }
    }
}
