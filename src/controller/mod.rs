//! The controller information component
//!
//! At stack startup this module interrogates the controller once, with a fixed command
//! sequence, and caches everything the rest of the stack needs to know about it: the public
//! device address, the supported command bitmap, feature pages, and above all the ACL buffer
//! geometry that the scheduler's credit accounting is built on. After startup the
//! [`Controller`] facade is nothing but pure reads on that immutable snapshot.
//!
//! The component also owns the `Number Of Completed Packets` event. Whoever needs controller
//! buffer credit returns (the scheduler) registers a callback here rather than touching the
//! event code itself.

use std::any::Any;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::hci::acl::ConnectionHandle;
use crate::hci::error::Error;
use crate::hci::events::{EventCode, NumberOfCompletedPacketsData};
use crate::hci::opcodes::{ControllerAndBaseband, HciCommand, InformationParameters, LeController};
use crate::hci::{CommandPacket, CommandReturn, HciLayer, ReplyExpectation};
use crate::module::thread::Handler;
use crate::module::{Module, ModuleContext, ModuleDescriptor};
use crate::BluetoothDeviceAddress;

/// Octet and bit of `LE Read Maximum Advertising Data Length` in the supported commands bitmap
const LE_READ_MAX_ADV_DATA_LENGTH_BIT: (usize, u8) = (36, 3);

/// The default maximum advertising data length for controllers without the extended read
const DEFAULT_MAX_ADVERTISING_DATA_LENGTH: u16 = 31;

/// Everything learned from the controller at startup
///
/// Immutable once built. Readers may call these from any thread without going through the
/// controller's handler.
pub struct ControllerCapabilities {
    address: BluetoothDeviceAddress,
    supported_commands: [u8; 64],
    features: u64,
    extended_features: Vec<u64>,
    acl_buffer_length: u16,
    acl_buffer_count: u16,
    le_buffer_length: u16,
    le_buffer_count: u16,
    le_features: u64,
    max_advertising_data_length: u16,
}

impl ControllerCapabilities {
    pub fn get_address(&self) -> BluetoothDeviceAddress {
        self.address
    }

    /// Largest ACL payload per classic fragment
    pub fn get_acl_buffer_length(&self) -> u16 {
        self.acl_buffer_length
    }

    /// How many classic ACL packets the controller can buffer
    pub fn get_acl_buffer_count(&self) -> u16 {
        self.acl_buffer_count
    }

    /// Largest ACL payload per LE fragment, zero when the LE transport shares classic buffers
    pub fn get_le_buffer_length(&self) -> u16 {
        self.le_buffer_length
    }

    /// How many LE ACL packets the controller can buffer, zero when shared with classic
    pub fn get_le_buffer_count(&self) -> u16 {
        self.le_buffer_count
    }

    pub fn get_features(&self) -> u64 {
        self.features
    }

    /// Feature mask for the given extended features page, if the controller has that page
    pub fn get_extended_features(&self, page: usize) -> Option<u64> {
        self.extended_features.get(page).copied()
    }

    pub fn get_le_features(&self) -> u64 {
        self.le_features
    }

    pub fn get_max_advertising_data_length(&self) -> u16 {
        self.max_advertising_data_length
    }

    /// Check one bit of the supported commands bitmap
    pub fn is_command_supported(&self, octet: usize, bit: u8) -> bool {
        debug_assert!( bit < 8 );

        self.supported_commands
            .get(octet)
            .map(|byte| byte & (1 << bit) != 0)
            .unwrap_or(false)
    }
}

struct CompletedPacketsSubscriber {
    handler: Handler,
    callback: Arc<dyn Fn(Vec<(ConnectionHandle, u16)>) + Send + Sync>,
}

/// The facade of the controller module
pub struct Controller {
    capabilities: ControllerCapabilities,
    completed_packets: Mutex<Option<CompletedPacketsSubscriber>>,
}

impl Controller {
    pub fn get_capabilities(&self) -> &ControllerCapabilities {
        &self.capabilities
    }

    /// Receive every `Number Of Completed Packets` report
    ///
    /// The callback gets the raw (handle, count) pairs of each event, posted to `handler`.
    ///
    /// # Panics
    /// One subscriber. The scheduler owns this in a running stack.
    pub fn register_completed_acl_packets_callback(
        &self,
        handler: &Handler,
        callback: Arc<dyn Fn(Vec<(ConnectionHandle, u16)>) + Send + Sync>,
    ) {
        let mut subscriber = self.completed_packets
            .lock()
            .expect("Controller state poisoned");

        if subscriber.is_some() {
            panic!("Completed ACL packets already have a subscriber");
        }

        *subscriber = Some( CompletedPacketsSubscriber {
            handler: handler.clone(),
            callback,
        });
    }

    fn on_number_of_completed_packets(&self, data: NumberOfCompletedPacketsData) {
        let subscriber = self.completed_packets
            .lock()
            .expect("Controller state poisoned");

        match *subscriber {
            Some(ref subscriber) => {
                let callback = subscriber.callback.clone();

                subscriber.handler.post(move || callback(data.completed));
            }
            None => log::warn!(
                "Dropping a Number Of Completed Packets report, nothing subscribed for credits"
            ),
        }
    }
}

/// Issue one command and block the (startup) thread until its reply arrives
fn issue(
    hci: &Arc<HciLayer>,
    handler: &Handler,
    command: HciCommand,
    parameters: &[u8],
) -> Result<CommandReturn, Error> {
    let (tx, rx) = mpsc::channel();

    hci.enqueue_command(
        CommandPacket::new(command, parameters),
        ReplyExpectation::CommandComplete,
        handler,
        Box::new(move |result| { tx.send(result).ok(); }),
    );

    rx.recv().unwrap_or( Err(Error::TransportClosed) )
}

/// Strip the leading status byte, turning a controller failure into an error
fn expect_success( command_return: CommandReturn ) -> Result<Box<[u8]>, Error> {
    if !command_return.status.is_success() {
        return Err( Error::Controller(command_return.status) );
    }

    if command_return.return_parameters.is_empty() {
        return Err( Error::Protocol("A capability read returned no parameters".to_string()) );
    }

    Ok( Box::from(&command_return.return_parameters[1..]) )
}

fn read_u16( parameters: &[u8], at: usize ) -> u16 {
    u16::from_le_bytes( [parameters[at], parameters[at + 1]] )
}

fn read_u64( parameters: &[u8], at: usize ) -> u64 {
    let mut bytes = [0u8; 8];

    bytes.copy_from_slice(&parameters[at..at + 8]);

    u64::from_le_bytes(bytes)
}

/// Run the startup interrogation
///
/// Commands are issued strictly one after another. The sequence resets the controller first so
/// the capability reads see a clean state, and reads the address last.
fn interrogate( hci: &Arc<HciLayer>, handler: &Handler ) -> Result<ControllerCapabilities, Error> {
    issue(
        hci,
        handler,
        HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset),
        &[],
    )
    .and_then(expect_success)?;

    let raw_commands = issue(
        hci,
        handler,
        HciCommand::InformationParameters(InformationParameters::ReadLocalSupportedCommands),
        &[],
    )
    .and_then(expect_success)?;

    let mut supported_commands = [0u8; 64];

    if raw_commands.len() >= 64 {
        supported_commands.copy_from_slice(&raw_commands[..64]);
    }
    else {
        return Err( Error::Protocol(
            "Read Local Supported Commands returned a short bitmap".to_string()
        ));
    }

    let raw_features = issue(
        hci,
        handler,
        HciCommand::InformationParameters(InformationParameters::ReadLocalSupportedFeatures),
        &[],
    )
    .and_then(expect_success)?;

    if raw_features.len() < 8 {
        return Err( Error::Protocol(
            "Read Local Supported Features returned a short feature mask".to_string()
        ));
    }

    let features = read_u64(&raw_features, 0);

    // page 0 tells us the maximum page, then each further page is its own read
    let mut extended_features = Vec::new();
    let mut page = 0u8;

    loop {
        let raw_page = issue(
            hci,
            handler,
            HciCommand::InformationParameters(InformationParameters::ReadLocalExtendedFeatures),
            &[page],
        )
        .and_then(expect_success)?;

        if raw_page.len() < 10 {
            return Err( Error::Protocol(
                "Read Local Extended Features returned short parameters".to_string()
            ));
        }

        let maximum_page = raw_page[1];

        extended_features.push( read_u64(&raw_page, 2) );

        if page >= maximum_page {
            break;
        }

        page += 1;
    }

    let raw_buffer_size = issue(
        hci,
        handler,
        HciCommand::InformationParameters(InformationParameters::ReadBufferSize),
        &[],
    )
    .and_then(expect_success)?;

    if raw_buffer_size.len() < 7 {
        return Err( Error::Protocol("Read Buffer Size returned short parameters".to_string()) );
    }

    let acl_buffer_length = read_u16(&raw_buffer_size, 0);
    let acl_buffer_count = read_u16(&raw_buffer_size, 3);

    let raw_le_buffer_size = issue(
        hci,
        handler,
        HciCommand::LeController(LeController::ReadBufferSize),
        &[],
    )
    .and_then(expect_success)?;

    if raw_le_buffer_size.len() < 3 {
        return Err( Error::Protocol("LE Read Buffer Size returned short parameters".to_string()) );
    }

    let le_buffer_length = read_u16(&raw_le_buffer_size, 0);
    let le_buffer_count = raw_le_buffer_size[2] as u16;

    let raw_le_features = issue(
        hci,
        handler,
        HciCommand::LeController(LeController::ReadLocalSupportedFeatures),
        &[],
    )
    .and_then(expect_success)?;

    if raw_le_features.len() < 8 {
        return Err( Error::Protocol(
            "LE Read Local Supported Features returned a short feature mask".to_string()
        ));
    }

    let le_features = read_u64(&raw_le_features, 0);

    let extended_read_supported = supported_commands
        [LE_READ_MAX_ADV_DATA_LENGTH_BIT.0]
        & (1 << LE_READ_MAX_ADV_DATA_LENGTH_BIT.1)
        != 0;

    let max_advertising_data_length = if extended_read_supported {
        let raw_length = issue(
            hci,
            handler,
            HciCommand::LeController(LeController::ReadMaximumAdvertisingDataLength),
            &[],
        )
        .and_then(expect_success)?;

        if raw_length.len() < 2 {
            return Err( Error::Protocol(
                "LE Read Maximum Advertising Data Length returned short parameters".to_string()
            ));
        }

        read_u16(&raw_length, 0)
    }
    else {
        DEFAULT_MAX_ADVERTISING_DATA_LENGTH
    };

    let raw_address = issue(
        hci,
        handler,
        HciCommand::InformationParameters(InformationParameters::ReadBD_ADDR),
        &[],
    )
    .and_then(expect_success)?;

    if raw_address.len() < 6 {
        return Err( Error::Protocol("Read BD_ADDR returned a short address".to_string()) );
    }

    let mut address = BluetoothDeviceAddress::default();

    address.copy_from_slice(&raw_address[..6]);

    Ok( ControllerCapabilities {
        address,
        supported_commands,
        features,
        extended_features,
        acl_buffer_length,
        acl_buffer_count,
        le_buffer_length,
        le_buffer_count,
        le_features,
        max_advertising_data_length,
    })
}

struct ControllerModule {
    hci: Option<Arc<HciLayer>>,
}

fn new_controller_module() -> Box<dyn Module> {
    Box::new( ControllerModule { hci: None } )
}

pub static MODULE: ModuleDescriptor = ModuleDescriptor::new("controller", new_controller_module);

static CONTROLLER_DEPENDENCIES: &[&ModuleDescriptor] = &[&crate::hci::MODULE];

impl Module for ControllerModule {
    fn dependencies(&self) -> &'static [&'static ModuleDescriptor] {
        CONTROLLER_DEPENDENCIES
    }

    fn start(&mut self, context: &ModuleContext<'_>) -> Arc<dyn Any + Send + Sync> {
        let hci = context.get_dependency::<HciLayer>(&crate::hci::MODULE);

        let handler = context.get_handler();

        let capabilities = match interrogate(&hci, &handler) {
            Ok(capabilities) => capabilities,
            Err(reason) => panic!("Controller initialization failed: {}", reason),
        };

        log::debug!(
            "Controller is {} with {} classic ACL buffers of {} bytes",
            crate::bluetooth_address_into_string(capabilities.get_address()),
            capabilities.get_acl_buffer_count(),
            capabilities.get_acl_buffer_length()
        );

        let controller = Arc::new( Controller {
            capabilities,
            completed_packets: Mutex::new(None),
        });

        let for_events = controller.clone();

        hci.register_event_handler(
            EventCode::NumberOfCompletedPackets,
            &handler,
            Arc::new(move |packet| {
                match NumberOfCompletedPacketsData::try_from(packet.get_parameters()) {
                    Ok(data) => for_events.on_number_of_completed_packets(data),
                    Err(reason) => log::error!(
                        "Dropping a malformed Number Of Completed Packets event: {}",
                        reason
                    ),
                }
            }),
        );

        self.hci = Some(hci);

        controller
    }

    fn stop(&mut self) {
        if let Some(hci) = self.hci.take() {
            hci.unregister_event_handler(EventCode::NumberOfCompletedPackets);
        }
    }
}
