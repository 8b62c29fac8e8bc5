//! Event packets from the controller
//!
//! Every event carries a one byte event code and a one byte parameter length followed by the
//! parameters. [`EventPacket`] is the raw view that the dispatch tables in the HCI layer route
//! on, and the structs below it are the parsed forms of the events this stack consumes itself.
//! Events the stack merely forwards to a subscriber stay as raw packets, parsing those is the
//! subscriber's business.

use crate::hci::acl::ConnectionHandle;
use crate::hci::error::Status;
use crate::BluetoothDeviceAddress;

macro_rules! make_u16 {
    ( $packet:ident, $start:expr ) => {
        u16::from_le( $packet[$start] as u16 | ($packet[$start + 1] as u16) << 8 )
    };
}

/// "chews off" and returns the first byte of $packet, or a slice of $size bytes
macro_rules! chew {
    ( $packet:ident, $size:expr ) => {
        {
            let chewed = &$packet[..($size as usize)];
            $packet = &$packet[($size as usize)..];
            chewed
        }
    };
    ( $packet:ident ) => {
        {
            let chewed_byte = $packet[0];
            $packet = &$packet[1..];
            chewed_byte
        }
    };
}

macro_rules! chew_u16 {
    ( $packet:ident ) => {
        {
            let chewed = make_u16!($packet, 0);
            $packet = &$packet[2..];
            chewed
        }
    };
}

macro_rules! chew_handle {
    ( $packet:ident ) => {
        ConnectionHandle::try_from( chew_u16!($packet) & 0xFFF )
            .map_err(|e| alloc_str_err(e))?
    };
}

macro_rules! chew_baddr {
    ( $packet:ident ) => {
        {
            let mut address = BluetoothDeviceAddress::default();
            address.copy_from_slice( chew!($packet, 6) );
            address
        }
    };
}

fn alloc_str_err( e: &'static str ) -> String {
    e.to_string()
}

fn check_length( packet: &[u8], need: usize, what: &str ) -> Result<(), String> {
    if packet.len() < need {
        Err( format!("{} event parameters are too short ({} < {})", what, packet.len(), need) )
    } else {
        Ok(())
    }
}

/// The event codes this stack knows by name
#[derive(Debug,Clone,Copy,PartialEq,Eq,Hash)]
pub enum EventCode {
    InquiryComplete,
    ConnectionComplete,
    ConnectionRequest,
    DisconnectionComplete,
    AuthenticationComplete,
    EncryptionChange,
    CommandComplete,
    CommandStatus,
    RoleChange,
    NumberOfCompletedPackets,
    LeMeta,
}

impl EventCode {
    pub fn into_raw(&self) -> u8 {
        match *self {
            EventCode::InquiryComplete => 0x01,
            EventCode::ConnectionComplete => 0x03,
            EventCode::ConnectionRequest => 0x04,
            EventCode::DisconnectionComplete => 0x05,
            EventCode::AuthenticationComplete => 0x06,
            EventCode::EncryptionChange => 0x08,
            EventCode::CommandComplete => 0x0E,
            EventCode::CommandStatus => 0x0F,
            EventCode::RoleChange => 0x12,
            EventCode::NumberOfCompletedPackets => 0x13,
            EventCode::LeMeta => 0x3E,
        }
    }

    pub fn from_raw( raw: u8 ) -> Option<Self> {
        match raw {
            0x01 => Some(EventCode::InquiryComplete),
            0x03 => Some(EventCode::ConnectionComplete),
            0x04 => Some(EventCode::ConnectionRequest),
            0x05 => Some(EventCode::DisconnectionComplete),
            0x06 => Some(EventCode::AuthenticationComplete),
            0x08 => Some(EventCode::EncryptionChange),
            0x0E => Some(EventCode::CommandComplete),
            0x0F => Some(EventCode::CommandStatus),
            0x12 => Some(EventCode::RoleChange),
            0x13 => Some(EventCode::NumberOfCompletedPackets),
            0x3E => Some(EventCode::LeMeta),
            _ => None,
        }
    }
}

/// Subevent codes of the LE meta event
#[derive(Debug,Clone,Copy,PartialEq,Eq,Hash)]
pub enum LeSubeventCode {
    ConnectionComplete,
    AdvertisingReport,
    ConnectionUpdateComplete,
    LongTermKeyRequest,
}

impl LeSubeventCode {
    pub fn into_raw(&self) -> u8 {
        match *self {
            LeSubeventCode::ConnectionComplete => 0x01,
            LeSubeventCode::AdvertisingReport => 0x02,
            LeSubeventCode::ConnectionUpdateComplete => 0x03,
            LeSubeventCode::LongTermKeyRequest => 0x05,
        }
    }

    pub fn from_raw( raw: u8 ) -> Option<Self> {
        match raw {
            0x01 => Some(LeSubeventCode::ConnectionComplete),
            0x02 => Some(LeSubeventCode::AdvertisingReport),
            0x03 => Some(LeSubeventCode::ConnectionUpdateComplete),
            0x05 => Some(LeSubeventCode::LongTermKeyRequest),
            _ => None,
        }
    }
}

/// A raw event as received from the HAL
///
/// The header (event code and parameter length) is validated on construction, the parameters are
/// kept as bytes for whoever subscribed to the code.
#[derive(Debug,Clone)]
pub struct EventPacket {
    event_code: u8,
    parameters: Box<[u8]>,
}

impl EventPacket {
    pub fn from_bytes( packet: &[u8] ) -> Result<Self, String> {
        if packet.len() < 2 {
            return Err( "Event packet is shorter than the event header".to_string() );
        }

        let parameter_length = packet[1] as usize;

        if packet.len() - 2 != parameter_length {
            return Err( format!(
                "Event parameter length field is {} but {} parameter bytes were received",
                parameter_length,
                packet.len() - 2
            ));
        }

        Ok( EventPacket {
            event_code: packet[0],
            parameters: Box::from(&packet[2..]),
        })
    }

    pub fn get_event_code(&self) -> u8 {
        self.event_code
    }

    pub fn get_parameters(&self) -> &[u8] {
        &self.parameters
    }
}

/// The controller finished a command and returned its result
#[derive(Debug,Clone)]
pub struct CommandCompleteData {
    pub number_of_hci_command_packets: u8,
    /// `None` when the controller sent a credit only update (opcode zero)
    pub command_opcode: Option<u16>,
    pub return_parameters: Box<[u8]>,
}

impl CommandCompleteData {
    pub fn try_from( mut packet: &[u8] ) -> Result<Self, String> {
        check_length(packet, 3, "Command Complete")?;

        let number_of_hci_command_packets = chew!(packet);

        let opcode = chew_u16!(packet);

        Ok( CommandCompleteData {
            number_of_hci_command_packets,
            command_opcode: if opcode != 0 { Some(opcode) } else { None },
            return_parameters: Box::from(packet),
        })
    }
}

/// The controller accepted (or refused) a command that completes later
#[derive(Debug,Clone)]
pub struct CommandStatusData {
    pub status: Status,
    pub number_of_hci_command_packets: u8,
    pub command_opcode: Option<u16>,
}

impl CommandStatusData {
    pub fn try_from( mut packet: &[u8] ) -> Result<Self, String> {
        check_length(packet, 4, "Command Status")?;

        let status = Status::from_raw( chew!(packet) );

        let number_of_hci_command_packets = chew!(packet);

        let opcode = chew_u16!(packet);

        Ok( CommandStatusData {
            status,
            number_of_hci_command_packets,
            command_opcode: if opcode != 0 { Some(opcode) } else { None },
        })
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum LinkType {
    ScoConnection,
    AclConnection,
    EscoConnection,
}

impl LinkType {
    fn try_from( raw: u8 ) -> Result<Self, String> {
        match raw {
            0x00 => Ok(LinkType::ScoConnection),
            0x01 => Ok(LinkType::AclConnection),
            0x02 => Ok(LinkType::EscoConnection),
            _ => Err( format!("Unknown link type {:#04x}", raw) ),
        }
    }
}

/// A classic connection attempt finished
#[derive(Debug,Clone)]
pub struct ConnectionCompleteData {
    pub status: Status,
    pub connection_handle: ConnectionHandle,
    pub address: BluetoothDeviceAddress,
    pub link_type: LinkType,
    pub encryption_enabled: bool,
}

impl ConnectionCompleteData {
    pub fn try_from( mut packet: &[u8] ) -> Result<Self, String> {
        check_length(packet, 11, "Connection Complete")?;

        let status = Status::from_raw( chew!(packet) );

        let connection_handle = chew_handle!(packet);

        let address = chew_baddr!(packet);

        let link_type = LinkType::try_from( chew!(packet) )?;

        let encryption_enabled = chew!(packet) != 0;

        Ok( ConnectionCompleteData {
            status,
            connection_handle,
            address,
            link_type,
            encryption_enabled,
        })
    }
}

/// A connection went away
#[derive(Debug,Clone)]
pub struct DisconnectionCompleteData {
    pub status: Status,
    pub connection_handle: ConnectionHandle,
    pub reason: Status,
}

impl DisconnectionCompleteData {
    pub fn try_from( mut packet: &[u8] ) -> Result<Self, String> {
        check_length(packet, 4, "Disconnection Complete")?;

        let status = Status::from_raw( chew!(packet) );

        let connection_handle = chew_handle!(packet);

        let reason = Status::from_raw( chew!(packet) );

        Ok( DisconnectionCompleteData { status, connection_handle, reason } )
    }
}

/// The controller freed outbound ACL buffers
///
/// Each entry is a connection handle together with how many packets for that handle left the
/// controller's buffer since the last report.
#[derive(Debug,Clone)]
pub struct NumberOfCompletedPacketsData {
    pub completed: Vec<(ConnectionHandle, u16)>,
}

impl NumberOfCompletedPacketsData {
    pub fn try_from( mut packet: &[u8] ) -> Result<Self, String> {
        check_length(packet, 1, "Number Of Completed Packets")?;

        let handle_count = chew!(packet) as usize;

        check_length(packet, handle_count * 4, "Number Of Completed Packets")?;

        let mut completed = Vec::with_capacity(handle_count);

        for _ in 0..handle_count {
            let handle = chew_handle!(packet);

            let count = chew_u16!(packet);

            completed.push( (handle, count) );
        }

        Ok( NumberOfCompletedPacketsData { completed } )
    }
}

/// The raw view of an LE meta event, split into the subevent code and its parameters
#[derive(Debug,Clone)]
pub struct LeMetaData {
    pub subevent_code: u8,
    pub parameters: Box<[u8]>,
}

impl LeMetaData {
    pub fn try_from( packet: &[u8] ) -> Result<Self, String> {
        check_length(packet, 1, "LE Meta")?;

        Ok( LeMetaData {
            subevent_code: packet[0],
            parameters: Box::from(&packet[1..]),
        })
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum LeConnectionRole {
    Central,
    Peripheral,
}

/// An LE connection attempt finished (LE meta subevent)
#[derive(Debug,Clone)]
pub struct LeConnectionCompleteData {
    pub status: Status,
    pub connection_handle: ConnectionHandle,
    pub role: LeConnectionRole,
    pub peer_address_type: u8,
    pub peer_address: BluetoothDeviceAddress,
    pub connection_interval: u16,
    pub connection_latency: u16,
    pub supervision_timeout: u16,
}

impl LeConnectionCompleteData {
    pub fn try_from( mut packet: &[u8] ) -> Result<Self, String> {
        check_length(packet, 18, "LE Connection Complete")?;

        let status = Status::from_raw( chew!(packet) );

        let connection_handle = chew_handle!(packet);

        let role = match chew!(packet) {
            0x00 => LeConnectionRole::Central,
            0x01 => LeConnectionRole::Peripheral,
            role => return Err( format!("Unknown LE connection role {:#04x}", role) ),
        };

        let peer_address_type = chew!(packet);

        let peer_address = chew_baddr!(packet);

        let connection_interval = chew_u16!(packet);

        let connection_latency = chew_u16!(packet);

        let supervision_timeout = chew_u16!(packet);

        Ok( LeConnectionCompleteData {
            status,
            connection_handle,
            role,
            peer_address_type,
            peer_address,
            connection_interval,
            connection_latency,
            supervision_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_packet_header_checks() {
        assert!( EventPacket::from_bytes(&[0x0E]).is_err() );

        // length field says 4 parameter bytes, only 3 present
        assert!( EventPacket::from_bytes(&[0x0E, 4, 1, 0x03, 0x0C]).is_err() );

        let packet = EventPacket::from_bytes(&[0x0E, 4, 1, 0x03, 0x0C, 0x00]).unwrap();

        assert_eq!( packet.get_event_code(), 0x0E );
        assert_eq!( packet.get_parameters(), &[1, 0x03, 0x0C, 0x00] );
    }

    #[test]
    fn command_complete_parse() {
        // one credit, opcode 0x0C03 (reset), one byte of return parameters (status)
        let data = CommandCompleteData::try_from(&[1, 0x03, 0x0C, 0x00]).unwrap();

        assert_eq!( data.number_of_hci_command_packets, 1 );
        assert_eq!( data.command_opcode, Some(0x0C03) );
        assert_eq!( &*data.return_parameters, &[0x00] );
    }

    #[test]
    fn command_complete_credit_only() {
        let data = CommandCompleteData::try_from(&[2, 0x00, 0x00]).unwrap();

        assert_eq!( data.number_of_hci_command_packets, 2 );
        assert_eq!( data.command_opcode, None );
    }

    #[test]
    fn command_status_parse() {
        let data = CommandStatusData::try_from(&[0x0C, 1, 0x05, 0x04]).unwrap();

        assert_eq!( data.status, Status::CommandDisallowed );
        assert_eq!( data.number_of_hci_command_packets, 1 );
        assert_eq!( data.command_opcode, Some(0x0405) );
    }

    #[test]
    fn connection_complete_parse() {
        let raw = [
            0x00,                               // success
            0x40, 0x00,                         // handle 0x0040
            0x13, 0x71, 0xDA, 0x7D, 0x1A, 0x00, // address
            0x01,                               // ACL
            0x00,                               // no encryption
        ];

        let data = ConnectionCompleteData::try_from(&raw).unwrap();

        assert!( data.status.is_success() );
        assert_eq!( data.connection_handle.get_raw_handle(), 0x0040 );
        assert_eq!( data.address, [0x13, 0x71, 0xDA, 0x7D, 0x1A, 0x00] );
        assert_eq!( data.link_type, LinkType::AclConnection );
        assert!( !data.encryption_enabled );
    }

    #[test]
    fn disconnection_complete_parse() {
        let data = DisconnectionCompleteData::try_from(&[0x00, 0x40, 0x00, 0x13]).unwrap();

        assert!( data.status.is_success() );
        assert_eq!( data.connection_handle.get_raw_handle(), 0x0040 );
        assert_eq!( data.reason, Status::RemoteUserTerminatedConnection );
    }

    #[test]
    fn number_of_completed_packets_parse() {
        let raw = [
            2,                      // two handles
            0x40, 0x00, 0x03, 0x00, // handle 0x0040, 3 packets
            0x41, 0x00, 0x01, 0x00, // handle 0x0041, 1 packet
        ];

        let data = NumberOfCompletedPacketsData::try_from(&raw).unwrap();

        assert_eq!( data.completed.len(), 2 );
        assert_eq!( data.completed[0].0.get_raw_handle(), 0x0040 );
        assert_eq!( data.completed[0].1, 3 );
        assert_eq!( data.completed[1].0.get_raw_handle(), 0x0041 );
        assert_eq!( data.completed[1].1, 1 );
    }

    #[test]
    fn number_of_completed_packets_short() {
        assert!( NumberOfCompletedPacketsData::try_from(&[2, 0x40, 0x00, 0x03, 0x00]).is_err() );
    }

    #[test]
    fn le_connection_complete_parse() {
        let raw = [
            0x00,                               // success
            0x41, 0x00,                         // handle
            0x01,                               // peripheral
            0x00,                               // public address
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, // address
            0x28, 0x00,                         // interval
            0x00, 0x00,                         // latency
            0xC8, 0x00,                         // supervision timeout
            0x00,                               // clock accuracy
        ];

        let mut event_parameters = vec![ LeSubeventCode::ConnectionComplete.into_raw() ];

        event_parameters.extend_from_slice(&raw);

        let meta = LeMetaData::try_from(&event_parameters).unwrap();

        assert_eq!( meta.subevent_code, 0x01 );

        let data = LeConnectionCompleteData::try_from(meta.parameters.as_ref()).unwrap();

        assert!( data.status.is_success() );
        assert_eq!( data.connection_handle.get_raw_handle(), 0x0041 );
        assert_eq!( data.role, LeConnectionRole::Peripheral );
        assert_eq!( data.connection_interval, 0x0028 );
    }
}
