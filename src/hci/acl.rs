//! ACL data packet framing
//!
//! An ACL data packet on the HCI is a 4 byte header followed by the data: a 12 bit connection
//! handle, a 2 bit packet boundary flag, a 2 bit broadcast flag and a 16 bit little endian data
//! length. This module owns that framing plus the payload fragmentation used by the scheduler.
//! Nothing here reassembles fragments, that is for the layer above the HCI (L2CAP) to do.

use std::fmt;
use std::fmt::Display;

/// A controller assigned identifier for one ACL connection
#[derive(Debug,Clone,Copy,PartialEq,Eq,PartialOrd,Ord,Hash)]
pub struct ConnectionHandle {
    handle: u16,
}

impl ConnectionHandle {
    pub const MAX: u16 = 0x0EFF;

    /// Try to create a ConnectionHandle from a raw value
    ///
    /// # Error
    /// The raw value was greater than the maximum value.
    pub fn try_from( raw: u16 ) -> Result<ConnectionHandle, &'static str> {
        if raw <= ConnectionHandle::MAX {
            Ok( ConnectionHandle { handle: raw } )
        }
        else {
            Err( "Raw value larger than the maximum connection handle" )
        }
    }

    pub fn get_raw_handle(&self) -> u16 {
        self.handle
    }
}

impl Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#06x}", self.handle)
    }
}

/// The packet boundary flag of an ACL data packet
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum BoundaryFlag {
    FirstNonAutomaticallyFlushable,
    ContinuingFragment,
    FirstAutomaticallyFlushable,
    CompleteL2capPdu,
}

impl BoundaryFlag {
    /// The flag shifted into its place in the first 16 bits of the packet, host byte order
    fn get_shifted_val(&self) -> u16 {
        ( match *self {
            BoundaryFlag::FirstNonAutomaticallyFlushable => 0x0,
            BoundaryFlag::ContinuingFragment => 0x1,
            BoundaryFlag::FirstAutomaticallyFlushable => 0x2,
            BoundaryFlag::CompleteL2capPdu => 0x3,
        } ) << 12
    }

    fn from_shifted_val( val: u16 ) -> Self {
        match (val >> 12) & 3 {
            0x0 => BoundaryFlag::FirstNonAutomaticallyFlushable,
            0x1 => BoundaryFlag::ContinuingFragment,
            0x2 => BoundaryFlag::FirstAutomaticallyFlushable,
            0x3 => BoundaryFlag::CompleteL2capPdu,
            _ => panic!("This cannot happen"),
        }
    }
}

/// The broadcast flag of an ACL data packet
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum BroadcastFlag {
    PointToPoint,
    ActiveBroadcast,
}

impl BroadcastFlag {
    fn get_shifted_val(&self) -> u16 {
        ( match *self {
            BroadcastFlag::PointToPoint => 0x0,
            BroadcastFlag::ActiveBroadcast => 0x1,
        } ) << 14
    }

    fn try_from_shifted_val( val: u16 ) -> Result<Self, ()> {
        match (val >> 14) & 3 {
            0x0 => Ok( BroadcastFlag::PointToPoint ),
            0x1 => Ok( BroadcastFlag::ActiveBroadcast ),
            _ => Err( () ),
        }
    }
}

#[derive(Debug,Clone,Copy,PartialEq)]
pub enum AclFramingError {
    PacketTooSmall,
    LengthFieldMismatch,
    InvalidBroadcastFlag,
    InvalidConnectionHandle(&'static str),
}

impl Display for AclFramingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AclFramingError::PacketTooSmall =>
                write!(f, "Packet is too small to be valid HCI ACL data"),
            AclFramingError::LengthFieldMismatch =>
                write!(f, "The length field doesn't match the data actually in the packet"),
            AclFramingError::InvalidBroadcastFlag =>
                write!(f, "Packet has an invalid broadcast flag"),
            AclFramingError::InvalidConnectionHandle(reason) =>
                write!(f, "Invalid connection handle, {}", reason),
        }
    }
}

/// One HCI ACL data packet
///
/// This is a single fragment as it crosses the HCI, not an upper layer payload. The `payload`
/// here is at most one buffer's worth of data as reported by the controller.
#[derive(Debug,Clone,PartialEq)]
pub struct AclPacket {
    connection_handle: ConnectionHandle,
    boundary_flag: BoundaryFlag,
    broadcast_flag: BroadcastFlag,
    payload: Box<[u8]>,
}

impl AclPacket {
    pub fn new(
        connection_handle: ConnectionHandle,
        boundary_flag: BoundaryFlag,
        broadcast_flag: BroadcastFlag,
        payload: Box<[u8]>,
    ) -> Self
    {
        AclPacket { connection_handle, boundary_flag, broadcast_flag, payload }
    }

    pub fn get_handle(&self) -> ConnectionHandle {
        self.connection_handle
    }

    pub fn get_payload(&self) -> &[u8] { &self.payload }

    pub fn get_boundary_flag(&self) -> BoundaryFlag { self.boundary_flag }

    pub fn get_broadcast_flag(&self) -> BroadcastFlag { self.broadcast_flag }

    /// Serialize into the bytes sent between the host and controller
    pub fn into_bytes(self) -> Box<[u8]> {
        let mut v = Vec::with_capacity( self.payload.len() + 4 );

        let first_2_bytes = self.connection_handle.get_raw_handle()
            | self.boundary_flag.get_shifted_val()
            | self.broadcast_flag.get_shifted_val();

        v.extend_from_slice( &first_2_bytes.to_le_bytes() );

        v.extend_from_slice( &(self.payload.len() as u16).to_le_bytes() );

        v.extend_from_slice( &self.payload );

        v.into_boxed_slice()
    }

    /// Attempt to create an `AclPacket` from received bytes
    pub fn from_bytes( packet: &[u8] ) -> Result<Self, AclFramingError> {
        if packet.len() < 4 {
            return Err( AclFramingError::PacketTooSmall );
        }

        let first_2_bytes = <u16>::from_le_bytes( [ packet[0], packet[1] ] );

        let connection_handle = ConnectionHandle::try_from( first_2_bytes & 0xFFF )
            .map_err(|e| AclFramingError::InvalidConnectionHandle(e))?;

        let boundary_flag = BoundaryFlag::from_shifted_val( first_2_bytes );

        let broadcast_flag = BroadcastFlag::try_from_shifted_val( first_2_bytes )
            .or( Err(AclFramingError::InvalidBroadcastFlag) )?;

        let length = <u16>::from_le_bytes( [ packet[2], packet[3] ] ) as usize;

        if packet.len() - 4 != length {
            return Err( AclFramingError::LengthFieldMismatch );
        }

        Ok(
            AclPacket {
                connection_handle: connection_handle,
                boundary_flag: boundary_flag,
                broadcast_flag: broadcast_flag,
                payload: Box::from( &packet[4..] ),
            }
        )
    }
}

/// Split an upper layer payload into ACL fragments no larger than `mtu`
///
/// The first fragment is marked `FirstAutomaticallyFlushable` and every following one
/// `ContinuingFragment`. An empty payload still produces one (empty) fragment so the upper
/// layer's message boundary survives the trip.
pub fn fragment_payload(
    connection_handle: ConnectionHandle,
    payload: &[u8],
    mtu: usize,
) -> Vec<AclPacket>
{
    assert!( mtu > 0, "Cannot fragment to a zero sized buffer" );

    if payload.is_empty() {
        return vec![
            AclPacket::new(
                connection_handle,
                BoundaryFlag::FirstAutomaticallyFlushable,
                BroadcastFlag::PointToPoint,
                Box::from(&[][..]),
            )
        ];
    }

    payload.chunks(mtu)
        .enumerate()
        .map(|(index, chunk)| {
            let boundary_flag = if index == 0 {
                BoundaryFlag::FirstAutomaticallyFlushable
            } else {
                BoundaryFlag::ContinuingFragment
            };

            AclPacket::new(
                connection_handle,
                boundary_flag,
                BroadcastFlag::PointToPoint,
                Box::from(chunk),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle( raw: u16 ) -> ConnectionHandle {
        ConnectionHandle::try_from(raw).unwrap()
    }

    #[test]
    fn handle_bounds() {
        assert!( ConnectionHandle::try_from(0x0EFF).is_ok() );
        assert!( ConnectionHandle::try_from(0x0F00).is_err() );
    }

    #[test]
    fn packet_byte_round_trip() {
        let packet = AclPacket::new(
            handle(0x0040),
            BoundaryFlag::FirstAutomaticallyFlushable,
            BroadcastFlag::PointToPoint,
            Box::from(&[1u8, 2, 3, 4, 5][..]),
        );

        let bytes = packet.into_bytes();

        // handle 0x0040 with boundary flag 0b10 in bits 12..14
        assert_eq!( &bytes[..4], &[0x40, 0x20, 0x05, 0x00] );

        let parsed = AclPacket::from_bytes(&bytes).unwrap();

        assert_eq!( parsed.get_handle(), handle(0x0040) );
        assert_eq!( parsed.get_boundary_flag(), BoundaryFlag::FirstAutomaticallyFlushable );
        assert_eq!( parsed.get_payload(), &[1, 2, 3, 4, 5] );
    }

    #[test]
    fn continuing_fragment_bytes() {
        let packet = AclPacket::new(
            handle(0x0EFF),
            BoundaryFlag::ContinuingFragment,
            BroadcastFlag::PointToPoint,
            Box::from(&[9u8][..]),
        );

        let bytes = packet.into_bytes();

        assert_eq!( &bytes[..4], &[0xFF, 0x1E, 0x01, 0x00] );
    }

    #[test]
    fn parse_rejects_short_and_mismatched() {
        assert_eq!( AclPacket::from_bytes(&[0, 0, 0]), Err(AclFramingError::PacketTooSmall) );

        // length field says 2 bytes but 1 byte follows
        assert_eq!(
            AclPacket::from_bytes(&[0x40, 0x20, 0x02, 0x00, 0xAA]),
            Err(AclFramingError::LengthFieldMismatch)
        );
    }

    #[test]
    fn empty_payload_is_one_fragment() {
        let fragments = fragment_payload(handle(0x0040), &[], 27);

        assert_eq!( fragments.len(), 1 );
        assert_eq!( fragments[0].get_payload().len(), 0 );
        assert_eq!(
            fragments[0].get_boundary_flag(),
            BoundaryFlag::FirstAutomaticallyFlushable
        );
    }

    #[test]
    fn payload_of_exactly_mtu_is_one_fragment() {
        let payload = [0xA5u8; 27];

        let fragments = fragment_payload(handle(0x0040), &payload, 27);

        assert_eq!( fragments.len(), 1 );
        assert_eq!(
            fragments[0].get_boundary_flag(),
            BoundaryFlag::FirstAutomaticallyFlushable
        );
    }

    #[test]
    fn payload_of_mtu_plus_one_is_two_fragments() {
        let payload = [0xA5u8; 28];

        let fragments = fragment_payload(handle(0x0040), &payload, 27);

        assert_eq!( fragments.len(), 2 );
        assert_eq!( fragments[0].get_payload().len(), 27 );
        assert_eq!( fragments[1].get_payload().len(), 1 );
        assert_eq!(
            fragments[0].get_boundary_flag(),
            BoundaryFlag::FirstAutomaticallyFlushable
        );
        assert_eq!( fragments[1].get_boundary_flag(), BoundaryFlag::ContinuingFragment );
    }

    #[test]
    fn sixty_byte_payload_at_mtu_27() {
        let payload = (0..60u8).collect::<Vec<_>>();

        let fragments = fragment_payload(handle(0x0042), &payload, 27);

        let sizes = fragments.iter().map(|f| f.get_payload().len()).collect::<Vec<_>>();

        assert_eq!( sizes, [27, 27, 6] );

        for fragment in fragments.iter() {
            assert_eq!( fragment.get_handle(), handle(0x0042) );
        }
    }

    #[test]
    fn reassembly_inverts_fragmentation() {
        for len in [0usize, 1, 26, 27, 28, 54, 55, 200].iter() {
            let payload = (0..*len).map(|i| i as u8).collect::<Vec<_>>();

            let fragments = fragment_payload(handle(0x0040), &payload, 27);

            let expected_count = std::cmp::max(1, (*len + 26) / 27);

            assert_eq!( fragments.len(), expected_count, "for payload length {}", len );

            let reassembled = fragments.iter()
                .flat_map(|f| f.get_payload().iter().cloned())
                .collect::<Vec<_>>();

            assert_eq!( reassembled, payload, "for payload length {}", len );
        }
    }
}
