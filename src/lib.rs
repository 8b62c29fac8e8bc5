//! A host-side Bluetooth stack core
//!
//! This crate implements the host half of the Host Controller Interface (HCI) as per the
//! bluetooth specification, along with the flow control machinery that sits between the
//! bluetooth controller and the protocol layers above the HCI (L2CAP and friends).
//!
//! The crate is organized as a set of *modules* in the lifecycle sense, not just the rust sense.
//! Every component (the HCI layer, the controller information component, the ACL manager and its
//! scheduler) is brought up and torn down by the [`module`](module/index.html) runtime, and every
//! callback addressed to a component is serialized through that component's
//! [`Handler`](module/thread/struct.Handler.html).
//!
//! The controller itself is reached through the driver traits in [`hal`](hal/index.html). No
//! operating system driver ships with this crate; the embedder provides one and hands it to
//! [`StackManager`](stack/struct.StackManager.html), which owns the standard module list.
//!
//! Data sent to a peer device goes through an
//! [`AclConnection`](acl/struct.AclConnection.html)'s queue end as whole upper layer payloads.
//! The [round robin scheduler](acl/scheduler/index.html) fragments those payloads to the
//! controller's buffer size and spends controller buffer credits on each fragment, which is the
//! part of the stack that keeps one chatty connection from starving every other one.

pub mod module;
pub mod hal;
pub mod hci;
pub mod controller;
pub mod acl;
pub mod stack;

#[cfg(test)]
pub(crate) mod test_util;

/// The address of a bluetooth device
pub type BluetoothDeviceAddress = [u8; 6];

pub fn bluetooth_address_from_string( addr: &str ) -> Result<BluetoothDeviceAddress, &'static str> {
    let mut address = BluetoothDeviceAddress::default();

    let mut addr_itr = address.iter_mut();

    for val in addr.split(':').rev() {
        if let Some(byte) = addr_itr.next() {
            *byte = u8::from_str_radix(&val, 16).or(Err("Address contains invalid characters"))?;
        } else {
            return Err("Address contains too many bytes");
        }
    }

    if addr_itr.next().is_none() {
        Ok(address)
    } else {
        Err("Address is missing bytes")
    }
}

pub fn bluetooth_address_into_string( addr: BluetoothDeviceAddress ) -> String {
    addr.iter()
        .rev()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_string_round_trip() {
        let addr_str = "00:1A:7D:DA:71:13";

        let addr = bluetooth_address_from_string(addr_str).unwrap();

        assert_eq!( addr, [0x13, 0x71, 0xDA, 0x7D, 0x1A, 0x00] );

        assert_eq!( bluetooth_address_into_string(addr), addr_str );
    }

    #[test]
    fn address_string_invalid() {
        assert!( bluetooth_address_from_string("00:1A:7D:DA:71").is_err() );
        assert!( bluetooth_address_from_string("00:1A:7D:DA:71:13:55").is_err() );
        assert!( bluetooth_address_from_string("00:1A:7D:DA:71:GG").is_err() );
    }
}
