//! The driver boundary
//!
//! Everything below the HCI layer is somebody else's code. The stack only ever sees the
//! controller through [`HciHal`], a byte level duplex pipe with the standard four logical
//! channels (command TX, event RX, ACL TX, ACL RX), and the driver only ever talks back through
//! [`HalCallbacks`]. Bytes crossing this boundary are exact HCI packets without the UART packet
//! indicator, framing them per transport is the driver's problem.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::module::{Module, ModuleContext, ModuleDescriptor};

/// Calls from the driver up into the stack
///
/// A driver must not call back into [`HciHal`](trait.HciHal.html) from inside these, they are
/// invoked from the driver's own read context and the stack posts the real work to its thread.
pub trait HalCallbacks: Send + Sync {
    /// A complete HCI event packet arrived from the controller
    fn event_received(&self, packet: &[u8]);

    /// A complete HCI ACL data packet arrived from the controller
    fn acl_received(&self, packet: &[u8]);

    /// The transport is gone and no further packets will arrive
    fn transport_closed(&self);
}

/// A host controller interface driver
pub trait HciHal: Send + Sync {
    /// Hand the driver the stack's receive callbacks
    ///
    /// Called exactly once, while the HCI module starts.
    fn register_callbacks(&self, callbacks: Arc<dyn HalCallbacks>);

    /// Send a complete HCI command packet to the controller
    fn send_command(&self, packet: &[u8]);

    /// Send a complete HCI ACL data packet to the controller
    fn send_acl(&self, packet: &[u8]);

    /// Drop the registered callbacks and release the transport
    fn close(&self);
}

fn new_unprovided() -> Box<dyn Module> {
    panic!(
        "The HCI HAL must be provided by the embedder (see ModuleRegistry::provide), it has no \
        default construction"
    );
}

pub static MODULE: ModuleDescriptor = ModuleDescriptor::new("hal", new_unprovided);

/// The facade of the HAL module
pub struct HalFacade {
    hal: Arc<dyn HciHal>,
}

impl HalFacade {
    pub fn get_hal(&self) -> Arc<dyn HciHal> {
        self.hal.clone()
    }
}

/// Module wrapper around an embedder supplied driver
pub struct ProvidedHal {
    hal: Mutex<Option<Arc<dyn HciHal>>>,
}

impl ProvidedHal {
    pub fn new( hal: Arc<dyn HciHal> ) -> Self {
        ProvidedHal {
            hal: Mutex::new(Some(hal)),
        }
    }
}

impl Module for ProvidedHal {
    fn start(&mut self, _context: &ModuleContext<'_>) -> Arc<dyn Any + Send + Sync> {
        let hal = self.hal
            .lock()
            .expect("ProvidedHal poisoned")
            .take()
            .expect("ProvidedHal started twice");

        Arc::new(HalFacade { hal })
    }

    fn stop(&mut self) {}
}
