//! Stack bring up and tear down
//!
//! [`StackManager`] is the embedder's one stop entry point. Give it a driver, get a running
//! stack back: the module registry started with the standard module list (the ACL manager root
//! pulls the scheduler, controller and HCI layer in through the dependency graph) on one worker
//! thread. Shutting down stops the modules in reverse and joins the thread.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use blue_host::stack::StackManager;
//! # use blue_host::acl::AclManager;
//! # fn embedder_hal() -> Arc<dyn blue_host::hal::HciHal> { unimplemented!() }
//! let stack = StackManager::start( embedder_hal() );
//!
//! let acl = stack.get::<AclManager>(&blue_host::acl::MODULE);
//!
//! // ... connect, talk, disconnect ...
//!
//! stack.shutdown();
//! ```

use std::any::Any;
use std::sync::Arc;

use crate::hal::{HciHal, ProvidedHal};
use crate::module::thread::{Handler, Thread};
use crate::module::{ModuleDescriptor, ModuleRegistry};

/// The standard root list
///
/// Everything else comes in as a dependency of these.
static STANDARD_MODULES: &[&ModuleDescriptor] = &[&crate::acl::MODULE];

/// An owned, running stack
pub struct StackManager {
    thread: Thread,
    registry: ModuleRegistry,
}

impl StackManager {
    /// Bring the whole stack up on top of the given driver
    ///
    /// Returns once every module has started, which includes the controller interrogation, so
    /// the driver must already be able to move packets.
    ///
    /// # Panics
    /// Startup is all or nothing. A controller or driver that fails mid start panics the
    /// calling thread with a diagnostic.
    pub fn start( hal: Arc<dyn HciHal> ) -> Self {
        let thread = Thread::new("bt_stack");

        let mut registry = ModuleRegistry::new();

        registry.provide( &crate::hal::MODULE, Box::new(ProvidedHal::new(hal)) );

        registry.start( STANDARD_MODULES, &thread );

        log::debug!("The stack is up with {} modules", registry.len());

        StackManager { thread, registry }
    }

    /// Fetch a started module's facade, see [`ModuleRegistry::get`]
    pub fn get<T>( &self, descriptor: &'static ModuleDescriptor ) -> Arc<T>
    where T: Any + Send + Sync
    {
        self.registry.get::<T>(descriptor)
    }

    /// A fresh task queue on the stack thread, for embedder callbacks
    pub fn new_handler(&self) -> Handler {
        self.thread.new_handler()
    }

    /// Stop every module in reverse start order and join the stack thread
    pub fn shutdown( mut self ) {
        self.registry.stop();

        self.thread.stop();
    }
}
