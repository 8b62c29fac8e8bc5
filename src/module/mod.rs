//! The module runtime
//!
//! Every component of the stack is a [`Module`]: a named unit with a start step, a stop step and
//! a declared list of other modules it depends on. The [`ModuleRegistry`] owns starting and
//! stopping them. Starting is dependency first, so a module can rely on everything it declared
//! being up before its own start step runs, and stopping is the exact reverse of the start order.
//!
//! Startup and shutdown are single threaded by contract. They run on the embedder's thread while
//! the stack [`Thread`](thread/struct.Thread.html) is the one that will run every callback after
//! start. Violating any part of the contract here (starting twice, asking for an undeclared
//! dependency, a dependency cycle) is a programming error and panics with a diagnostic rather
//! than limping along with a half started stack.

pub mod thread;

use std::any::Any;
use std::ptr;
use std::sync::Arc;

use self::thread::{Handler, Thread};

/// The identity of a module
///
/// Descriptors are declared as `static` items, one per module, and identity is the address of
/// the static. The constructor is only invoked by the registry, at most once.
pub struct ModuleDescriptor {
    name: &'static str,
    new_instance: fn() -> Box<dyn Module>,
}

impl ModuleDescriptor {
    pub const fn new( name: &'static str, new_instance: fn() -> Box<dyn Module> ) -> Self {
        ModuleDescriptor { name, new_instance }
    }

    pub fn get_name(&self) -> &'static str {
        self.name
    }
}

/// A long lived unit of the stack
///
/// `start` returns the module's *facade*, the shared object other modules reach it through. The
/// facade is handed out by [`ModuleRegistry::get`] and
/// [`ModuleContext::get_dependency`], both of which downcast it back to its concrete type.
pub trait Module: Send {
    /// The modules that must be started before this one
    fn dependencies(&self) -> &'static [&'static ModuleDescriptor] {
        &[]
    }

    fn start(&mut self, context: &ModuleContext<'_>) -> Arc<dyn Any + Send + Sync>;

    fn stop(&mut self);
}

/// What a module gets to see while its start step runs
pub struct ModuleContext<'a> {
    registry: &'a ModuleRegistry,
    handler: Handler,
    module_name: &'static str,
    dependencies: &'static [&'static ModuleDescriptor],
}

impl<'a> ModuleContext<'a> {
    /// The task queue every callback for this module must go through
    pub fn get_handler(&self) -> Handler {
        self.handler.clone()
    }

    /// Fetch the facade of a declared dependency
    ///
    /// # Panics
    /// The descriptor must appear in the calling module's declared dependency list. Asking for
    /// anything else is a programming error.
    pub fn get_dependency<T>(&self, descriptor: &'static ModuleDescriptor) -> Arc<T>
    where T: Any + Send + Sync
    {
        let declared = self.dependencies.iter().any(|d| ptr::eq(*d, descriptor));

        if !declared {
            panic!(
                "Module '{}' requested '{}' which is not among its declared dependencies",
                self.module_name,
                descriptor.get_name()
            );
        }

        self.registry.get::<T>(descriptor)
    }
}

struct StartedModule {
    descriptor: &'static ModuleDescriptor,
    instance: Box<dyn Module>,
    facade: Arc<dyn Any + Send + Sync>,
    handler: Handler,
}

/// The ordered container of started modules
///
/// Not thread safe, and not meant to be. `start` and `stop` run before the first and after the
/// last module callback respectively.
pub struct ModuleRegistry {
    started: Vec<StartedModule>,
    starting: Vec<&'static ModuleDescriptor>,
    provided: Vec<(&'static ModuleDescriptor, Box<dyn Module>)>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry {
            started: Vec::new(),
            starting: Vec::new(),
            provided: Vec::new(),
        }
    }

    /// Hand the registry a pre built instance for a descriptor
    ///
    /// Used for modules that cannot be default constructed, which in practice is the HAL module
    /// since the driver comes from the embedder. Must be called before `start`.
    pub fn provide( &mut self, descriptor: &'static ModuleDescriptor, instance: Box<dyn Module> ) {
        if self.is_started(descriptor) {
            panic!("Module '{}' was provided after it was started", descriptor.get_name());
        }

        self.provided.push((descriptor, instance));
    }

    /// Start every module in the transitive closure of `roots`
    pub fn start( &mut self, roots: &[&'static ModuleDescriptor], thread: &Thread ) {
        for root in roots.iter() {
            self.start_module(*root, thread);
        }
    }

    fn start_module( &mut self, descriptor: &'static ModuleDescriptor, thread: &Thread ) {
        if self.is_started(descriptor) {
            return;
        }

        if self.starting.iter().any(|d| ptr::eq(*d, descriptor)) {
            panic!(
                "Dependency cycle detected while starting module '{}'",
                descriptor.get_name()
            );
        }

        self.starting.push(descriptor);

        let mut instance = match self.take_provided(descriptor) {
            Some(provided) => provided,
            None => (descriptor.new_instance)(),
        };

        let dependencies = instance.dependencies();

        for dependency in dependencies.iter() {
            self.start_module(*dependency, thread);
        }

        log::debug!("Starting module '{}'", descriptor.get_name());

        let handler = thread.new_handler();

        let facade = {
            let context = ModuleContext {
                registry: &*self,
                handler: handler.clone(),
                module_name: descriptor.get_name(),
                dependencies: dependencies,
            };

            instance.start(&context)
        };

        self.starting.pop();

        self.started.push(StartedModule {
            descriptor,
            instance,
            facade,
            handler,
        });
    }

    fn take_provided( &mut self, descriptor: &'static ModuleDescriptor ) -> Option<Box<dyn Module>> {
        let position = self.provided.iter().position(|(d, _)| ptr::eq(*d, descriptor))?;

        Some(self.provided.remove(position).1)
    }

    pub fn is_started(&self, descriptor: &'static ModuleDescriptor) -> bool {
        self.started.iter().any(|m| ptr::eq(m.descriptor, descriptor))
    }

    /// Fetch a started module's facade
    ///
    /// # Panics
    /// The module must have been started, and `T` must be the facade type its start step
    /// returned. Anything else is a programming error.
    pub fn get<T>(&self, descriptor: &'static ModuleDescriptor) -> Arc<T>
    where T: Any + Send + Sync
    {
        let module = self.started
            .iter()
            .find(|m| ptr::eq(m.descriptor, descriptor))
            .unwrap_or_else(|| {
                panic!("Module '{}' was requested but never started", descriptor.get_name())
            });

        match module.facade.clone().downcast::<T>() {
            Ok(facade) => facade,
            Err(_) => panic!(
                "The facade of module '{}' is not of the requested type",
                descriptor.get_name()
            ),
        }
    }

    /// Stop every module in reverse start order
    ///
    /// Each module's stop step runs first, then its task queue is released. The registry is
    /// empty afterwards.
    pub fn stop(&mut self) {
        while let Some(mut module) = self.started.pop() {
            log::debug!("Stopping module '{}'", module.descriptor.get_name());

            module.instance.stop();

            module.handler.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.started.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    thread_local! {
        static LIFECYCLE_RECORD: RefCell<Vec<String>> = RefCell::new(Vec::new());
    }

    fn record( entry: &str ) {
        LIFECYCLE_RECORD.with(|r| r.borrow_mut().push(entry.to_string()));
    }

    fn take_record() -> Vec<String> {
        LIFECYCLE_RECORD.with(|r| r.borrow_mut().split_off(0))
    }

    struct FacadeA {
        value: usize,
    }

    struct ModuleA;

    fn new_module_a() -> Box<dyn Module> { Box::new(ModuleA) }

    static MODULE_A: ModuleDescriptor = ModuleDescriptor::new("a", new_module_a);

    impl Module for ModuleA {
        fn start(&mut self, _context: &ModuleContext<'_>) -> Arc<dyn std::any::Any + Send + Sync> {
            record("a:start");
            Arc::new(FacadeA { value: 37 })
        }

        fn stop(&mut self) {
            record("a:stop");
        }
    }

    struct FacadeB {
        seen_from_a: usize,
    }

    struct ModuleB;

    fn new_module_b() -> Box<dyn Module> { Box::new(ModuleB) }

    static MODULE_B: ModuleDescriptor = ModuleDescriptor::new("b", new_module_b);

    static MODULE_B_DEPS: [&'static ModuleDescriptor; 1] = [&MODULE_A];

    impl Module for ModuleB {
        fn dependencies(&self) -> &'static [&'static ModuleDescriptor] {
            &MODULE_B_DEPS
        }

        fn start(&mut self, context: &ModuleContext<'_>) -> Arc<dyn std::any::Any + Send + Sync> {
            record("b:start");

            let a = context.get_dependency::<FacadeA>(&MODULE_A);

            Arc::new(FacadeB { seen_from_a: a.value })
        }

        fn stop(&mut self) {
            record("b:stop");
        }
    }

    struct ModuleC;

    fn new_module_c() -> Box<dyn Module> { Box::new(ModuleC) }

    static MODULE_C: ModuleDescriptor = ModuleDescriptor::new("c", new_module_c);

    static MODULE_C_DEPS: [&'static ModuleDescriptor; 1] = [&MODULE_B];

    impl Module for ModuleC {
        fn dependencies(&self) -> &'static [&'static ModuleDescriptor] {
            &MODULE_C_DEPS
        }

        fn start(&mut self, _context: &ModuleContext<'_>) -> Arc<dyn std::any::Any + Send + Sync> {
            record("c:start");
            Arc::new(())
        }

        fn stop(&mut self) {
            record("c:stop");
        }
    }

    /// Declares nothing but asks for module a anyway
    struct SneakyModule;

    fn new_sneaky_module() -> Box<dyn Module> { Box::new(SneakyModule) }

    static SNEAKY_MODULE: ModuleDescriptor = ModuleDescriptor::new("sneaky", new_sneaky_module);

    impl Module for SneakyModule {
        fn start(&mut self, context: &ModuleContext<'_>) -> Arc<dyn std::any::Any + Send + Sync> {
            context.get_dependency::<FacadeA>(&MODULE_A);
            Arc::new(())
        }

        fn stop(&mut self) {}
    }

    #[test]
    fn dependency_first_start_and_reverse_stop() {
        let thread = Thread::new("test");
        let mut registry = ModuleRegistry::new();

        take_record();

        registry.start(&[&MODULE_C], &thread);

        assert_eq!( registry.len(), 3 );

        registry.stop();

        assert_eq!( registry.len(), 0 );

        assert_eq!(
            take_record(),
            ["a:start", "b:start", "c:start", "c:stop", "b:stop", "a:stop"]
        );
    }

    #[test]
    fn module_started_at_most_once() {
        let thread = Thread::new("test");
        let mut registry = ModuleRegistry::new();

        take_record();

        // Both roots pull in module a, which must only start once
        registry.start(&[&MODULE_B, &MODULE_A], &thread);

        assert_eq!( take_record(), ["a:start", "b:start"] );

        registry.stop();
    }

    #[test]
    fn dependency_facade_is_usable_during_start() {
        let thread = Thread::new("test");
        let mut registry = ModuleRegistry::new();

        registry.start(&[&MODULE_B], &thread);

        let b = registry.get::<FacadeB>(&MODULE_B);

        assert_eq!( b.seen_from_a, 37 );

        registry.stop();
        take_record();
    }

    #[test]
    #[should_panic]
    fn get_of_unstarted_module_panics() {
        let registry = ModuleRegistry::new();

        registry.get::<FacadeA>(&MODULE_A);
    }

    #[test]
    #[should_panic]
    fn undeclared_dependency_panics() {
        let thread = Thread::new("test");
        let mut registry = ModuleRegistry::new();

        registry.start(&[&MODULE_A, &SNEAKY_MODULE], &thread);
    }
}
