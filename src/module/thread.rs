//! Execution contexts for stack modules
//!
//! A [`Thread`] is a named worker thread that does nothing but pull closures off of a channel and
//! run them. A [`Handler`] is the sending half of that arrangement, handed to one module so that
//! every callback addressed to the module runs serialized on the thread. Any number of handlers
//! can share one thread, the serialization guarantee is per handler *and* per thread since the
//! thread only ever runs one closure at a time.
//!
//! There is deliberately no way to block on the worker from inside a posted closure. A callback
//! suspends only by returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

enum ThreadMessage {
    Run(Box<dyn FnOnce() + Send>),
    Quit,
}

/// A worker thread for running module callbacks
///
/// Dropping the thread (or calling [`stop`](#method.stop)) sends the quit message and joins with
/// the worker, so every closure posted before the stop is run before the thread goes away.
pub struct Thread {
    name: String,
    sender: Arc<Mutex<mpsc::Sender<ThreadMessage>>>,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl Thread {
    pub fn new<N>( name: N ) -> Self where N: Into<String> {
        let name = name.into();

        let (sender, receiver) = mpsc::channel::<ThreadMessage>();

        let join_handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        ThreadMessage::Run(task) => task(),
                        ThreadMessage::Quit => break,
                    }
                }
            })
            .expect("Couldn't spawn the stack thread");

        Thread {
            name: name,
            sender: Arc::new(Mutex::new(sender)),
            join_handle: Some(join_handle),
        }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// Create a new task queue bound to this thread
    pub fn new_handler(&self) -> Handler {
        Handler {
            sender: self.sender.clone(),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Stop the worker
    ///
    /// Closures already posted are run before the worker exits. Calling this a second time does
    /// nothing.
    pub fn stop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            self.sender
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .send(ThreadMessage::Quit)
                .ok();

            if join_handle.join().is_err() {
                log::error!("The stack thread panicked before it could be joined");
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.stop()
    }
}

/// A task queue for one module
///
/// All closures posted through one handler run in post order on the handler's thread. After
/// [`clear`](#method.clear) further posts are dropped, which is how a stopping module keeps
/// late callbacks from touching state that is going away.
#[derive(Clone)]
pub struct Handler {
    sender: Arc<Mutex<mpsc::Sender<ThreadMessage>>>,
    open: Arc<AtomicBool>,
}

impl Handler {
    /// Post a closure to run on the handler's thread
    pub fn post<F>( &self, task: F ) where F: FnOnce() + Send + 'static {
        if !self.open.load(Ordering::Acquire) {
            log::warn!("Callback posted to a cleared handler was dropped");
            return;
        }

        let send_result = self.sender
            .lock()
            .expect("Thread sender poisoned")
            .send(ThreadMessage::Run(Box::new(task)));

        if send_result.is_err() {
            log::warn!("Callback posted after the stack thread stopped was dropped");
        }
    }

    /// Refuse all further posts
    pub fn clear(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_cleared(&self) -> bool {
        !self.open.load(Ordering::Acquire)
    }
}
