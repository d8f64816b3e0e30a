//! The concrete actors hosted by the server

pub mod thread;
pub mod user;

pub use thread::{ThreadMachine, THREAD};
pub use user::{ThreadStatus, ThreadSummary, UserMachine, USER};

use kitchencraft_kit::Router;

/// Register every actor type with `router`
pub fn register(router: &Router) {
    router.register(UserMachine).register(ThreadMachine);
}
