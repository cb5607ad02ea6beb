// Task trees, their scheduler, and the polling primitive leaves wait with

pub mod scheduler;
pub mod task;
pub mod waiter;

pub use scheduler::*;
pub use task::*;
pub use waiter::*;
