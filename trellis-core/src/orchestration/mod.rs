//! Shared job queue and the runtime that drains it.

pub mod interrupt;
pub mod job;
pub mod queue;
pub mod runtime;

pub use interrupt::*;
pub use job::*;
pub use queue::*;
pub use runtime::*;
