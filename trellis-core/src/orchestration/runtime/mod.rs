//! Worker runtime: polling loops per job type, the table of jobs running in
//! this process, and the manager that owns both.

mod cancel;
mod live;
mod manager;
mod worker;

pub use cancel::*;
pub use live::*;
pub use manager::*;
pub use worker::*;
