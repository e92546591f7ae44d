//! Target side of the debugger: the part that runs inside a worker process.

pub mod attach;
pub mod breakpoint;
pub mod command;
mod entry;
pub mod error;
pub mod process;
pub mod session;
pub mod transport;
mod worker;

pub use entry::{Caller, Catalog};
pub use worker::{StopOutcome, Worker};
