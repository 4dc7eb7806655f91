//! Host-side client library for the stub VE offload runtime.
//!
//! A [`ProcHandle`] represents one worker process reached over a unix
//! stream socket. Each handle owns one or more [`Context`]s; a context is
//! the unit of request ordering and runs a background communicator thread
//! that alone touches the socket. Applications load libraries into the
//! worker, allocate and copy worker memory, and invoke worker-resident
//! functions asynchronously with typed argument lists.

pub mod args;
pub mod context;
pub mod proc;
pub mod result;

pub use crate::args::ArgList;
pub use crate::context::{Context, ContextState};
pub use crate::proc::ProcHandle;
pub use crate::result::{Error, Result};
pub use veowire::args::Intent;
