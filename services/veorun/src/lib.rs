//! Worker side of the stub VE offload runtime.
//!
//! The binary binds a per-pid unix socket, accepts one connection per
//! client context and serves each connection with a dispatcher thread
//! that executes commands strictly sequentially: dynamic library
//! management, memory operations and C-ABI calls into loaded code.

pub mod dispatcher;
pub mod engine;
pub mod memory;
pub mod server;
