//! Shared wire protocol between the offload client library and the
//! `stub-veorun` worker: message framing, the command/argument tag model
//! and the logging setup used on both sides of the socket.

pub mod args;
pub mod codec;
pub mod logging;
pub mod message;

use std::path::PathBuf;

/// Name of the worker executable, resolved through PATH when
/// [`WORKER_BIN_ENV_VAR`] is not set.
pub const WORKER_BIN: &str = "stub-veorun";

/// Environment variable overriding the worker executable path.
pub const WORKER_BIN_ENV_VAR: &str = "VEORUN_BIN";

/// Rendezvous socket path for the worker process with the given pid.
/// The worker binds it on startup and unlinks it on exit.
pub fn socket_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/stub-veorun.{}.sock", pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_embeds_pid() {
        let path = socket_path(4242);

        assert_eq!(path.to_str().unwrap(), "/tmp/stub-veorun.4242.sock");
    }
}
