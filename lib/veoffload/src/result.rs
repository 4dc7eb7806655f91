use std::io;

/// Client-side failures. Worker-side resource failures (missing library,
/// missing symbol, failed allocation) are not errors at this level; they
/// surface as zero sentinels in the result word of a normal reply.
#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    /// The worker executable could not be launched.
    Spawn(io::ErrorKind),
    /// The worker socket did not come up within the retry window.
    Connect(io::ErrorKind),
    /// The context's communicator exited; the peer is unreachable.
    PeerLost,
}

pub type Result<T> = ::std::result::Result<T, Error>;
