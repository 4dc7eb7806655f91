use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::io::{Read, Write};

/// Errors arising on the framed transport. Both undecodable frames and
/// low-level I/O failures are fatal to the connection that produced them.
#[derive(Debug, Eq, PartialEq)]
pub enum WireError {
    /// The stream failed or the peer closed it mid-frame.
    Io(io::ErrorKind),
    /// A complete frame arrived but its payload could not be decoded.
    Codec,
}

impl From<io::Error> for WireError {
    fn from(io_error: io::Error) -> Self {
        WireError::Io(io_error.kind())
    }
}

pub type WireResult<T> = ::std::result::Result<T, WireError>;

/// Frame and send a single message: an unsigned 32-bit little-endian
/// payload length followed by that many bytes of the MessagePack encoding
/// of `msg`. The write either completes in full or fails the connection.
pub fn send_msg<W: Write, T: Serialize>(stream: &mut W, msg: &T) -> WireResult<()> {
    let payload = rmp_serde::to_vec_named(msg).map_err(|_| WireError::Codec)?;

    stream.write_u32::<LittleEndian>(payload.len() as u32)?;
    stream.write_all(&payload)?;
    stream.flush().map_err(Into::into)
}

/// Receive a single framed message, blocking until the exact frame length
/// has been read. A stream that ends mid-frame is reported as I/O loss,
/// a full frame that fails to decode as a codec error.
pub fn recv_msg<R: Read, T: DeserializeOwned>(stream: &mut R) -> WireResult<T> {
    let size = stream.read_u32::<LittleEndian>()? as usize;

    let mut payload = vec![0u8; size];
    stream.read_exact(&mut payload)?;

    rmp_serde::from_slice(&payload).map_err(|_| WireError::Codec)
}
