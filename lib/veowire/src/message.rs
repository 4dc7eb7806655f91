//! Request/response schema for the per-context command stream. Field
//! names are the wire names; command-dependent fields are optional and
//! omitted from the encoded map entirely when unused.

use crate::args::{Arg, CopyDescriptor};
use serde_derive::{Deserialize, Serialize};

pub use serde_bytes::ByteBuf;

/// Command tags, assigned contiguously in the order the worker's
/// dispatcher table enumerates them. Both peers must agree on the
/// numbering; it is not part of any external contract.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command {
    LoadLibrary = 0,
    UnloadLibrary = 1,
    GetSym = 2,
    AllocMem = 3,
    FreeMem = 4,
    ReadMem = 5,
    WriteMem = 6,
    CallAsync = 7,
    CallAsyncByName = 8,
    AsyncReadMem = 9,
    AsyncWriteMem = 10,
    SyncContext = 11,
    CloseContext = 12,
    Quit = 13,
}

impl Command {
    /// Checked construction from the wire tag.
    pub fn from_tag(tag: u32) -> Option<Command> {
        match tag {
            0 => Some(Command::LoadLibrary),
            1 => Some(Command::UnloadLibrary),
            2 => Some(Command::GetSym),
            3 => Some(Command::AllocMem),
            4 => Some(Command::FreeMem),
            5 => Some(Command::ReadMem),
            6 => Some(Command::WriteMem),
            7 => Some(Command::CallAsync),
            8 => Some(Command::CallAsyncByName),
            9 => Some(Command::AsyncReadMem),
            10 => Some(Command::AsyncWriteMem),
            11 => Some(Command::SyncContext),
            12 => Some(Command::CloseContext),
            13 => Some(Command::Quit),
            _ => None,
        }
    }
}

impl From<Command> for u32 {
    #[inline]
    fn from(cmd: Command) -> Self {
        cmd as u32
    }
}

/// One framed request on a context's command stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub cmd: u32,
    #[serde(default)]
    pub reqid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libhdl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Arg>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_in: Option<Vec<CopyDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_out: Option<Vec<CopyDescriptor>>,
}

/// Reply to a single request, matched by `reqid`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub reqid: u64,
    pub result: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_out: Option<Vec<CopyDescriptor>>,
}
