use crate::engine;
use crate::memory;
use std::os::unix::net::UnixStream;
use veowire::args::CopyDescriptor;
use veowire::codec::{recv_msg, send_msg};
use veowire::logging::{self, Logger};
use veowire::message::{ByteBuf, Command, Request, Response};

/// How a per-connection dispatch loop ended.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Outcome {
    /// The client closed this context; the listener keeps serving.
    ContextClosed,
    /// The client asked the whole worker to stop.
    Quit,
    /// The connection failed or carried an undecodable frame.
    PeerLost,
}

/// Serve one context connection, handling one request at a time in
/// arrival order until a terminal command arrives or the client is lost.
pub fn serve(stream: &mut UnixStream, log: &Logger) -> Outcome {
    loop {
        let request: Request = match recv_msg(stream) {
            Ok(request) => request,
            Err(err) => {
                logging::debug!(log, "receive failed"; "error" => ?err);
                return Outcome::PeerLost;
            }
        };

        let cmd = match Command::from_tag(request.cmd) {
            Some(cmd) => cmd,
            None => {
                logging::error!(log, "unknown command tag"; "cmd" => request.cmd);
                return Outcome::PeerLost;
            }
        };

        logging::debug!(log, "handling request"; "reqid" => request.reqid, "cmd" => ?cmd);

        match cmd {
            Command::CloseContext => return Outcome::ContextClosed,
            Command::Quit => return Outcome::Quit,
            _ => {
                let response = handle(cmd, request, log);

                if let Err(err) = send_msg(stream, &response) {
                    logging::debug!(log, "send failed"; "error" => ?err);
                    return Outcome::PeerLost;
                }
            }
        }
    }
}

/// Execute one non-terminal command and build its reply.
fn handle(cmd: Command, request: Request, log: &Logger) -> Response {
    let mut response = Response {
        reqid: request.reqid,
        ..Default::default()
    };

    match cmd {
        Command::LoadLibrary => {
            let libname = request.libname.unwrap_or_default();
            response.result = engine::load_library(&libname, log);
        }
        Command::UnloadLibrary => {
            response.result = engine::unload_library(request.libhdl.unwrap_or(0));
        }
        Command::GetSym => {
            let symname = request.symname.unwrap_or_default();
            response.result = engine::get_sym(request.libhdl.unwrap_or(0), &symname, log);
        }
        Command::AllocMem => {
            response.result = memory::alloc(request.size.unwrap_or(0));
        }
        Command::FreeMem => {
            memory::free(request.addr.unwrap_or(0));
        }
        Command::ReadMem => {
            let data = memory::read(request.src.unwrap_or(0), request.size.unwrap_or(0));
            response.data = Some(ByteBuf::from(data));
        }
        Command::WriteMem => {
            let data = request.data.unwrap_or_default();
            memory::write(request.dst.unwrap_or(0), &data);
        }
        Command::CallAsync => {
            let (result, copy_out) = engine::call(
                request.addr.unwrap_or(0),
                &request.args.unwrap_or_default(),
                &request.copy_in.unwrap_or_default(),
                request.copy_out.unwrap_or_default(),
            );
            response.result = result;
            response.copy_out = fold(copy_out);
        }
        Command::CallAsyncByName => {
            let symname = request.symname.unwrap_or_default();
            let addr = engine::get_sym(request.libhdl.unwrap_or(0), &symname, log);
            let (result, copy_out) = engine::call(
                addr,
                &request.args.unwrap_or_default(),
                &request.copy_in.unwrap_or_default(),
                request.copy_out.unwrap_or_default(),
            );
            response.result = result;
            response.copy_out = fold(copy_out);
        }
        Command::AsyncReadMem => {
            response.copy_out = fold(memory::read_descriptors(
                request.copy_out.unwrap_or_default(),
            ));
        }
        Command::AsyncWriteMem => {
            memory::write_descriptors(&request.copy_in.unwrap_or_default());
        }
        Command::SyncContext => (),
        Command::CloseContext | Command::Quit => {
            unreachable!("terminal commands are handled by the serve loop")
        }
    }

    response
}

fn fold(descriptors: Vec<CopyDescriptor>) -> Option<Vec<CopyDescriptor>> {
    if descriptors.is_empty() {
        None
    } else {
        Some(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use veowire::logging::{o, Discard};

    fn discard() -> Logger {
        Logger::root(Discard, o!())
    }

    /// Run the dispatcher on one end of a socket pair and hand the other
    /// end to the test.
    fn spawn_dispatcher() -> (UnixStream, thread::JoinHandle<Outcome>) {
        let (mut served, driver) = UnixStream::pair().unwrap();

        let handle = thread::spawn(move || serve(&mut served, &discard()));

        (driver, handle)
    }

    fn roundtrip(stream: &mut UnixStream, request: Request) -> Response {
        send_msg(stream, &request).unwrap();
        recv_msg(stream).unwrap()
    }

    #[test]
    fn test_memory_commands_roundtrip() {
        let (mut driver, dispatcher) = spawn_dispatcher();

        let alloc = roundtrip(
            &mut driver,
            Request {
                cmd: Command::AllocMem.into(),
                reqid: 0,
                size: Some(32),
                ..Default::default()
            },
        );

        assert_eq!(alloc.reqid, 0);
        assert_ne!(alloc.result, 0);

        let pattern: Vec<u8> = (0..32).collect();
        let write = roundtrip(
            &mut driver,
            Request {
                cmd: Command::WriteMem.into(),
                reqid: 1,
                dst: Some(alloc.result),
                size: Some(32),
                data: Some(ByteBuf::from(pattern.clone())),
                ..Default::default()
            },
        );

        assert_eq!(write.result, 0);

        let read = roundtrip(
            &mut driver,
            Request {
                cmd: Command::ReadMem.into(),
                reqid: 2,
                src: Some(alloc.result),
                size: Some(32),
                ..Default::default()
            },
        );

        assert_eq!(read.reqid, 2);
        assert_eq!(&read.data.unwrap()[..], &pattern[..]);

        let free = roundtrip(
            &mut driver,
            Request {
                cmd: Command::FreeMem.into(),
                reqid: 3,
                addr: Some(alloc.result),
                ..Default::default()
            },
        );

        assert_eq!(free.result, 0);

        send_msg(
            &mut driver,
            &Request {
                cmd: Command::CloseContext.into(),
                reqid: 4,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(dispatcher.join().unwrap(), Outcome::ContextClosed);
    }

    #[test]
    fn test_async_memory_commands() {
        let (mut driver, dispatcher) = spawn_dispatcher();

        let alloc = roundtrip(
            &mut driver,
            Request {
                cmd: Command::AllocMem.into(),
                reqid: 0,
                size: Some(8),
                ..Default::default()
            },
        );

        let pattern = vec![9u8, 8, 7, 6, 5, 4, 3, 2];
        let write = roundtrip(
            &mut driver,
            Request {
                cmd: Command::AsyncWriteMem.into(),
                reqid: 1,
                copy_in: Some(vec![CopyDescriptor {
                    ve_ptr: alloc.result,
                    vh_ptr: 0,
                    len: 8,
                    data: pattern.clone(),
                }]),
                ..Default::default()
            },
        );

        assert_eq!(write.result, 0);

        let read = roundtrip(
            &mut driver,
            Request {
                cmd: Command::AsyncReadMem.into(),
                reqid: 2,
                copy_out: Some(vec![CopyDescriptor {
                    ve_ptr: alloc.result,
                    vh_ptr: 0,
                    len: 8,
                    data: Vec::new(),
                }]),
                ..Default::default()
            },
        );

        let filled = read.copy_out.unwrap();

        assert_eq!(filled.len(), 1);
        assert_eq!(filled[0].data, pattern);

        roundtrip(
            &mut driver,
            Request {
                cmd: Command::FreeMem.into(),
                reqid: 3,
                addr: Some(alloc.result),
                ..Default::default()
            },
        );

        send_msg(
            &mut driver,
            &Request {
                cmd: Command::Quit.into(),
                reqid: 4,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(dispatcher.join().unwrap(), Outcome::Quit);
    }

    #[test]
    fn test_sync_context_acknowledges() {
        let (mut driver, dispatcher) = spawn_dispatcher();

        let sync = roundtrip(
            &mut driver,
            Request {
                cmd: Command::SyncContext.into(),
                reqid: 17,
                ..Default::default()
            },
        );

        assert_eq!(sync.reqid, 17);
        assert_eq!(sync.result, 0);

        drop(driver);

        assert_eq!(dispatcher.join().unwrap(), Outcome::PeerLost);
    }

    #[test]
    fn test_unknown_command_is_peer_loss() {
        let (mut driver, dispatcher) = spawn_dispatcher();

        send_msg(
            &mut driver,
            &Request {
                cmd: 99,
                reqid: 0,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(dispatcher.join().unwrap(), Outcome::PeerLost);
    }

    #[test]
    fn test_missing_library_is_zero_result() {
        let (mut driver, dispatcher) = spawn_dispatcher();

        let load = roundtrip(
            &mut driver,
            Request {
                cmd: Command::LoadLibrary.into(),
                reqid: 0,
                libname: Some("/nonexistent/libnothing.so".to_string()),
                ..Default::default()
            },
        );

        assert_eq!(load.result, 0);

        drop(driver);
        dispatcher.join().unwrap();
    }

    #[test]
    fn test_call_through_dispatcher() {
        extern "C" fn triple(x: u64) -> u64 {
            x * 3
        }

        let (mut driver, dispatcher) = spawn_dispatcher();

        let fn_ptr: extern "C" fn(u64) -> u64 = triple;
        let call = roundtrip(
            &mut driver,
            Request {
                cmd: Command::CallAsync.into(),
                reqid: 0,
                addr: Some(fn_ptr as usize as u64),
                args: Some(vec![veowire::args::Arg::U64(14)]),
                ..Default::default()
            },
        );

        assert_eq!(call.result, 42);

        drop(driver);
        dispatcher.join().unwrap();
    }
}
