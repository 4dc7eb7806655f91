use crate::args::ArgList;
use crate::result::{Error, Result};
use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use veowire::args::CopyDescriptor;
use veowire::codec::{recv_msg, send_msg, WireError, WireResult};
use veowire::logging;
use veowire::message::{Command, Request, Response};

const CONNECT_RETRY_SLEEP: Duration = Duration::from_millis(1);
const CONNECT_MAX_RETRIES: usize = 1000;

/// Lifecycle state of a context as observed by its communicator.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContextState {
    Running,
    Exit,
}

/// One connection to the worker process and the unit of request ordering.
///
/// All socket traffic goes through the context's communicator thread; any
/// application thread may submit requests and consume results. Request ids
/// are contiguous and strictly increasing for the lifetime of the context,
/// and every result is consumed exactly once.
pub struct Context {
    requests: Mutex<Sender<Request>>,
    results: Mutex<HashMap<u64, Response>>,
    results_cv: Condvar,
    running: AtomicBool,
    num_reqs: AtomicU64,
    comm_thread: Mutex<Option<thread::JoinHandle<()>>>,
    log: logging::Logger,
}

impl Context {
    /// Connect to the worker socket at `path` and start the communicator.
    /// Connection attempts are retried while the worker is still coming
    /// up, bounded by the retry cap.
    pub(crate) fn open<'a, L: Into<Option<&'a logging::Logger>>>(
        path: &Path,
        log: L,
    ) -> Result<Arc<Context>> {
        let ctx_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let stream = Self::connect(path)?;

        logging::debug!(ctx_log, "connected to worker"; "path" => %path.display());

        let (tx, rx) = channel();

        let ctx = Arc::new(Context {
            requests: Mutex::new(tx),
            results: Mutex::new(HashMap::new()),
            results_cv: Condvar::new(),
            running: AtomicBool::new(true),
            num_reqs: AtomicU64::new(0),
            comm_thread: Mutex::new(None),
            log: ctx_log,
        });

        let comm_ctx = ctx.clone();
        let handle = thread::spawn(move || communicate(comm_ctx, rx, stream));

        *ctx.comm_thread.lock().expect("comm thread lock poisoned") = Some(handle);

        Ok(ctx)
    }

    fn connect(path: &Path) -> Result<UnixStream> {
        let mut retries = 0;

        loop {
            match UnixStream::connect(path) {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    retries += 1;

                    if retries >= CONNECT_MAX_RETRIES {
                        return Err(Error::Connect(err.kind()));
                    }

                    thread::sleep(CONNECT_RETRY_SLEEP);
                }
            }
        }
    }

    /// Issue the next request id.
    #[inline]
    pub fn issue_reqid(&self) -> u64 {
        self.num_reqs.fetch_add(1, Ordering::Relaxed)
    }

    /// Enqueue a request for transmission. Returns immediately; if the
    /// communicator has already exited the request is dropped and the
    /// failure surfaces when its result is awaited.
    pub(crate) fn submit_request(&self, request: Request) {
        let requests = self.requests.lock().expect("request queue lock poisoned");
        drop(requests.send(request));
    }

    /// Block until the result for `reqid` arrives and consume it. Returns
    /// `Error::PeerLost` if the communicator exits first.
    pub fn wait_result(&self, reqid: u64) -> Result<Response> {
        let mut results = self.results.lock().expect("result map lock poisoned");

        loop {
            if let Some(response) = results.remove(&reqid) {
                return Ok(response);
            }

            if !self.running.load(Ordering::Acquire) {
                return Err(Error::PeerLost);
            }

            results = self
                .results_cv
                .wait(results)
                .expect("result map lock poisoned");
        }
    }

    /// Non-blocking probe for the result of `reqid`, consuming it when
    /// present. Never reports peer loss; an undelivered request simply
    /// stays pending.
    pub fn peek_result(&self, reqid: u64) -> Option<Response> {
        let mut results = self.results.lock().expect("result map lock poisoned");
        results.remove(&reqid)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        match self.running.load(Ordering::Acquire) {
            true => ContextState::Running,
            false => ContextState::Exit,
        }
    }

    /// Submit an asynchronous call of the function at worker address
    /// `addr`. Returns the request id; the return word is retrieved with
    /// `call_wait_result` or `call_peek_result`.
    pub fn call_async(&self, addr: u64, args: &ArgList) -> u64 {
        let reqid = self.issue_reqid();
        let (copy_in, copy_out) = args.copy_descriptors();

        self.submit_request(Request {
            cmd: Command::CallAsync.into(),
            reqid,
            addr: Some(addr),
            args: Some(args.slots().to_vec()),
            copy_in,
            copy_out,
            ..Default::default()
        });

        reqid
    }

    /// Submit an asynchronous call of `symname` resolved in `libhdl` by
    /// the worker.
    pub fn call_async_by_name(&self, libhdl: u64, symname: &str, args: &ArgList) -> u64 {
        let reqid = self.issue_reqid();
        let (copy_in, copy_out) = args.copy_descriptors();

        self.submit_request(Request {
            cmd: Command::CallAsyncByName.into(),
            reqid,
            libhdl: Some(libhdl),
            symname: Some(symname.to_string()),
            args: Some(args.slots().to_vec()),
            copy_in,
            copy_out,
            ..Default::default()
        });

        reqid
    }

    /// Wait for a call submitted on this context and return its u64
    /// return word. `Error::PeerLost` means the call will never complete.
    pub fn call_wait_result(&self, reqid: u64) -> Result<u64> {
        logging::debug!(self.log, "waiting for request"; "reqid" => reqid);

        let response = self.wait_result(reqid)?;

        logging::debug!(self.log, "request completed"; "reqid" => reqid);

        Ok(response.result)
    }

    /// Peek at a call's return word without blocking; `None` while the
    /// request is unfinished.
    pub fn call_peek_result(&self, reqid: u64) -> Option<u64> {
        self.peek_result(reqid).map(|response| response.result)
    }

    /// Barrier: blocks until every request submitted on this context
    /// before it has been executed by the worker.
    pub fn sync(&self) -> Result<()> {
        let reqid = self.issue_reqid();

        self.submit_request(Request {
            cmd: Command::SyncContext.into(),
            reqid,
            ..Default::default()
        });

        self.wait_result(reqid).map(|_| ())
    }

    /// Schedule an asynchronous read of `size` worker bytes at `src` into
    /// host memory at `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must point to at least `size` writable bytes that stay valid
    /// until the result for the returned request id has been consumed.
    pub unsafe fn async_read_mem(&self, dst: *mut u8, src: u64, size: usize) -> u64 {
        let reqid = self.issue_reqid();

        self.submit_request(Request {
            cmd: Command::AsyncReadMem.into(),
            reqid,
            copy_out: Some(vec![CopyDescriptor {
                ve_ptr: src,
                vh_ptr: dst as u64,
                len: size as u64,
                data: Vec::new(),
            }]),
            ..Default::default()
        });

        reqid
    }

    /// Schedule an asynchronous write of `size` host bytes at `src` into
    /// worker memory at `dst`.
    ///
    /// # Safety
    ///
    /// `src` must point to at least `size` bytes that stay valid until the
    /// result for the returned request id has been consumed.
    pub unsafe fn async_write_mem(&self, dst: u64, src: *const u8, size: usize) -> u64 {
        let reqid = self.issue_reqid();

        self.submit_request(Request {
            cmd: Command::AsyncWriteMem.into(),
            reqid,
            copy_in: Some(vec![CopyDescriptor {
                ve_ptr: dst,
                vh_ptr: src as u64,
                len: size as u64,
                data: Vec::new(),
            }]),
            ..Default::default()
        });

        reqid
    }

    /// Submit a final `cmd` (close or quit) and join the communicator.
    /// Harmless on a context whose communicator already exited.
    pub(crate) fn shutdown(&self, cmd: Command) {
        let reqid = self.issue_reqid();

        self.submit_request(Request {
            cmd: cmd.into(),
            reqid,
            ..Default::default()
        });

        self.join();
    }

    /// Join the communicator thread. Idempotent.
    pub(crate) fn join(&self) {
        let handle = self
            .comm_thread
            .lock()
            .expect("comm thread lock poisoned")
            .take();

        if let Some(handle) = handle {
            drop(handle.join());
        }
    }
}

/// Communicator entry point: drain the request queue until a terminal
/// command or peer loss, then flip the context to `Exit` and wake every
/// waiter.
fn communicate(ctx: Arc<Context>, requests: Receiver<Request>, mut stream: UnixStream) {
    match run(&ctx, &requests, &mut stream) {
        Ok(()) => logging::debug!(ctx.log, "communicator finished"),
        Err(err) => logging::warn!(ctx.log, "peer lost"; "error" => ?err),
    }

    // Flip the flag under the result lock so a waiter between its map
    // probe and its condvar wait cannot miss the final wakeup.
    let results = ctx.results.lock().expect("result map lock poisoned");
    ctx.running.store(false, Ordering::Release);
    ctx.results_cv.notify_all();
    drop(results);
}

fn run(ctx: &Context, requests: &Receiver<Request>, stream: &mut UnixStream) -> WireResult<()> {
    loop {
        let mut request = match requests.recv() {
            Ok(request) => request,
            // Every sender is gone; nothing can be submitted anymore.
            Err(_) => return Ok(()),
        };

        // Copy-in payloads are materialized from host memory immediately
        // before transmission.
        if let Some(ref mut descriptors) = request.copy_in {
            for desc in descriptors.iter_mut() {
                if desc.vh_ptr != 0 && desc.len > 0 {
                    let host = unsafe {
                        std::slice::from_raw_parts(desc.vh_ptr as *const u8, desc.len as usize)
                    };
                    desc.data = host.to_vec();
                }
            }
        }

        logging::trace!(ctx.log, "sending request"; "reqid" => request.reqid, "cmd" => request.cmd);

        send_msg(stream, &request)?;

        if request.cmd == u32::from(Command::CloseContext) || request.cmd == u32::from(Command::Quit)
        {
            return Ok(());
        }

        let response: Response = recv_msg(stream)?;

        if response.reqid != request.reqid {
            logging::error!(ctx.log, "reply does not match the in-flight request";
                            "expected" => request.reqid,
                            "received" => response.reqid);

            return Err(WireError::Codec);
        }

        // Copy-out payloads are written back into host memory before the
        // reply becomes observable.
        if let Some(ref descriptors) = response.copy_out {
            for desc in descriptors {
                if desc.vh_ptr != 0 && !desc.data.is_empty() {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            desc.data.as_ptr(),
                            desc.vh_ptr as *mut u8,
                            desc.data.len(),
                        );
                    }
                }
            }
        }

        logging::trace!(ctx.log, "received result"; "reqid" => response.reqid, "result" => response.result);

        let mut results = ctx.results.lock().expect("result map lock poisoned");
        results.insert(response.reqid, response);
        ctx.results_cv.notify_all();
    }
}
