use crate::args::ArgList;
use crate::context::{Context, ContextState};
use crate::result::{Error, Result};
use lazy_static::lazy_static;
use std::cmp;
use std::env;
use std::fs;
use std::process;
use std::process::Child;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use veowire::logging;
use veowire::message::{ByteBuf, Command, Request, Response};
use veowire::{socket_path, WORKER_BIN, WORKER_BIN_ENV_VAR};

lazy_static! {
    /// Process-wide registry of live handles. A handle's identifier is its
    /// current position in this list, so identifiers shift when earlier
    /// handles are destroyed.
    static ref PROCS: Mutex<Vec<u64>> = Mutex::new(Vec::new());

    /// Root logger for the client library.
    static ref LOG: logging::Logger = logging::init();
}

static PROC_UID: AtomicU64 = AtomicU64::new(0);

/// Client-side representation of one worker process. Owns the default
/// context and any application-opened contexts; the handle must be the
/// last thing standing when the worker goes away.
pub struct ProcHandle {
    node: i32,
    uid: u64,
    child: Child,
    default_context: Arc<Context>,
    contexts: Vec<Arc<Context>>,
    log: logging::Logger,
}

impl ProcHandle {
    /// Spawn a worker process for `node` and connect its default context.
    /// The worker executable is taken from `VEORUN_BIN`, falling back to
    /// `stub-veorun` resolved through PATH. A worker that fails to come up
    /// within the retry window is killed and reported as an error.
    pub fn create(node: i32) -> Result<ProcHandle> {
        let log = LOG.new(logging::o!("node" => node));

        let bin = env::var(WORKER_BIN_ENV_VAR).unwrap_or_else(|_| WORKER_BIN.to_string());

        logging::debug!(log, "launching worker"; "bin" => %bin);

        let mut child = process::Command::new(&bin)
            .spawn()
            .map_err(|err| Error::Spawn(err.kind()))?;

        let path = socket_path(child.id());

        let default_context = match Context::open(&path, &log) {
            Ok(ctx) => ctx,
            Err(err) => {
                logging::error!(log, "cannot connect to worker"; "path" => %path.display());

                drop(child.kill());
                drop(child.wait());

                return Err(err);
            }
        };

        let uid = PROC_UID.fetch_add(1, Ordering::Relaxed);
        PROCS.lock().expect("proc registry lock poisoned").push(uid);

        logging::debug!(log, "worker ready"; "pid" => child.id());

        Ok(ProcHandle {
            node,
            uid,
            child,
            default_context,
            contexts: Vec::new(),
            log,
        })
    }

    /// Tear down the worker: close leftover application contexts, stop
    /// the worker process, reap it and deregister the handle. Dropping
    /// the handle performs the same teardown.
    pub fn destroy(self) {}

    fn teardown(&mut self) {
        logging::debug!(self.log, "destroying proc handle"; "pid" => self.child.id());

        let contexts: Vec<Arc<Context>> = self.contexts.drain(..).collect();
        for ctx in contexts {
            if !Arc::ptr_eq(&ctx, &self.default_context) {
                ctx.shutdown(Command::CloseContext);
            }
        }

        self.default_context.shutdown(Command::Quit);

        // A worker whose connection already failed never sees the quit
        // request; make sure the child cannot outlive the handle.
        if self.default_context.state() == ContextState::Exit {
            drop(self.child.kill());
        }

        drop(self.child.wait());

        let mut procs = PROCS.lock().expect("proc registry lock poisoned");
        if let Some(position) = procs.iter().position(|&uid| uid == self.uid) {
            procs.remove(position);
        }
        drop(procs);

        // The worker unlinks its socket on exit; sweep up after an
        // unclean one.
        drop(fs::remove_file(socket_path(self.child.id())));
    }

    /// Position of this handle in the process-wide registry, or -1 when
    /// the handle is no longer registered.
    pub fn identifier(&self) -> i32 {
        let procs = PROCS.lock().expect("proc registry lock poisoned");

        procs
            .iter()
            .position(|&uid| uid == self.uid)
            .map(|position| position as i32)
            .unwrap_or(-1)
    }

    /// Node this handle was created for.
    pub fn node(&self) -> i32 {
        self.node
    }

    /// Pid of the worker child.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// The context created alongside the handle. It lives exactly as long
    /// as the handle and cannot be closed through `context_close`.
    pub fn default_context(&self) -> &Arc<Context> {
        &self.default_context
    }

    /// Open a context on this handle. The first call hands out the
    /// default context; later calls open a fresh connection with its own
    /// communicator thread.
    pub fn context_open(&mut self) -> Result<Arc<Context>> {
        if self.contexts.is_empty() {
            self.contexts.push(self.default_context.clone());

            return Ok(self.default_context.clone());
        }

        let ctx = Context::open(&socket_path(self.child.id()), &self.log)?;
        self.contexts.push(ctx.clone());

        Ok(ctx)
    }

    /// Close a context opened on this handle. The default context is only
    /// unlisted; it is torn down by `destroy`. Closing a context whose
    /// communicator already exited merely reclaims it.
    pub fn context_close(&mut self, ctx: &Arc<Context>) {
        if let Some(position) = self
            .contexts
            .iter()
            .position(|known| Arc::ptr_eq(known, ctx))
        {
            self.contexts.remove(position);
        }

        if Arc::ptr_eq(ctx, &self.default_context) {
            return;
        }

        ctx.shutdown(Command::CloseContext);
    }

    /// Number of open contexts on this handle.
    pub fn num_contexts(&self) -> usize {
        self.contexts.len()
    }

    /// Context at `idx` in open order.
    pub fn get_context(&self, idx: usize) -> Option<&Arc<Context>> {
        self.contexts.get(idx)
    }

    /// Load a dynamic library into the worker. Returns the loader handle,
    /// zero when the library cannot be opened.
    pub fn load_library(&self, libname: &str) -> Result<u64> {
        let response = self.roundtrip(Request {
            cmd: Command::LoadLibrary.into(),
            libname: Some(libname.to_string()),
            ..Default::default()
        })?;

        Ok(response.result)
    }

    /// Unload a library previously loaded with `load_library`. Returns
    /// the loader's return value, zero on success.
    pub fn unload_library(&self, libhdl: u64) -> Result<u64> {
        let response = self.roundtrip(Request {
            cmd: Command::UnloadLibrary.into(),
            libhdl: Some(libhdl),
            ..Default::default()
        })?;

        Ok(response.result)
    }

    /// Resolve `symname` in `libhdl`. Returns the symbol address, zero
    /// when the symbol is missing.
    pub fn get_sym(&self, libhdl: u64, symname: &str) -> Result<u64> {
        let response = self.roundtrip(Request {
            cmd: Command::GetSym.into(),
            libhdl: Some(libhdl),
            symname: Some(symname.to_string()),
            ..Default::default()
        })?;

        Ok(response.result)
    }

    /// Allocate `size` bytes of worker memory. Returns the worker
    /// address, zero when the allocation fails.
    pub fn alloc_mem(&self, size: usize) -> Result<u64> {
        let response = self.roundtrip(Request {
            cmd: Command::AllocMem.into(),
            size: Some(size as u64),
            ..Default::default()
        })?;

        Ok(response.result)
    }

    /// Release worker memory obtained from `alloc_mem`.
    pub fn free_mem(&self, addr: u64) -> Result<u64> {
        let response = self.roundtrip(Request {
            cmd: Command::FreeMem.into(),
            addr: Some(addr),
            ..Default::default()
        })?;

        Ok(response.result)
    }

    /// Read `buf.len()` bytes of worker memory at `src` into `buf`.
    pub fn read_mem(&self, buf: &mut [u8], src: u64) -> Result<u64> {
        let response = self.roundtrip(Request {
            cmd: Command::ReadMem.into(),
            src: Some(src),
            size: Some(buf.len() as u64),
            ..Default::default()
        })?;

        if let Some(ref data) = response.data {
            let count = cmp::min(buf.len(), data.len());
            buf[..count].copy_from_slice(&data[..count]);
        }

        Ok(response.result)
    }

    /// Write `buf` into worker memory at `dst`.
    pub fn write_mem(&self, dst: u64, buf: &[u8]) -> Result<u64> {
        let response = self.roundtrip(Request {
            cmd: Command::WriteMem.into(),
            dst: Some(dst),
            size: Some(buf.len() as u64),
            data: Some(ByteBuf::from(buf.to_vec())),
            ..Default::default()
        })?;

        Ok(response.result)
    }

    /// Call the function at worker address `addr` on the default context
    /// and wait for its return word.
    pub fn call_sync(&self, addr: u64, args: &ArgList) -> Result<u64> {
        let reqid = self.default_context.call_async(addr, args);

        self.default_context.call_wait_result(reqid)
    }

    /// Submit `request` on the default context and wait for its reply.
    fn roundtrip(&self, mut request: Request) -> Result<Response> {
        let ctx = &self.default_context;
        let reqid = ctx.issue_reqid();
        request.reqid = reqid;

        ctx.submit_request(request);

        ctx.wait_result(reqid)
    }
}

impl Drop for ProcHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}
