use crate::dispatcher::{self, Outcome};
use std::fs;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use veowire::logging::{self, Logger};
use veowire::socket_path;

/// Listening side of the worker. Binds the per-pid rendezvous socket,
/// accepts one connection per client context and runs a dispatcher
/// thread for each. The socket is unlinked again when the server stops.
pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    log: Logger,
}

impl Server {
    /// Bind the per-pid socket, replacing any stale one left behind by a
    /// previous worker with the same pid.
    pub fn bind(log: &Logger) -> io::Result<Server> {
        let path = socket_path(process::id());
        drop(fs::remove_file(&path));

        let listener = UnixListener::bind(&path)?;

        logging::info!(log, "listening"; "path" => %path.display());

        Ok(Server {
            listener,
            path,
            log: log.new(logging::o!()),
        })
    }

    /// Accept and serve connections until a dispatcher observes a quit
    /// request or loses its client outright.
    pub fn run(self) -> io::Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut dispatchers = Vec::new();

        loop {
            let (stream, _) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) => {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }

                    return Err(err);
                }
            };

            // A stopping dispatcher wakes this loop with a throwaway
            // connection; nothing new is served past that point.
            if stop.load(Ordering::Acquire) {
                break;
            }

            logging::debug!(self.log, "context connected");

            let conn_log = self.log.new(logging::o!());
            let conn_stop = stop.clone();
            let listen_path = self.path.clone();

            dispatchers.push(thread::spawn(move || {
                let mut stream = stream;

                match dispatcher::serve(&mut stream, &conn_log) {
                    Outcome::ContextClosed => {
                        logging::debug!(conn_log, "context closed");
                    }
                    outcome @ Outcome::Quit | outcome @ Outcome::PeerLost => {
                        logging::debug!(conn_log, "stopping worker"; "outcome" => ?outcome);

                        // Stop accepting; unblock the accept loop with a
                        // throwaway connection to our own socket.
                        conn_stop.store(true, Ordering::Release);
                        drop(UnixStream::connect(&listen_path));
                    }
                }
            }));
        }

        for dispatcher in dispatchers {
            drop(dispatcher.join());
        }

        logging::info!(self.log, "worker stopped");

        drop(fs::remove_file(&self.path));

        Ok(())
    }
}
