use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send>;

enum Message {
    Run(Job),
    Stop,
}

/// Hands work to the worker thread.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    tx: Sender<Message>,
}

impl WorkerHandle {
    /// Runs `job` on the worker thread.
    ///
    /// Returns `false` if the worker has already stopped, in which case the job is dropped.
    pub fn dispatch<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Message::Run(Box::new(job))).is_ok()
    }
}

/// A background thread that handles response follow-up work off the I/O thread.
pub(crate) struct Worker {
    handle: WorkerHandle,
    thread: JoinHandle<()>,
}

impl Worker {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Message>();
        let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
            for message in rx {
                match message {
                    Message::Run(job) => job(),
                    Message::Stop => break,
                }
            }
            debug!("Worker thread stopped.");
        })?;

        Ok(Self { handle: WorkerHandle { tx }, thread })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Stops the worker once the jobs already queued have run, and waits for it to exit.
    pub fn shutdown(self) {
        let _ = self.handle.tx.send(Message::Stop);
        if self.thread.thread().id() == thread::current().id() {
            return;
        }

        if self.thread.join().is_err() {
            error!("Worker thread panicked.");
        }
    }
}
