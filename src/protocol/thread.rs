use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, mpsc},
    thread,
};

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::config::ConfigError;

use super::TransportError;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads running server-side handler calls.
///
/// Requests from every connection of a server share one pool, so a slow handler delays
/// only the requests queued behind it and never the connection's receive loop.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(size: usize) -> Result<Self, TransportError> {
        if size == 0 {
            return Err(ConfigError::ZeroWorkers.into());
        }

        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            workers.push(Worker::new(id, Arc::clone(&receiver))?);
        }

        Ok(Self {
            workers,
            sender: Some(sender),
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, f: F) -> Result<(), TransportError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(TransportError::Disposed)?;
        sender
            .send(Box::new(f))
            .map_err(|_| TransportError::Disposed)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.id);
            if worker.thread.join().is_err() {
                warn!("worker {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> Result<Self, TransportError> {
        let thread = thread::Builder::new()
            .name(format!("skein-worker-{id}"))
            .spawn(move || {
                loop {
                    let msg = receiver.lock().recv();
                    match msg {
                        Ok(job) => {
                            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                                error!("job on worker {id} panicked");
                            }
                        }
                        Err(_) => {
                            debug!("worker {id} disconnected");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { id, thread })
    }
}
