//! Fixed worker pool for offloaded connection work.
//!
//! The reactor hands each readiness dispatch to this pool so a slow
//! multi-segment read never stalls the polling loop. Serialization per
//! connection is the registry lock's job, not the pool's; workers may run
//! handlers for different connections in true parallel.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads fed from a shared queue.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (must be non-zero).
    pub fn new(size: usize) -> std::io::Result<Self> {
        debug_assert!(size > 0, "worker pool must have at least one thread");

        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(size);
        for worker_id in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &receiver))?;
            handles.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            handles,
        })
    }

    /// Queue a job for the next free worker.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(sender) = &self.sender {
            // Send only fails after shutdown, when the job is moot anyway.
            let _ = sender.send(Box::new(job));
        }
    }

    /// Stop accepting work and join all workers. Idempotent.
    pub fn shutdown(&mut self) {
        // Dropping the sender disconnects the queue; workers drain and exit.
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, receiver: &Mutex<Receiver<Job>>) {
    debug!(worker = worker_id, "Worker started");
    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
    debug!(worker = worker_id, "Worker stopped");
}
