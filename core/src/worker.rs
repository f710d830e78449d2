//! The worker pool: a fixed set of threads that
//! drain a submission queue, plus a `parallel_foreach` helper built on top
//! of it for fanning a closure out across every process in the table.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Unit {
    Work(Job),
    Shutdown,
}

/// A fixed-size thread pool. Jobs queue on a bounded channel; workers block
/// on it until a job (or a shutdown signal) arrives.
pub struct WorkerPool {
    sender: Sender<Unit>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> std::io::Result<Self> {
        let (sender, receiver): (Sender<Unit>, Receiver<Unit>) = bounded(worker_count * 4 + 16);
        let mut handles = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("vmm-worker-{index}"))
                .spawn(move || loop {
                    match receiver.recv() {
                        Ok(Unit::Work(job)) => job(),
                        Ok(Unit::Shutdown) | Err(_) => break,
                    }
                })?;
            handles.push(handle);
        }

        Ok(WorkerPool {
            sender,
            handles: Mutex::new(handles),
            worker_count,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Submits `job` to run on some worker thread. Panics if the pool has
    /// already been shut down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.sender
            .send(Unit::Work(Box::new(job)))
            .expect("worker pool is shut down");
    }

    /// Runs `f` once per item in `items`, across the pool, and blocks until
    /// every invocation has completed ("parallel_foreach").
    pub fn parallel_foreach<T, F>(&self, items: Vec<T>, f: F)
    where
        T: Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let total = items.len();
        if total == 0 {
            return;
        }

        let remaining = Arc::new(AtomicUsize::new(total));
        let done_pair = Arc::new((Mutex::new(false), Condvar::new()));
        let f = Arc::new(f);

        for item in items {
            let remaining = remaining.clone();
            let done_pair = done_pair.clone();
            let f = f.clone();

            self.submit(move || {
                f(item);

                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let (lock, cvar) = &*done_pair;
                    *lock.lock() = true;
                    cvar.notify_all();
                }
            });
        }

        let (lock, cvar) = &*done_pair;
        let mut done = lock.lock();
        while !*done {
            cvar.wait(&mut done);
        }
    }

    /// Signals every worker to exit after draining whatever is already
    /// queued, then joins all threads.
    pub fn shutdown(&self) {
        for _ in 0..self.worker_count {
            let _ = self.sender.send(Unit::Shutdown);
        }
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.lock().is_empty() {
            self.shutdown();
        }
    }
}
