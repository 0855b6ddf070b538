//! Fire-and-forget task queue
//!
//! Block-group caching scans run here so allocators can keep working on
//! the part of a group already indexed.

use super::{BtrfsError, Result};
use parking_lot::Mutex;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of worker threads fed through a channel
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `count` workers (at least one)
    pub fn new(name: &str, count: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut threads = Vec::new();

        for i in 0..count.max(1) {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || loop {
                    let job = rx.lock().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
                .map_err(BtrfsError::Io)?;
            threads.push(handle);
        }

        debug!(name, workers = threads.len(), "started worker pool");
        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(tx)),
            threads: Mutex::new(threads),
        })
    }

    /// Queues a task
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender.lock().as_ref() {
            Some(tx) => tx
                .send(Box::new(job))
                .map_err(|_| BtrfsError::Aborted(format!("worker pool {} stopped", self.name))),
            None => Err(BtrfsError::Aborted(format!("worker pool {} stopped", self.name))),
        }
    }

    /// Lets queued tasks finish, then joins every worker
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name, "worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pool_runs_all_jobs_before_shutdown() {
        let pool = WorkerPool::new("test", 2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let done = Arc::clone(&done);
            pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 16);
        assert!(pool.submit(|| {}).is_err());
    }
}
