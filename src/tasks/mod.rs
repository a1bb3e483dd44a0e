use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;

use log::{trace, warn};

use crate::handle::Handle;

/// A unit of scheduled cache work. Tag plus payload, nothing else; whoever runs the task
/// looks the cell up again by handle, so records stay the same size for every resource type.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CacheTask {
    Load(Handle),
    Unload(Handle),
}

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The boundary to the external thread pool. The cache only ever pushes work through
/// [`TaskPool::schedule`] and never inspects queueing or stealing internals.
pub trait TaskPool: Send + Sync {
    fn schedule(&self, job: Job);
}

/// Default executor: a fixed set of named worker threads draining one shared channel.
/// Good enough for asset streaming; swap in an engine-wide pool via the [`TaskPool`] trait
/// when there is one.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Self {
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..worker_count.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("AssetWorker-{}", index))
                    .spawn(move || Self::run_worker(receiver))
                    .expect("Failed to spawn asset worker thread")
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    fn run_worker(receiver: Arc<Mutex<Receiver<Job>>>) {
        loop {
            let job = {
                let guard = receiver.lock().expect("worker receiver poisoned");
                guard.recv()
            };
            match job {
                Ok(job) => job(),
                // All senders gone, the pool is shutting down.
                Err(mpsc::RecvError) => break,
            }
        }
        trace!("Asset worker exiting");
    }

    /// Stops accepting work, drains the queue and joins all workers. Must not be called
    /// from one of the pool's own threads.
    pub fn shutdown(&self) {
        {
            let mut sender = self.sender.lock().expect("worker sender poisoned");
            sender.take();
        }
        let mut workers = self.workers.lock().expect("worker handles poisoned");
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!("Asset worker panicked before shutdown");
            }
        }
    }
}

impl TaskPool for WorkerPool {
    fn schedule(&self, job: Job) {
        let sender = self.sender.lock().expect("worker sender poisoned");
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(job).is_err() {
                    warn!("Dropped a scheduled task, no asset workers are alive");
                }
            }
            None => warn!("Dropped a scheduled task, the worker pool is shut down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn shutdown_drains_scheduled_jobs() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = counter.clone();
            pool.schedule(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(16, counter.load(Ordering::SeqCst));
    }

    #[test]
    fn scheduling_after_shutdown_is_a_noop() {
        let pool = WorkerPool::new(1);
        pool.shutdown();
        pool.schedule(Box::new(|| panic!("must not run")));
    }
}
