use std::{
    sync::{Arc, Mutex, mpsc},
    thread,
};

use log::{debug, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where deferred work runs: a worker pool, or the calling thread.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "thread pool needs at least one worker");

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for i in 0..size {
            workers.push(Worker::new(i, Arc::clone(&receiver)));
        }

        Self { workers, sender }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) {
        let sent = self.sender.as_ref().map(|sender| sender.send(job));
        if !matches!(sent, Some(Ok(()))) {
            warn!("thread pool is shut down, dropping job");
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.id);

            // dropped from inside one of our own jobs; that worker exits on its own
            if worker.thread.thread().id() == current {
                continue;
            }
            if worker.thread.join().is_err() {
                warn!("worker {} panicked", worker.id);
            }
        }
    }
}

/// Runs every job on the thread that submits it.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    pub fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> Self {
        let thread = thread::spawn(move || {
            loop {
                let msg = receiver.lock().unwrap_or_else(|e| e.into_inner()).recv();
                match msg {
                    Ok(job) => {
                        debug!("worker {id} running a job");
                        job();
                    }
                    Err(_) => {
                        debug!("worker {id} disconnected");
                        break;
                    }
                }
            }
        });

        Self { id, thread }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn pool_runs_every_job_before_drop_returns() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(4);
        assert_eq!(pool.size(), 4);

        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        drop(pool);

        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn inline_executor_runs_on_caller_thread() {
        let caller = thread::current().id();
        let seen = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&seen);
        InlineExecutor.execute(Box::new(move || {
            *slot.lock().unwrap() = Some(thread::current().id());
        }));

        assert_eq!(*seen.lock().unwrap(), Some(caller));
    }

    #[test]
    #[should_panic(expected = "at least one worker")]
    fn empty_pool_rejected() {
        ThreadPool::new(0);
    }
}
