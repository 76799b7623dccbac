//! A fixed-size worker pool.
//!
//! Tasks can be scheduled before the pool is started; they are queued in
//! scheduling order and picked up by the workers once [`ThreadPool::start`]
//! is called.

use std::{
    num::NonZeroUsize,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use crossbeam::channel::{Receiver, Sender};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("Pool was already started")]
    AlreadyStarted,

    #[error("Pool was terminated")]
    Terminated,

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

pub struct ThreadPool {
    threads: NonZeroUsize,
    sender: Option<Sender<Task>>,
    receiver: Receiver<Task>,
    quit: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    started: bool,
}

impl ThreadPool {
    pub fn new(threads: NonZeroUsize) -> Self {
        let (sender, receiver) = crossbeam::channel::unbounded();
        Self {
            threads,
            sender: Some(sender),
            receiver,
            quit: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            started: false,
        }
    }

    /// The number of tasks that have not been picked up by a worker yet.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub fn schedule<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.sender {
            Some(sender) => sender
                .send(Box::new(task))
                .map_err(|_| PoolError::Terminated),
            None => Err(PoolError::Terminated),
        }
    }

    /// Spawns the workers.
    #[tracing::instrument(skip(self), fields(threads = self.threads.get()))]
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.sender.is_none() {
            return Err(PoolError::Terminated);
        }
        if self.started {
            return Err(PoolError::AlreadyStarted);
        }
        self.started = true;

        for i in 0..self.threads.get() {
            let receiver = self.receiver.clone();
            let quit = self.quit.clone();
            let worker = std::thread::Builder::new()
                .name(format!("pool-worker-{i}"))
                .spawn(move || work(receiver, quit))?;
            self.workers.push(worker);
        }
        tracing::debug!(pending = self.pending(), "pool started");
        Ok(())
    }

    /// Stops accepting tasks and joins the workers.
    ///
    /// With `wait` the workers drain the queue first, otherwise tasks that
    /// have not been picked up yet are discarded. Tasks of a pool that was
    /// never started are always discarded.
    #[tracing::instrument(skip(self))]
    pub fn terminate(&mut self, wait: bool) {
        if !wait {
            self.quit.store(true, Ordering::Release);
        }
        self.sender = None;

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("pool worker panicked");
            }
        }
        tracing::debug!(discarded = self.receiver.len(), "pool terminated");
        while self.receiver.try_recv().is_ok() {}
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.sender.is_some() || !self.workers.is_empty() {
            self.terminate(false);
        }
    }
}

fn work(receiver: Receiver<Task>, quit: Arc<AtomicBool>) {
    while let Ok(task) = receiver.recv() {
        if quit.load(Ordering::Acquire) {
            break;
        }
        if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::warn!("pool task panicked");
        }
    }
}
