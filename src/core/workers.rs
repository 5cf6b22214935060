//! Fixed-size thread pool for background frame jobs
//!
//! Uses a bounded crossbeam MPMC channel as the job queue: workers pull in
//! submission order, so each job starts no earlier than the ones queued before
//! it (no global completion order across workers).
//!
//! `queue_job(fn, arg)` sends the function pointer and its argument by value.
//! The queue's slots are allocated once at construction, so queueing a job
//! doesn't touch the heap. `execute` takes an ad-hoc closure and boxes it.
//!
//! Every worker owns a `ThreadEnv` specialized from the shared `Environment`
//! and passes it to each job it runs. Clips therefore never see the
//! consumer's execution context from a worker thread.
//!
//! Drop closes the queue and joins all workers. Jobs already queued still run
//! to completion first; nothing is discarded.

use crossbeam::channel::{Sender, bounded};
use log::{debug, error, trace};
use std::sync::Arc;
use std::thread;

use crate::entities::clip::ClipError;
use crate::entities::env::{Environment, ThreadEnv};

type Task = Box<dyn FnOnce(&ThreadEnv) + Send + 'static>;

enum Message<A> {
    Job(fn(&ThreadEnv, A), A),
    Task(Task),
}

/// Worker pool with per-thread execution contexts.
///
/// `A` is the argument type of `queue_job` jobs.
///
/// # Example
/// ```
/// # use framefetch::core::workers::ThreadPool;
/// # use framefetch::entities::env::Environment;
/// let env = Environment::new();
/// let pool = ThreadPool::new(2, 16, &env, "doc").unwrap();
/// pool.queue_job(|tenv, n: i32| assert!(tenv.is_worker() && n == 5), 5);
/// drop(pool); // waits for the job
/// ```
pub struct ThreadPool<A: Send + 'static = ()> {
    sender: Option<Sender<Message<A>>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl<A: Send + 'static> ThreadPool<A> {
    /// Spawn `num_threads` workers named `{name}-worker-{i}`.
    ///
    /// At most `queue_capacity` jobs wait in the queue; queueing into a full
    /// queue blocks until a worker takes one.
    ///
    /// Fails with `ClipError::Resource` if a thread can't be spawned; workers
    /// started before the failure are shut down.
    pub fn new(
        num_threads: usize,
        queue_capacity: usize,
        env: &Arc<Environment>,
        name: &str,
    ) -> Result<Self, ClipError> {
        let (tx, rx) = bounded::<Message<A>>(queue_capacity.max(1));
        let mut pool = Self {
            sender: Some(tx),
            handles: Vec::with_capacity(num_threads),
        };

        for worker_id in 0..num_threads {
            let rx = rx.clone();
            let tenv = env.specialize(worker_id);

            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", name, worker_id))
                .spawn(move || {
                    trace!("Worker {} started", worker_id);

                    // Runs until the queue is closed and drained
                    while let Ok(message) = rx.recv() {
                        match message {
                            Message::Job(func, arg) => func(&tenv, arg),
                            Message::Task(task) => task(&tenv),
                        }
                    }

                    trace!("Worker {} stopped", worker_id);
                });

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    error!("Failed to spawn worker {}: {}", worker_id, e);
                    // Drop joins the workers spawned so far
                    return Err(ClipError::Resource(format!("spawn worker thread: {}", e)));
                }
            }
        }

        debug!(
            "ThreadPool '{}' initialized: {} threads, queue capacity {}",
            name,
            num_threads,
            queue_capacity.max(1)
        );
        Ok(pool)
    }

    /// Queue `func(context, arg)` and return once it is enqueued
    pub fn queue_job(&self, func: fn(&ThreadEnv, A), arg: A) {
        self.send(Message::Job(func, arg));
    }

    /// Queue a closure; it receives the running worker's context
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce(&ThreadEnv) + Send + 'static,
    {
        self.send(Message::Task(Box::new(f)));
    }

    fn send(&self, message: Message<A>) {
        let Some(sender) = &self.sender else {
            error!("Job queued on a pool that is shutting down");
            return;
        };
        if sender.send(message).is_err() {
            error!("Failed to enqueue job: all workers are gone");
        }
    }

    pub fn num_threads(&self) -> usize {
        self.handles.len()
    }
}

impl<A: Send + 'static> Drop for ThreadPool<A> {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        debug!("ThreadPool shutting down ({} threads)...", num_threads);

        // Sender drops -> channel closes -> workers exit once the queue is empty
        self.sender.take();

        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }

        trace!("All {} workers stopped", num_threads);
    }
}
