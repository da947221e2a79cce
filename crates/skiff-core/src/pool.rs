//! Fixed-size worker pool draining one FIFO task queue.
//!
//! Workers block on a condition variable, dequeue under the lock, and
//! run the task with the lock released. Submission is unbounded: the
//! queue applies no back-pressure, trading memory for throughput on
//! bursty accept storms.
//!
//! Shutdown drains every queued task before the workers exit, then
//! joins them.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers, all parked on the empty queue.
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("skiff-worker-{}", i))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self { shared, handles }
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Enqueue a task and wake one worker. Tasks submitted after
    /// shutdown are dropped.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                log::warn!("task submitted to closed worker pool, dropping");
                return;
            }
            state.tasks.push_back(Box::new(task));
        }
        self.shared.cond.notify_one();
    }

    /// Mark the pool closed, wake every worker, and join them. Queued
    /// tasks still run before the workers exit.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.cond.notify_all();
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

fn worker_loop(shared: Arc<Shared>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if let Some(task) = state.tasks.pop_front() {
            drop(state);
            task();
            state = shared.state.lock().unwrap();
        } else if state.closed {
            break;
        } else {
            state = shared.cond.wait(state).unwrap();
        }
    }
}
