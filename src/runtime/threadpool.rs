use log::warn;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, mpsc};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    NewJob(Job),
    Terminate,
}

struct Worker {
    sender: mpsc::Sender<Message>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn spawn(id: usize) -> std::io::Result<Worker> {
        let (sender, receiver) = mpsc::channel::<Message>();
        let thread = thread::Builder::new()
            .name(format!("coap-callback-{}", id))
            .spawn(move || {
                while let Ok(Message::NewJob(job)) = receiver.recv() {
                    // A panicking listener must not take the worker down with it
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                        warn!(target: "Service", "Listener callback panicked on worker {}", id);
                    }
                }
            })?;
        Ok(Worker { sender, thread: Some(thread) })
    }
}

/// Worker threads delivering listener callbacks.
///
/// Jobs submitted with the same key run on the same worker, in submission
/// order. That keeps callbacks of one transaction sequential without
/// blocking the receive loop.
pub struct CallbackPool {
    workers: Mutex<Vec<Worker>>,
    size: usize,
    next: AtomicUsize,
}

impl CallbackPool {
    /// `size` is clamped to at least one worker
    pub fn new(size: usize) -> std::io::Result<CallbackPool> {
        let size = size.max(1);
        let workers = (0..size).map(Worker::spawn).collect::<std::io::Result<Vec<_>>>()?;
        Ok(CallbackPool {
            workers: Mutex::new(workers),
            size,
            next: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job. Keyed jobs are pinned to one worker; unkeyed jobs rotate.
    /// Returns false once the pool has been shut down.
    pub fn execute<F, K>(&self, f: F, key: Option<K>) -> bool
    where
        F: FnOnce() + Send + 'static,
        K: Hash,
    {
        let worker_idx = match key {
            Some(k) => {
                let mut hasher = DefaultHasher::new();
                k.hash(&mut hasher);
                (hasher.finish() as usize) % self.size
            }
            None => self.next.fetch_add(1, Ordering::Relaxed) % self.size,
        };

        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        match workers.get(worker_idx) {
            Some(worker) => worker.sender.send(Message::NewJob(Box::new(f))).is_ok(),
            None => false,
        }
    }

    /// Let queued jobs finish, then stop and join every worker. Idempotent.
    pub fn shutdown(&self) {
        let workers: Vec<Worker> = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for worker in &workers {
            let _ = worker.sender.send(Message::Terminate);
        }
        for mut worker in workers {
            if let Some(handle) = worker.thread.take() {
                if handle.thread().id() != thread::current().id() {
                    let _ = handle.join();
                }
            }
        }
    }
}

impl Drop for CallbackPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
