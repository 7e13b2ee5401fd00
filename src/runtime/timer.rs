use log::{debug, warn};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

type Job = Arc<dyn Fn() + Send + Sync + 'static>;

struct Task {
    job: Job,
    period: Option<Duration>,
}

#[derive(Default)]
struct State {
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Task>,
    next_id: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to a scheduled task. Dropping it does not cancel the task.
#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    shared: Arc<Shared>,
}

impl TaskHandle {
    /// Remove the task. Returns false if it already ran (one-shot) or was cancelled.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.lock();
        state.tasks.remove(&self.id).is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.shared.lock().tasks.contains_key(&self.id)
    }
}

/// Single timer thread running retransmission timeouts and periodic discovery.
///
/// Jobs run on the timer thread outside the state lock, so a job may schedule
/// or cancel other tasks. After [`Scheduler::shutdown`] returns no job runs again.
pub struct Scheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Scheduler {
    pub fn new() -> std::io::Result<Scheduler> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("coap-scheduler".into())
            .spawn(move || run(worker))?;
        Ok(Scheduler {
            shared,
            thread: Mutex::new(Some(thread)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Run `job` once after `delay`
    pub fn schedule<F>(&self, delay: Duration, job: F) -> TaskHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(delay, None, Arc::new(job))
    }

    /// Run `job` after `initial_delay` and then every `period`
    pub fn schedule_repeating<F>(&self, initial_delay: Duration, period: Duration, job: F) -> TaskHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(initial_delay, Some(period), Arc::new(job))
    }

    fn insert(&self, delay: Duration, period: Option<Duration>, job: Job) -> TaskHandle {
        let mut state = self.shared.lock();
        let id = state.next_id;
        state.next_id += 1;
        if !state.shutdown {
            state.tasks.insert(id, Task { job, period });
            state.queue.push(Reverse((Instant::now() + delay, id)));
            self.shared.wakeup.notify_one();
        } else {
            debug!(target: "Scheduler", "Task {} refused after shutdown", id);
        }
        TaskHandle { id, shared: Arc::clone(&self.shared) }
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Cancel every task and join the timer thread. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.tasks.clear();
            state.queue.clear();
        }
        self.shared.wakeup.notify_all();

        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            // A job calling shutdown must not join its own thread
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(target: "Scheduler", "Timer thread panicked");
            }
        }
        debug!(target: "Scheduler", "Scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        match state.queue.peek().copied() {
            None => {
                state = shared.wakeup.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            Some(Reverse((due, _))) if due > now => {
                state = shared
                    .wakeup
                    .wait_timeout(state, due - now)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
            Some(Reverse((_, id))) => {
                state.queue.pop();
                // Cancelled tasks leave stale queue entries behind
                let Some(task) = state.tasks.get(&id) else { continue };
                let job = Arc::clone(&task.job);
                match task.period {
                    Some(period) => state.queue.push(Reverse((now + period, id))),
                    None => {
                        state.tasks.remove(&id);
                    }
                }
                drop(state);
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job())).is_err() {
                    warn!(target: "Scheduler", "Task {} panicked", id);
                }
                state = shared.lock();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_one_shot_runs_once() {
        let scheduler = Scheduler::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handle = scheduler.schedule(Duration::from_millis(10), move || {
            tx.lock().unwrap().send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(!handle.is_pending());
        assert!(!handle.cancel());
    }

    #[test]
    fn test_tasks_run_in_deadline_order() {
        let scheduler = Scheduler::new().unwrap();
        let (tx, rx) = mpsc::channel();
        for (delay, label) in [(60u64, "late"), (10, "early"), (30, "middle")] {
            let tx = Mutex::new(tx.clone());
            scheduler.schedule(Duration::from_millis(delay), move || {
                tx.lock().unwrap().send(label).unwrap();
            });
        }
        let order: Vec<_> = (0..3).map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap()).collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_cancelled_task_never_runs() {
        let scheduler = Scheduler::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let handle = scheduler.schedule(Duration::from_millis(50), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.cancel());
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending_tasks(), 0);
    }

    #[test]
    fn test_repeating_task_until_cancel() {
        let scheduler = Scheduler::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let handle = scheduler.schedule_repeating(Duration::ZERO, Duration::from_millis(20), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(150));
        assert!(handle.cancel());
        let count = fired.load(Ordering::SeqCst);
        assert!(count >= 3, "ran {} times", count);
        thread::sleep(Duration::from_millis(80));
        assert!(fired.load(Ordering::SeqCst) <= count + 1);
    }

    #[test]
    fn test_shutdown_stops_everything() {
        let scheduler = Scheduler::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        scheduler.schedule(Duration::from_millis(50), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.shutdown();
        scheduler.shutdown();
        let f = Arc::clone(&fired);
        let late = scheduler.schedule(Duration::ZERO, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!late.is_pending());
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_job_can_schedule_follow_up() {
        let scheduler = Arc::new(Scheduler::new().unwrap());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let weak = Arc::downgrade(&scheduler);
        scheduler.schedule(Duration::ZERO, move || {
            if let Some(s) = weak.upgrade() {
                let tx = Mutex::new(tx.lock().unwrap().clone());
                s.schedule(Duration::from_millis(5), move || {
                    tx.lock().unwrap().send(()).unwrap();
                });
            }
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }
}
