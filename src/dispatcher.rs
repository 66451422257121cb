// src/dispatcher.rs

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::error;

use crate::events::{PauseEvent, ProgressEvent};
use crate::models::RequestRecord;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// An execution context that listener callbacks run on.
///
/// Implementations must run jobs in submission order and must not run them
/// synchronously on the submitting thread: the engine submits jobs while
/// holding its queue lock.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Any closure that posts a job somewhere (a UI loop, a runtime handle) is an executor.
impl<F> Executor for F
where
    F: Fn(Job) + Send + Sync,
{
    fn execute(&self, job: Job) {
        self(job)
    }
}

/// A dedicated thread that runs jobs one at a time in FIFO order.
///
/// The thread exits once every handle to the executor has been dropped.
pub struct SerialExecutor {
    sender: mpsc::UnboundedSender<Job>,
}

impl SerialExecutor {
    pub fn spawn() -> std::io::Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        std::thread::Builder::new()
            .name("odm-callbacks".to_string())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    run_guarded(job);
                }
            })?;
        Ok(Self { sender })
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, job: Job) {
        if self.sender.send(job).is_err() {
            error!("callback thread has stopped; dropping listener job");
        }
    }
}

/// A panicking listener must not take the callback context down with it.
fn run_guarded(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("download listener panicked");
    }
}

/// Relays listener notifications from workers onto the caller's execution context.
#[derive(Clone)]
pub struct CallbackDispatcher {
    executor: Arc<dyn Executor>,
}

impl CallbackDispatcher {
    pub fn new(executor: impl Executor + 'static) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }

    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        self.executor.execute(Box::new(job));
    }

    /// Queues a progress notification carrying the record's current counters.
    pub fn progress(&self, record: &RequestRecord) {
        if let Some(callback) = record.listeners().on_progress {
            let event = ProgressEvent {
                id: record.id(),
                downloaded_bytes: record.downloaded_bytes(),
                total_bytes: record.total_bytes(),
            };
            self.dispatch(move || callback(event));
        }
    }

    pub fn pause(&self, record: &RequestRecord) {
        if let Some(callback) = record.listeners().on_pause {
            let event = PauseEvent { id: record.id() };
            self.dispatch(move || callback(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_serial_executor_keeps_order() {
        let dispatcher = CallbackDispatcher::new(SerialExecutor::spawn().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        for i in 0..100 {
            let seen = seen.clone();
            dispatcher.dispatch(move || seen.lock().unwrap().push(i));
        }
        dispatcher.dispatch(move || done_tx.send(()).unwrap());

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_job_does_not_stop_executor() {
        let dispatcher = CallbackDispatcher::new(SerialExecutor::spawn().unwrap());
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        dispatcher.dispatch(|| panic!("listener bug"));
        dispatcher.dispatch(move || done_tx.send(42).unwrap());

        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_closure_executor_posts_to_another_thread() {
        let (job_tx, job_rx) = std::sync::mpsc::channel::<Job>();
        let worker = std::thread::spawn(move || {
            let mut ran = 0;
            while let Ok(job) = job_rx.recv() {
                job();
                ran += 1;
            }
            ran
        });

        let poster = Mutex::new(job_tx);
        let dispatcher = CallbackDispatcher::new(move |job: Job| {
            let _ = poster.lock().unwrap().send(job);
        });
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        dispatcher.dispatch(move || done_tx.send(std::thread::current().id()).unwrap());

        let ran_on = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(ran_on, std::thread::current().id());
        drop(dispatcher);
        assert_eq!(worker.join().unwrap(), 1);
    }
}
