//! Callback contexts: where completions and delegate notifications run.

use std::any::Any;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::{error, warn};

/// A unit of work handed to a [`CallbackContext`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs callbacks. Implementations must never run two jobs at the same time.
pub trait CallbackContext: Send + Sync {
    fn dispatch(&self, job: Job);
}

/// Serial FIFO queue backed by one dedicated, named thread.
pub struct SerialQueue {
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl SerialQueue {
    pub fn new(label: &str) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let worker = thread::Builder::new()
            .name(label.to_string())
            .spawn(move || {
                for job in receiver {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                        error!(panic = %panic_message(panic.as_ref()), "callback job panicked");
                    }
                }
            })?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }
}

impl CallbackContext for SerialQueue {
    fn dispatch(&self, job: Job) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(job).is_err() {
            warn!("callback queue stopped; job dropped");
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued, then exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn runs_jobs_in_order_on_named_thread() {
        let queue = SerialQueue::new("parcel-test-queue").unwrap();
        let (tx, rx) = unbounded();
        for i in 0..20 {
            let tx = tx.clone();
            queue.dispatch(Box::new(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send((i, name)).unwrap();
            }));
        }
        for expected in 0..20 {
            let (i, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(i, expected);
            assert_eq!(name.as_deref(), Some("parcel-test-queue"));
        }
    }

    #[test]
    fn survives_panicking_job() {
        let queue = SerialQueue::new("parcel-panic-queue").unwrap();
        let (tx, rx) = unbounded();
        queue.dispatch(Box::new(|| panic!("boom")));
        queue.dispatch(Box::new(move || tx.send(()).unwrap()));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn drop_drains_queued_jobs() {
        let (tx, rx) = unbounded();
        {
            let queue = SerialQueue::new("parcel-drain-queue").unwrap();
            for i in 0..5 {
                let tx = tx.clone();
                queue.dispatch(Box::new(move || tx.send(i).unwrap()));
            }
        }
        let drained: Vec<i32> = rx.try_iter().collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }
}
