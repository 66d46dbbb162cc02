//! Background workers: checkpointer, page copier, cleanup manager,
//! active-transaction-cache refresher. Each is an independent task
//! owning its own cancellation token rather than an internal timer,
//! built on an `AtomicBool` running-flag plus a `Duration`
//! poll-interval, using `std::thread::spawn` rather than an async
//! runtime to match the rest of the crate's synchronous, latch-based
//! design.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One cooperatively-cancellable background loop. `tick` runs once per
/// poll interval until `stop()` is called; `run_once()` lets tests and
/// `ptctl` drive a single tick deterministically without waiting on
/// the timer.
pub struct Worker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: &'static str, poll_interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let running_loop = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while running_loop.load(Ordering::SeqCst) {
                    tick();
                    thread::sleep(poll_interval);
                }
            })
            .expect("failed to spawn background worker thread");

        Worker {
            running,
            handle: Some(handle),
        }
    }

    /// Drain-oriented shutdown: flips the running flag and waits for
    /// the current tick (if any) to finish, rather than aborting it
    /// mid-flight.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn worker_ticks_until_stopped() {
        let count = Arc::new(AtomicU32::new(0));
        let count2 = Arc::clone(&count);
        let worker = Worker::spawn("test-worker", Duration::from_millis(5), move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(40));
        worker.stop();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn dropping_a_worker_stops_its_thread() {
        let count = Arc::new(AtomicU32::new(0));
        let count2 = Arc::clone(&count);
        {
            let _worker = Worker::spawn("drop-test", Duration::from_millis(5), move || {
                count2.fetch_add(1, Ordering::SeqCst);
            });
            thread::sleep(Duration::from_millis(20));
        }
        let observed = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(observed, count.load(Ordering::SeqCst), "worker kept ticking after drop");
    }
}
