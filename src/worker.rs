// Background worker lifecycle shared by the capture, socket-table and aggregator loops

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default time `stop()` waits for worker threads to exit
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// A unit of background work, run on its own named thread
pub struct Job {
    name: String,
    body: Box<dyn FnOnce(StopSignal) + Send + 'static>,
}

impl Job {
    pub fn new(name: impl Into<String>, body: impl FnOnce(StopSignal) + Send + 'static) -> Self {
        Self {
            name: name.into(),
            body: Box::new(body),
        }
    }
}

/// Cooperative cancellation handle handed to every job.
///
/// Stop is requested by dropping the sending half of the channel, so every
/// clone observes it at once.
#[derive(Clone)]
pub struct StopSignal {
    rx: Receiver<()>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        !matches!(self.rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// Sleep for `interval` or until stop is requested. Returns true if stopped.
    pub fn wait(&self, interval: Duration) -> bool {
        !matches!(self.rx.recv_timeout(interval), Err(RecvTimeoutError::Timeout))
    }
}

enum WorkerState {
    Stopped,
    Running(Running),
}

struct Running {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handles: Vec<JoinHandle<()>>,
}

/// Explicit {Stopped, Running} state machine guarded by a single mutex.
///
/// `start` and `stop` are idempotent and safe to call from any thread.
pub struct Worker {
    name: &'static str,
    stop_timeout: Duration,
    state: Mutex<WorkerState>,
}

impl Worker {
    pub fn new(name: &'static str) -> Self {
        Self::with_stop_timeout(name, DEFAULT_STOP_TIMEOUT)
    }

    pub fn with_stop_timeout(name: &'static str, stop_timeout: Duration) -> Self {
        Self {
            name,
            stop_timeout,
            state: Mutex::new(WorkerState::Stopped),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Transition Stopped -> Running.
    ///
    /// `prepare` runs under the state lock, only when the worker is stopped, and
    /// returns the jobs to spawn. If it fails nothing is spawned and the error
    /// is returned. Returns `Ok(false)` if the worker was already running.
    pub fn start<F>(&self, prepare: F) -> Result<bool>
    where
        F: FnOnce() -> Result<Vec<Job>>,
    {
        let mut state = self.lock();
        if matches!(*state, WorkerState::Running(_)) {
            log::debug!("{} already running", self.name);
            return Ok(false);
        }

        let jobs = prepare()?;

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded::<()>(0);
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            let signal = StopSignal { rx: stop_rx.clone() };
            let done = done_tx.clone();
            let body = job.body;
            let spawned = thread::Builder::new()
                .name(job.name.clone())
                .spawn(move || {
                    body(signal);
                    drop(done);
                })
                .with_context(|| format!("Failed to spawn thread {}", job.name));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Tear down what was already spawned before reporting
                    drop(stop_tx);
                    drop(done_tx);
                    Self::join_within(self.name, handles, &done_rx, self.stop_timeout);
                    return Err(e);
                }
            }
        }
        drop(done_tx);

        log::info!("{} started ({} thread(s))", self.name, handles.len());
        *state = WorkerState::Running(Running {
            stop_tx,
            done_rx,
            handles,
        });
        Ok(true)
    }

    /// Transition Running -> Stopped, waiting up to the stop timeout for the
    /// threads to observe the request. Threads still running after that are detached.
    pub fn stop(&self) {
        let running = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, WorkerState::Stopped) {
                WorkerState::Running(running) => running,
                WorkerState::Stopped => return,
            }
        };

        let Running {
            stop_tx,
            done_rx,
            handles,
        } = running;
        drop(stop_tx);

        if Self::join_within(self.name, handles, &done_rx, self.stop_timeout) {
            log::info!("{} stopped", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), WorkerState::Running(_))
    }

    fn join_within(
        name: &str,
        handles: Vec<JoinHandle<()>>,
        done_rx: &Receiver<()>,
        timeout: Duration,
    ) -> bool {
        // Every thread holds a clone of the done sender; disconnection means all have returned
        let deadline = Instant::now() + timeout;
        loop {
            match done_rx.recv_deadline(deadline) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "{} did not stop within {:?}, detaching {} thread(s)",
                        name,
                        timeout,
                        handles.len()
                    );
                    return false;
                }
            }
        }

        for handle in handles {
            if handle.join().is_err() {
                log::warn!("{} thread panicked", name);
            }
        }
        true
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn looping_job(iterations: Arc<AtomicUsize>) -> Job {
        Job::new("test-loop", move |signal| {
            while !signal.is_stopped() {
                iterations.fetch_add(1, Ordering::SeqCst);
                if signal.wait(Duration::from_millis(5)) {
                    break;
                }
            }
        })
    }

    #[test]
    fn test_start_is_idempotent() {
        let worker = Worker::new("test");
        let prepared = AtomicUsize::new(0);
        let iterations = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            worker
                .start(|| {
                    prepared.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![looping_job(Arc::clone(&iterations))])
                })
                .unwrap();
        }

        assert!(worker.is_running());
        assert_eq!(prepared.load(Ordering::SeqCst), 1);
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_concurrent_start_spawns_once() {
        let worker = Arc::new(Worker::new("test"));
        let prepared = Arc::new(AtomicUsize::new(0));
        let iterations = Arc::new(AtomicUsize::new(0));

        let callers: Vec<_> = (0..10)
            .map(|_| {
                let worker = Arc::clone(&worker);
                let prepared = Arc::clone(&prepared);
                let iterations = Arc::clone(&iterations);
                thread::spawn(move || {
                    worker
                        .start(|| {
                            prepared.fetch_add(1, Ordering::SeqCst);
                            Ok(vec![looping_job(iterations)])
                        })
                        .is_ok()
                })
            })
            .collect();

        for caller in callers {
            assert!(caller.join().unwrap());
        }
        assert_eq!(prepared.load(Ordering::SeqCst), 1);
        worker.stop();
    }

    #[test]
    fn test_stop_without_start() {
        let worker = Worker::new("test");
        worker.stop();
        worker.stop();
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_failed_prepare_leaves_worker_stopped() {
        let worker = Worker::new("test");
        let result = worker.start(|| Err(anyhow::anyhow!("no such interface")));
        assert!(result.is_err());
        assert!(!worker.is_running());
    }

    #[test]
    fn test_restart_after_stop() {
        let worker = Worker::new("test");
        let iterations = Arc::new(AtomicUsize::new(0));

        assert!(worker.start(|| Ok(vec![looping_job(Arc::clone(&iterations))])).unwrap());
        worker.stop();
        assert!(worker.start(|| Ok(vec![looping_job(Arc::clone(&iterations))])).unwrap());
        assert!(worker.is_running());
        worker.stop();
    }

    #[test]
    fn test_stop_gives_up_on_stuck_thread() {
        let worker = Worker::with_stop_timeout("test", Duration::from_millis(50));
        worker
            .start(|| {
                Ok(vec![Job::new("stuck", |_signal| {
                    thread::sleep(Duration::from_millis(500));
                })])
            })
            .unwrap();

        let started = Instant::now();
        worker.stop();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(!worker.is_running());
    }

    #[test]
    fn test_wait_returns_immediately_after_stop() {
        let (tx, rx) = bounded::<()>(0);
        let signal = StopSignal { rx };
        assert!(!signal.is_stopped());
        drop(tx);
        assert!(signal.is_stopped());
        assert!(signal.wait(Duration::from_secs(10)));
    }
}
