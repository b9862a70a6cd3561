//! Restartable background threads.
//!
//! A [`RestartableThread`] runs an entry function on a dedicated OS thread.
//! When the entry function returns, the thread either exits or, if a restart
//! was requested in the meantime, calls the entry function again.
//!
//! State transitions:
//!
//! | from         | event                      | to           |
//! |--------------|----------------------------|--------------|
//! | `Idle`       | `start()`                  | `Running`    |
//! | `Idle`       | `stop(restart = true, _)`  | `Running`    |
//! | `Running`    | `stop(false, _)`           | `Exiting`    |
//! | `Running`    | `stop(true, _)`            | `Restarting` |
//! | `Exiting`    | `start()`                  | `Restarting` |
//! | `Restarting` | entry function returns     | `Running`    |
//! | `Running`    | entry function returns     | `Idle`       |
//! | `Exiting`    | entry function returns     | `Idle`       |
//!
//! Every transition happens while holding the thread's own state lock.

use crate::error::Error;
use mio::Waker;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`RestartableThread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// No worker is running.
    Idle,
    /// The entry function runs and should keep running.
    Running,
    /// The entry function should return; the thread then goes idle.
    Exiting,
    /// The entry function should return; it is then invoked again.
    Restarting,
}

struct ControlState {
    state: ThreadState,
    started: bool,
    // Incremented every time the entry function returns.
    runs_finished: u64,
    // Incremented every time the worker reaches `Idle`.
    exits: u64,
    doorbell: Option<Arc<Waker>>,
    worker: Option<ThreadId>,
    handle: Option<JoinHandle<()>>,
}

/// Shared state of a [`RestartableThread`], handed to its entry function.
///
/// Entry functions poll [`is_running()`](Self::is_running) to learn when to
/// return. Blocking waits should go through [`pause()`](Self::pause) or a
/// doorbell so that a stop request interrupts them.
pub struct ThreadControl {
    name: String,
    inner: Mutex<ControlState>,
    changed: Condvar,
}

impl ThreadControl {
    fn new(name: String) -> Self {
        Self {
            name,
            inner: Mutex::new(ControlState {
                state: ThreadState::Idle,
                started: false,
                runs_finished: 0,
                exits: 0,
                doorbell: None,
                worker: None,
                handle: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Human-readable thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ThreadState {
        self.lock().state
    }

    /// Returns true while the entry function is expected to keep going.
    pub fn is_running(&self) -> bool {
        self.state() == ThreadState::Running
    }

    /// Number of times the worker has gone idle.
    pub fn exits(&self) -> u64 {
        self.lock().exits
    }

    /// Sleeps for `duration` unless the thread is asked to stop first.
    ///
    /// Returns true if the thread is still meant to be running afterwards.
    pub fn pause(&self, duration: Duration) -> bool {
        let inner = self.lock();
        let (inner, _) = self
            .changed
            .wait_timeout_while(inner, duration, |inner| inner.state == ThreadState::Running)
            .unwrap_or_else(PoisonError::into_inner);
        inner.state == ThreadState::Running
    }

    /// Announces that the worker has reached its steady state.
    pub fn signal_started(&self) {
        let mut inner = self.lock();
        if !inner.started {
            inner.started = true;
            self.changed.notify_all();
        }
    }

    /// Waits until [`signal_started()`](Self::signal_started) was called
    /// during the current run of the entry function. A restart clears it.
    ///
    /// Returns false if the timeout expires or the worker goes idle first.
    pub fn wait_started(&self, timeout: Option<Duration>) -> bool {
        let inner = self.lock();
        let waiting = |inner: &mut ControlState| !inner.started && inner.state != ThreadState::Idle;
        let inner = match timeout {
            Some(timeout) => {
                self.changed
                    .wait_timeout_while(inner, timeout, waiting)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .changed
                .wait_while(inner, waiting)
                .unwrap_or_else(PoisonError::into_inner),
        };
        inner.started
    }

    /// Registers a waker that is rung whenever the thread is asked to stop.
    ///
    /// The waker stays installed until the returned guard is dropped. If a
    /// stop is already pending, the waker is rung right away.
    pub fn install_doorbell(&self, doorbell: Arc<Waker>) -> DoorbellGuard<'_> {
        let mut inner = self.lock();
        if inner.state != ThreadState::Running {
            ring(&self.name, &doorbell);
        }
        inner.doorbell = Some(doorbell);
        DoorbellGuard { control: self }
    }
}

/// Uninstalls a doorbell from its [`ThreadControl`] when dropped.
pub struct DoorbellGuard<'a> {
    control: &'a ThreadControl,
}

impl Drop for DoorbellGuard<'_> {
    fn drop(&mut self) {
        self.control.lock().doorbell = None;
    }
}

fn ring(name: &str, doorbell: &Waker) {
    if let Err(err) = doorbell.wake() {
        warn!(thread = name, ?err, "Failed to ring doorbell");
    }
}

type Entry = dyn Fn(&ThreadControl) + Send + Sync;

/// A cancelable worker whose entry function can be re-invoked without an
/// external start.
pub struct RestartableThread {
    control: Arc<ThreadControl>,
    entry: Arc<Entry>,
}

impl RestartableThread {
    /// Creates an idle thread. Nothing runs until [`start()`](Self::start).
    pub fn new<F>(name: impl Into<String>, entry: F) -> Self
    where
        F: Fn(&ThreadControl) + Send + Sync + 'static,
    {
        Self {
            control: Arc::new(ThreadControl::new(name.into())),
            entry: Arc::new(entry),
        }
    }

    /// The shared control block, as seen by the entry function.
    pub fn control(&self) -> &Arc<ThreadControl> {
        &self.control
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ThreadState {
        self.control.state()
    }

    /// Starts the worker.
    ///
    /// A no-op while running or restarting. While exiting, the request turns
    /// into a restart so the entry function runs again once it returns.
    pub fn start(&self) -> Result<(), Error> {
        let name = self.control.name();
        let mut inner = self.control.lock();

        match inner.state {
            ThreadState::Idle => {
                // The previous worker has already announced its exit and no
                // longer touches the lock, so joining here cannot block on us.
                if let Some(finished) = inner.handle.take() {
                    let _ = finished.join();
                }

                info!(thread = name, "Starting thread");
                inner.state = ThreadState::Running;
                inner.started = false;

                let control = Arc::clone(&self.control);
                let entry = Arc::clone(&self.entry);
                let spawned = thread::Builder::new()
                    .name(format!("cache_{name}"))
                    .spawn(move || run_worker(control, entry));

                match spawned {
                    Ok(handle) => {
                        inner.worker = Some(handle.thread().id());
                        inner.handle = Some(handle);
                        self.control.changed.notify_all();
                        Ok(())
                    }
                    Err(source) => {
                        error!(thread = name, ?source, "Couldn't start thread");
                        inner.state = ThreadState::Idle;
                        Err(Error::ThreadSpawn {
                            name: name.to_string(),
                            source,
                        })
                    }
                }
            }
            ThreadState::Exiting => {
                info!(thread = name, "Restarting thread");
                inner.state = ThreadState::Restarting;
                self.control.changed.notify_all();
                Ok(())
            }
            ThreadState::Running | ThreadState::Restarting => Ok(()),
        }
    }

    /// Asks the worker to exit (`restart = false`) or to run its entry
    /// function again (`restart = true`).
    ///
    /// With `wait`, blocks until the current run of the entry function has
    /// returned. Stopping an idle thread with `restart` starts it.
    pub fn stop(&self, restart: bool, wait: bool) -> Result<(), Error> {
        let name = self.control.name();
        let target = if restart {
            ThreadState::Restarting
        } else {
            ThreadState::Exiting
        };
        debug!(thread = name, ?target, "Stopping thread");

        let mut inner = self.control.lock();

        if inner.state == ThreadState::Idle {
            drop(inner);
            if restart {
                return self.start();
            }
            return Ok(());
        }

        if inner.state != target {
            inner.state = target;
            if let Some(doorbell) = &inner.doorbell {
                ring(name, doorbell);
            }
            self.control.changed.notify_all();
        }

        // The worker cannot wait for itself.
        if !wait || inner.worker == Some(thread::current().id()) {
            return Ok(());
        }

        let seen = inner.runs_finished;
        let mut inner = self
            .control
            .changed
            .wait_while(inner, |inner| inner.runs_finished == seen)
            .unwrap_or_else(PoisonError::into_inner);

        let finished = if inner.state == ThreadState::Idle {
            inner.handle.take()
        } else {
            None
        };
        drop(inner);

        if let Some(finished) = finished {
            let _ = finished.join();
        }
        info!(thread = name, "Thread stopped");
        Ok(())
    }

    /// Waits until the thread is idle or `timeout` expires.
    ///
    /// Returns true if the thread is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        // No deadline if it lies beyond what `Instant` can represent.
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.control.lock();
        while inner.state != ThreadState::Idle {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            if remaining.is_zero() {
                return false;
            }
            inner = self
                .control
                .changed
                .wait_timeout(inner, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl Drop for RestartableThread {
    fn drop(&mut self) {
        if let Err(err) = self.stop(false, true) {
            warn!(thread = self.control.name(), %err, "Failed to stop thread on drop");
        }
    }
}

fn run_worker(control: Arc<ThreadControl>, entry: Arc<Entry>) {
    loop {
        if panic::catch_unwind(AssertUnwindSafe(|| entry(control.as_ref()))).is_err() {
            error!(thread = control.name(), "Thread entry function panicked");
        }

        let mut inner = control.lock();
        inner.runs_finished += 1;

        if inner.state == ThreadState::Restarting {
            info!(thread = control.name(), "Restarting thread");
            inner.state = ThreadState::Running;
            inner.started = false;
            control.changed.notify_all();
            continue;
        }

        inner.state = ThreadState::Idle;
        inner.worker = None;
        inner.exits += 1;
        control.changed.notify_all();
        drop(inner);

        info!(thread = control.name(), "Thread exited");
        return;
    }
}
