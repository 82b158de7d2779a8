//! Periodic background work such as debug dumps and encoder tuning.
//!
//! The [`Scheduler`] itself does no I/O and reads no clock: the owner asks
//! [`Scheduler::poll_timeout`] when to come back and calls
//! [`Scheduler::handle_timeout`] then. [`Scheduler::spawn`] drives it from a
//! dedicated thread for callers without their own loop.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest the background thread sleeps before checking for a stop.
pub const MAX_TICK: Duration = Duration::from_millis(50);

/// A periodic callback, given the current time.
pub type Task = Box<dyn FnMut(Instant) + Send>;

struct Periodic {
    name: &'static str,
    interval: Duration,
    next: Option<Instant>,
    task: Task,
}

/// Owned runner of periodic tasks.
#[derive(Default)]
pub struct Scheduler {
    tasks: Vec<Periodic>,
    running: bool,
}

impl Scheduler {
    /// New scheduler without tasks, stopped.
    pub fn new() -> Self {
        Scheduler::default()
    }

    /// Add a task run every `interval`. A zero interval is bumped to 1ms.
    ///
    /// If the scheduler is running, the first run is one interval after the
    /// next [`Scheduler::handle_timeout`].
    pub fn add<F>(&mut self, name: &'static str, interval: Duration, task: F)
    where
        F: FnMut(Instant) + Send + 'static,
    {
        self.tasks.push(Periodic {
            name,
            interval: interval.max(Duration::from_millis(1)),
            next: None,
            task: Box::new(task),
        });
    }

    /// Start running tasks, the first ones one interval after `now`.
    pub fn start(&mut self, now: Instant) {
        self.running = true;
        for t in &mut self.tasks {
            t.next = Some(now + t.interval);
        }
    }

    /// Stop running tasks. They can be restarted with [`Scheduler::start`].
    pub fn stop(&mut self) {
        self.running = false;
        for t in &mut self.tasks {
            t.next = None;
        }
    }

    /// Whether [`Scheduler::start`] was called without a later stop.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// When the next task is due. `None` when stopped or without tasks.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if !self.running {
            return None;
        }
        self.tasks.iter().filter_map(|t| t.next).min()
    }

    /// Run the tasks due at `now`. Returns how many ran.
    ///
    /// Runs missed while the owner was late are not caught up.
    pub fn handle_timeout(&mut self, now: Instant) -> usize {
        if !self.running {
            return 0;
        }

        let mut ran = 0;
        for t in &mut self.tasks {
            let Some(next) = t.next else {
                t.next = Some(now + t.interval);
                continue;
            };
            if next > now {
                continue;
            }
            trace!("Run task {}", t.name);
            (t.task)(now);
            ran += 1;

            let mut next = next + t.interval;
            if next <= now {
                next = now + t.interval;
            }
            t.next = Some(next);
        }
        ran
    }

    /// Drive the scheduler from a new thread named `name`, starting it if
    /// needed.
    pub fn spawn(mut self, name: &str) -> io::Result<SchedulerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
            if !self.running {
                self.start(Instant::now());
            }
            while !flag.load(Ordering::Relaxed) {
                let now = Instant::now();
                self.handle_timeout(now);
                let wait = self
                    .poll_timeout()
                    .map(|t| t.saturating_duration_since(now))
                    .unwrap_or(MAX_TICK)
                    .min(MAX_TICK);
                thread::park_timeout(wait);
            }
            self.stop();
            self
        })?;

        debug!("Scheduler thread {} started", name);

        Ok(SchedulerHandle {
            stop,
            thread: Some(thread),
        })
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.tasks.iter().map(|t| t.name).collect();
        f.debug_struct("Scheduler")
            .field("tasks", &names)
            .field("running", &self.running)
            .finish()
    }
}

/// Handle to a scheduler running on its own thread.
///
/// Dropping the handle stops and joins the thread.
#[derive(Debug)]
pub struct SchedulerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Scheduler>>,
}

impl SchedulerHandle {
    /// Stop the thread, wait for it, and get the stopped scheduler back.
    ///
    /// `None` if a task panicked.
    pub fn stop(mut self) -> Option<Scheduler> {
        self.join()
    }

    fn join(&mut self) -> Option<Scheduler> {
        let thread = self.thread.take()?;
        self.stop.store(true, Ordering::Relaxed);
        thread.thread().unpark();
        match thread.join() {
            Ok(s) => Some(s),
            Err(_) => {
                warn!("Scheduler thread panicked");
                None
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.join();
    }
}
