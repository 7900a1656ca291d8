//! Runnable tasks on dedicated threads.
//!
//! A `CycleTask` does one bounded unit of work per `run_cycle` call. `start`
//! runs it on its own named thread until the task exits or its `StopSignal` is
//! raised; the flag is checked between cycles, so a stop takes effect within
//! one cycle plus one pacing interval.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Granularity of interruptible sleeps.
const STOP_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleControl {
    Continue,
    Exit,
}

pub trait CycleTask: Send + 'static {
    fn name(&self) -> String;

    /// One unit of work. Long waits inside a cycle should use `stop.sleep`.
    fn run_cycle(&mut self, stop: &StopSignal) -> CycleControl;

    /// Called once on the task thread after the last cycle.
    fn shutdown(&mut self) {}

    /// Pause between cycles.
    fn cycle_interval(&self) -> Duration;
}

/// Cooperative stop flag shared between a task and its owner.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless the signal is raised first.
    ///
    /// Returns `false` when woken by the signal.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_raised() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            std::thread::sleep(remaining.min(STOP_POLL));
        }
    }
}

#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    stop: StopSignal,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the task to stop; does not wait.
    pub fn stop(&self) {
        self.stop.raise();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_raised()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Raise the stop signal and wait for the thread.
    pub fn join(mut self) -> Result<()> {
        self.stop.raise();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("task thread {} panicked", self.name))?;
        }
        Ok(())
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.stop.raise();
    }
}

/// Run `task` on a new thread.
pub fn start<T: CycleTask>(mut task: T) -> Result<TaskHandle> {
    let name = task.name();
    let stop = StopSignal::new();
    let thread_stop = stop.clone();
    let join = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            while !thread_stop.is_raised() {
                if task.run_cycle(&thread_stop) == CycleControl::Exit {
                    break;
                }
                let interval = task.cycle_interval();
                if !interval.is_zero() && !thread_stop.sleep(interval) {
                    break;
                }
            }
            task.shutdown();
        })
        .map_err(|e| anyhow!("failed to spawn task thread {}: {}", name, e))?;
    Ok(TaskHandle {
        name,
        stop,
        join: Some(join),
    })
}
