// Copyright 2020 Joyent, Inc.

//! Process-wide periodic task facility.
//!
//! Lease renewal, lease expiry sweeps, pool reaping and pull-callback polling
//! all register here.  Ticks are driven by a small dedicated tokio runtime;
//! the task bodies are blocking code and run on its blocking pool so that a
//! slow network call never delays another task's tick.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slog::{debug, o, warn, Drain, Logger};
use tokio::runtime::{Builder, Runtime};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Handle to a registered periodic task.  Dropping the handle does not cancel
/// the task; call `cancel`.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    token: CancellationToken,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct Scheduler {
    runtime: Option<Runtime>,
    shutdown: CancellationToken,
    log: Logger,
}

impl Scheduler {
    pub fn new(log: Option<&Logger>) -> Result<Scheduler> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("component" => "scheduler"));
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("remoting-timer")
            .enable_time()
            .build()?;

        Ok(Scheduler {
            runtime: Some(runtime),
            shutdown: CancellationToken::new(),
            log,
        })
    }

    /// Runs `task` every `period`, first after one period has elapsed.  A run
    /// that overruns its period delays the next tick rather than stacking up.
    pub fn schedule<F>(&self, name: &str, period: Duration, task: F) -> TaskHandle
    where
        F: FnMut() + Send + 'static,
    {
        let token = self.shutdown.child_token();
        let handle = TaskHandle {
            name: name.to_string(),
            token: token.clone(),
        };
        let runtime = match &self.runtime {
            Some(rt) => rt,
            None => {
                token.cancel();
                return handle;
            }
        };

        let period = period.max(Duration::from_millis(1));
        let task = Arc::new(Mutex::new(task));
        let log = self.log.new(o!("task" => name.to_string()));
        debug!(log, "scheduling periodic task"; "period_ms" => period.as_millis() as u64);

        runtime.spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let task = Arc::clone(&task);
                        let run = tokio::task::spawn_blocking(move || {
                            let mut f = task.lock();
                            (*f)()
                        });
                        if let Err(e) = run.await {
                            warn!(log, "periodic task failed"; "error" => %e);
                        }
                    }
                }
            }
            debug!(log, "periodic task stopped");
        });

        handle
    }

    /// Cancels every task and stops the timer threads.
    pub fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
