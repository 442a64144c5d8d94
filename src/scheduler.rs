//! Timer-driven backup loop
//!
//! The [`Scheduler`] moves between three states:
//!
//! ```text
//! Idle ──run()──▶ Sleeping{until} ──timer──▶ Running ──any outcome──▶ Sleeping{next}
//!                        ▲                        │
//!                        └──── trigger_now() ─────┘
//! ```
//!
//! A trigger that arrives while a cycle is running is rejected with
//! [`VaultError::AlreadyRunning`]; nothing is queued. Cycle failures are
//! reported through the result and never stop the loop. Sleeping happens in
//! short slices so [`Scheduler::shutdown`] and wall-clock changes are
//! noticed promptly.

use crate::backup::BackupEngine;
use crate::config::Schedule;
use crate::error::{Result, VaultError};
use crate::lock::WorkspaceLock;
use crate::types::{BackupResult, BackupStatus, Trigger};
use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Something that can run one backup cycle
pub trait CycleRunner: Send + Sync {
    /// Run a cycle; see [`BackupEngine::run_cycle`]
    fn run_cycle(&self, trigger: Trigger, description: Option<&str>) -> Result<BackupResult>;

    /// Lock file reported when a trigger is rejected
    fn lock_path(&self) -> PathBuf;
}

impl CycleRunner for BackupEngine {
    fn run_cycle(&self, trigger: Trigger, description: Option<&str>) -> Result<BackupResult> {
        BackupEngine::run_cycle(self, trigger, description)
    }

    fn lock_path(&self) -> PathBuf {
        WorkspaceLock::path_for(self.working_copy())
    }
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Not started, or stopped
    Idle,
    /// A cycle is in progress
    Running,
    /// Waiting for the next fire time (local wall clock)
    Sleeping {
        /// Next fire time
        until: NaiveDateTime,
    },
}

/// Runs backup cycles on a schedule until shut down
pub struct Scheduler {
    runner: Arc<dyn CycleRunner>,
    schedule: Schedule,
    state: Mutex<SchedulerState>,
    shutdown: AtomicBool,
    poll_interval: Duration,
}

impl Scheduler {
    /// Create an idle scheduler
    pub fn new(runner: Arc<dyn CycleRunner>, schedule: Schedule) -> Self {
        Self {
            runner,
            schedule,
            state: Mutex::new(SchedulerState::Idle),
            shutdown: AtomicBool::new(false),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Set the longest single sleep between clock checks
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Current state
    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    /// Schedule this scheduler follows
    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Ask [`run`](Self::run) to return at its next clock check
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run a manual cycle now
    ///
    /// # Errors
    ///
    /// - [`VaultError::AlreadyRunning`] if a cycle is in progress
    pub fn trigger_now(&self, description: Option<&str>) -> Result<BackupResult> {
        self.execute(Trigger::Manual, description)
    }

    fn execute(&self, trigger: Trigger, description: Option<&str>) -> Result<BackupResult> {
        {
            let mut state = self.state.lock();
            if *state == SchedulerState::Running {
                return Err(VaultError::AlreadyRunning {
                    path: self.runner.lock_path(),
                });
            }
            *state = SchedulerState::Running;
        }

        let outcome = self.runner.run_cycle(trigger, description);

        let until = self.schedule.next_fire_after(now());
        *self.state.lock() = SchedulerState::Sleeping { until };
        outcome
    }

    /// Loop until [`shutdown`](Self::shutdown): sleep until the next fire time, then run a cycle
    pub fn run(&self) {
        info!(schedule = %self.schedule, "Scheduler started");
        while !self.is_shutdown() {
            let until = {
                let mut state = self.state.lock();
                match *state {
                    SchedulerState::Sleeping { until } => until,
                    SchedulerState::Running => self.schedule.next_fire_after(now()),
                    SchedulerState::Idle => {
                        let until = self.schedule.next_fire_after(now());
                        *state = SchedulerState::Sleeping { until };
                        until
                    }
                }
            };
            info!(next = %until.format("%Y-%m-%d %H:%M:%S"), "Next backup scheduled");

            if !self.sleep_until(until) {
                break;
            }
            // A manual trigger may have moved the fire time while we slept
            match self.state() {
                SchedulerState::Sleeping { until: moved } if moved > now() => continue,
                _ => {}
            }
            self.fire();
        }
        *self.state.lock() = SchedulerState::Idle;
        info!("Scheduler stopped");
    }

    /// Sleep in slices; `false` if shutdown was requested first
    fn sleep_until(&self, until: NaiveDateTime) -> bool {
        loop {
            if self.is_shutdown() {
                return false;
            }
            let remaining = until - now();
            let Ok(remaining) = remaining.to_std() else {
                return true;
            };
            if remaining.is_zero() {
                return true;
            }
            std::thread::sleep(remaining.min(self.poll_interval));
        }
    }

    fn fire(&self) {
        match self.execute(Trigger::Scheduled, None) {
            Ok(result) => match result.status {
                BackupStatus::Failed => {
                    error!(error = ?result.error, "Scheduled backup failed");
                }
                status => info!(?status, "Scheduled backup finished"),
            },
            Err(err) => warn!(%err, "Scheduled backup skipped"),
        }
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
