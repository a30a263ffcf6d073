use crate::config::SchedulerConfig;
use crate::retry::scheduler_backoff;
use crate::types::{PriorityBucket, ScheduledTask, TaskDefinition, TaskExecution, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::{
    generate_id, BoundedLog, Clock, ConvoyError, ConvoyResult, EventEmitter, Payload, SystemClock,
};
use cron::Schedule;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Scheduler event names.
pub mod events {
    /// A task entered a priority bucket.
    pub const TASK_SCHEDULED: &str = "task_scheduled";
    /// A task left its bucket and was handed to the dispatcher.
    pub const TASK_DISPATCHED: &str = "task_dispatched";
    /// A dispatched task finished successfully.
    pub const TASK_COMPLETED: &str = "task_completed";
    /// A failed task was re-enqueued with backoff.
    pub const TASK_RETRY: &str = "task_retry";
    /// A task failed with no retries left.
    pub const TASK_FAILED: &str = "task_failed";
    /// A queued task was cancelled.
    pub const TASK_CANCELLED: &str = "task_cancelled";
}

/// Receives every task admitted by the periodic driver.
///
/// The implementation runs the task and reports back through
/// [`TaskScheduler::mark_task_as_completed`] / [`TaskScheduler::mark_task_as_failed`].
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Run one admitted task.
    async fn dispatch(&self, task: ScheduledTask);
}

/// What happened to a task reported as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Re-enqueued; it becomes due again after `delay`.
    Retrying {
        /// Retry number, starting at 1.
        attempt: u32,
        /// Backoff before the task is due again.
        delay: Duration,
    },
    /// No retries left; recorded as a terminal failure.
    Exhausted,
    /// The id is not a running task.
    Unknown,
}

/// Serializable snapshot of scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    /// Tasks queued in the high bucket.
    pub high_priority: usize,
    /// Tasks queued in the normal bucket.
    pub normal_priority: usize,
    /// Tasks queued in the low bucket.
    pub low_priority: usize,
    /// Tasks queued across all buckets.
    pub total_queued: usize,
    /// Tasks dispatched and not yet marked completed or failed.
    pub running: usize,
    /// Successful runs.
    pub completed: u64,
    /// Runs that failed with no retries left.
    pub failed: u64,
    /// Failed runs re-enqueued with backoff.
    pub retried: u64,
    /// Queued tasks removed before dispatch.
    pub cancelled: u64,
    /// Terminal executions currently retained.
    pub retained_executions: usize,
    /// Active recurring schedules.
    pub recurring: usize,
    /// Current admission limit.
    pub max_concurrent_tasks: usize,
    /// Whether the admission loop is running.
    pub is_running: bool,
}

enum Cadence {
    Every(chrono::Duration),
    Cron(Box<Schedule>),
}

struct RecurringTask {
    definition: TaskDefinition,
    cadence: Cadence,
    next_fire: DateTime<Utc>,
    max_executions: Option<u32>,
    executions: u32,
}

impl RecurringTask {
    fn exhausted(&self) -> bool {
        self.max_executions.is_some_and(|max| self.executions >= max)
    }

    fn advance(&mut self, now: DateTime<Utc>) -> bool {
        match &self.cadence {
            Cadence::Every(period) => {
                let mut next = self.next_fire + *period;
                if next <= now {
                    next = now + *period;
                }
                self.next_fire = next;
                true
            }
            Cadence::Cron(schedule) => match schedule.after(&now).next() {
                Some(next) => {
                    self.next_fire = next;
                    true
                }
                None => false,
            },
        }
    }
}

#[derive(Default)]
struct Buckets {
    high: VecDeque<ScheduledTask>,
    normal: VecDeque<ScheduledTask>,
    low: VecDeque<ScheduledTask>,
}

impl Buckets {
    fn get_mut(&mut self, bucket: PriorityBucket) -> &mut VecDeque<ScheduledTask> {
        match bucket {
            PriorityBucket::High => &mut self.high,
            PriorityBucket::Normal => &mut self.normal,
            PriorityBucket::Low => &mut self.low,
        }
    }

    fn remove(&mut self, bucket: PriorityBucket, id: &str) -> Option<ScheduledTask> {
        let queue = self.get_mut(bucket);
        let pos = queue.iter().position(|t| t.id == id)?;
        queue.remove(pos)
    }

    /// All tasks, highest bucket first, FIFO within a bucket.
    fn iter(&self) -> impl Iterator<Item = &ScheduledTask> {
        self.high.iter().chain(self.normal.iter()).chain(self.low.iter())
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }
}

#[derive(Default)]
struct Counters {
    completed: u64,
    failed: u64,
    retried: u64,
    cancelled: u64,
}

struct SchedulerState {
    buckets: Buckets,
    /// Scheduled id -> bucket currently holding the task.
    index: HashMap<String, PriorityBucket>,
    running: HashMap<String, ScheduledTask>,
    finished: BoundedLog<TaskExecution>,
    recurring: HashMap<String, RecurringTask>,
    counters: Counters,
}

/// Priority-ordered admission of delayed and recurring tasks with bounded
/// concurrency and retry-with-backoff.
///
/// Time only matters through the injected [`Clock`]: a task is due once its
/// `scheduled_time` has passed, and retries are re-enqueued with a future
/// `scheduled_time` rather than with a detached timer.
pub struct TaskScheduler {
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    max_concurrent: AtomicUsize,
    state: Mutex<SchedulerState>,
    events: EventEmitter<Payload>,
    running: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// A scheduler on the system clock.
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    /// A scheduler that reads time from `clock`.
    pub fn with_clock(config: &SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            max_concurrent: AtomicUsize::new(config.max_concurrent_tasks.max(1)),
            state: Mutex::new(SchedulerState {
                buckets: Buckets::default(),
                index: HashMap::new(),
                running: HashMap::new(),
                finished: BoundedLog::new(config.completed_retention),
                recurring: HashMap::new(),
                counters: Counters::default(),
            }),
            events: EventEmitter::new(),
            running: AtomicBool::new(false),
            driver: Mutex::new(None),
        }
    }

    /// Register an observer for one of the [`events`].
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&Payload) -> ConvoyResult<()> + Send + Sync + 'static,
    {
        self.events.on(event, handler);
    }

    // --- Admission ---

    /// Enqueue `definition` to become due after `delay`. Returns the scheduled id.
    pub fn schedule_task(&self, definition: TaskDefinition, delay: Duration) -> String {
        self.enqueue(definition, delay, None)
    }

    fn enqueue(&self, definition: TaskDefinition, delay: Duration, recurring_id: Option<String>) -> String {
        let priority = definition.priority;
        let task = ScheduledTask {
            id: generate_id("task"),
            scheduled_time: self.clock.now() + chrono_duration(delay),
            priority: priority.weight(),
            retries: 0,
            max_retries: priority.max_retries(),
            definition,
            recurring_id,
        };
        let id = task.id.clone();
        let bucket = task.bucket();
        debug!(
            task_id = %id,
            definition = %task.definition.id,
            priority = %priority,
            delay_ms = delay.as_millis() as u64,
            "Task scheduled"
        );
        let payload = json!({
            "taskId": id,
            "definitionId": task.definition.id,
            "priority": task.priority,
            "scheduledTime": task.scheduled_time,
        });
        {
            let mut state = self.state.lock();
            state.index.insert(id.clone(), bucket);
            state.buckets.get_mut(bucket).push_back(task);
        }
        self.events.emit_quiet(events::TASK_SCHEDULED, &payload);
        id
    }

    /// Enqueue a fresh copy of `definition` every `interval`, starting one
    /// interval from now, at most `max_executions` times (`None` = forever).
    /// Returns the recurring schedule id.
    pub fn schedule_recurring_task(
        &self,
        definition: TaskDefinition,
        interval: Duration,
        max_executions: Option<u32>,
    ) -> String {
        let period = chrono_duration(interval.max(Duration::from_millis(1)));
        let recurring = RecurringTask {
            next_fire: self.clock.now() + period,
            definition,
            cadence: Cadence::Every(period),
            max_executions,
            executions: 0,
        };
        self.add_recurring(recurring)
    }

    /// Enqueue a fresh copy of `definition` at every fire time of a 7-field
    /// cron expression (sec min hour day-of-month month day-of-week year).
    pub fn schedule_cron_task(
        &self,
        definition: TaskDefinition,
        cron_expr: &str,
        max_executions: Option<u32>,
    ) -> ConvoyResult<String> {
        let schedule = Self::parse_cron(cron_expr)?;
        let next_fire = schedule.after(&self.clock.now()).next().ok_or_else(|| {
            ConvoyError::Config(format!("Cron expression '{cron_expr}' has no upcoming fire times"))
        })?;
        let recurring = RecurringTask {
            definition,
            cadence: Cadence::Cron(Box::new(schedule)),
            next_fire,
            max_executions,
            executions: 0,
        };
        Ok(self.add_recurring(recurring))
    }

    fn add_recurring(&self, recurring: RecurringTask) -> String {
        let id = generate_id("recurring");
        info!(
            recurring_id = %id,
            definition = %recurring.definition.id,
            next_fire = %recurring.next_fire,
            "Recurring task registered"
        );
        self.state.lock().recurring.insert(id.clone(), recurring);
        id
    }

    /// Parse a cron expression string into a [`cron::Schedule`].
    pub fn parse_cron(cron_expr: &str) -> ConvoyResult<Schedule> {
        Schedule::from_str(cron_expr)
            .map_err(|e| ConvoyError::Config(format!("Invalid cron expression '{cron_expr}': {e}")))
    }

    /// Stop a recurring schedule. Already-enqueued occurrences stay queued.
    pub fn cancel_recurring_task(&self, recurring_id: &str) -> bool {
        let removed = self.state.lock().recurring.remove(recurring_id).is_some();
        if removed {
            info!(recurring_id = %recurring_id, "Recurring task cancelled");
        }
        removed
    }

    /// Remove a queued task from its bucket and record a `cancelled`
    /// execution for it. Returns `false` for unknown ids and for tasks that
    /// were already dispatched.
    pub fn cancel_scheduled_task(&self, task_id: &str) -> bool {
        let now = self.clock.now();
        let removed = {
            let mut state = self.state.lock();
            let Some(bucket) = state.index.remove(task_id) else {
                return false;
            };
            let removed = state.buckets.remove(bucket, task_id);
            if let Some(task) = &removed {
                let mut execution = TaskExecution::started(&task.definition.id, None, now);
                execution.retries = task.retries;
                execution.cancel(now);
                state.finished.push(execution);
                state.counters.cancelled += 1;
            }
            removed
        };
        match removed {
            Some(task) => {
                info!(task_id = %task_id, definition = %task.definition.id, "Scheduled task cancelled");
                self.events
                    .emit_quiet(events::TASK_CANCELLED, &json!({ "taskId": task_id }));
                true
            }
            None => false,
        }
    }

    /// Pop the next task in strict bucket order (high, normal, low), FIFO
    /// within a bucket, regardless of its scheduled time.
    pub fn get_next_task(&self) -> Option<ScheduledTask> {
        let mut state = self.state.lock();
        let task = state
            .buckets
            .high
            .pop_front()
            .or_else(|| state.buckets.normal.pop_front())
            .or_else(|| state.buckets.low.pop_front())?;
        state.index.remove(&task.id);
        Some(task)
    }

    /// One admission pass.
    ///
    /// Fires due recurring schedules, collects every due task from all three
    /// buckets, orders them by (priority desc, scheduled time asc) and moves
    /// as many as there are free concurrency slots into the running set.
    /// Due tasks beyond the free slots stay queued in place.
    pub fn process_queue(&self) -> Vec<ScheduledTask> {
        let now = self.clock.now();
        self.fire_recurring(now);

        let max = self.max_concurrent.load(Ordering::SeqCst);
        let dispatched: Vec<ScheduledTask> = {
            let mut state = self.state.lock();
            let free = max.saturating_sub(state.running.len());
            if free == 0 {
                return Vec::new();
            }

            let mut due: Vec<(u8, DateTime<Utc>, PriorityBucket, String)> = state
                .buckets
                .iter()
                .filter(|t| t.scheduled_time <= now)
                .map(|t| (t.priority, t.scheduled_time, t.bucket(), t.id.clone()))
                .collect();
            // Stable: equal keys keep bucket FIFO order.
            due.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

            let mut out = Vec::new();
            for (_, _, bucket, id) in due.into_iter().take(free) {
                state.index.remove(&id);
                if let Some(task) = state.buckets.remove(bucket, &id) {
                    state.running.insert(id, task.clone());
                    out.push(task);
                }
            }
            out
        };

        for task in &dispatched {
            debug!(
                task_id = %task.id,
                definition = %task.definition.id,
                attempt = task.retries + 1,
                "Task dispatched"
            );
            self.events.emit_quiet(
                events::TASK_DISPATCHED,
                &json!({
                    "taskId": task.id,
                    "definitionId": task.definition.id,
                    "attempt": task.retries + 1,
                }),
            );
        }
        dispatched
    }

    fn fire_recurring(&self, now: DateTime<Utc>) {
        let mut due = Vec::new();
        {
            let mut state = self.state.lock();
            let mut finished = Vec::new();
            for (id, recurring) in &mut state.recurring {
                if recurring.next_fire > now {
                    continue;
                }
                due.push((id.clone(), recurring.definition.clone()));
                recurring.executions += 1;
                if recurring.exhausted() || !recurring.advance(now) {
                    finished.push(id.clone());
                }
            }
            for id in finished {
                state.recurring.remove(&id);
                debug!(recurring_id = %id, "Recurring task finished");
            }
        }
        for (recurring_id, definition) in due {
            self.enqueue(definition, Duration::ZERO, Some(recurring_id));
        }
    }

    // --- Completion ---

    /// Record a successful run of a dispatched task.
    pub fn mark_task_as_completed(&self, task_id: &str, mut execution: TaskExecution) -> bool {
        let mut state = self.state.lock();
        let Some(task) = state.running.remove(task_id) else {
            return false;
        };
        execution.retries = task.retries;
        state.counters.completed += 1;
        state.finished.push(execution.clone());
        drop(state);

        info!(
            task_id = %task_id,
            definition = %task.definition.id,
            duration_ms = execution.duration_ms.unwrap_or_default(),
            "Task completed"
        );
        self.events.emit_quiet(
            events::TASK_COMPLETED,
            &serde_json::to_value(&execution).unwrap_or_default(),
        );
        true
    }

    /// Record a failed run of a dispatched task.
    ///
    /// While `retries < max_retries` the task is re-enqueued in its bucket,
    /// due after `min(1000 * 2^(retries-1), 30000)` ms. Otherwise the failure
    /// is terminal and [`events::TASK_FAILED`] is emitted.
    pub fn mark_task_as_failed(&self, task_id: &str, mut execution: TaskExecution) -> FailureOutcome {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(mut task) = state.running.remove(task_id) else {
            return FailureOutcome::Unknown;
        };
        let reason = execution.error.clone().unwrap_or_else(|| "unknown error".to_string());

        if task.retries < task.max_retries {
            task.retries += 1;
            let attempt = task.retries;
            let delay = scheduler_backoff(attempt);
            task.scheduled_time = now + chrono_duration(delay);
            let bucket = task.bucket();
            state.index.insert(task.id.clone(), bucket);
            state.buckets.get_mut(bucket).push_back(task);
            state.counters.retried += 1;
            drop(state);

            warn!(
                task_id = %task_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Task failed, retrying"
            );
            self.events.emit_quiet(
                events::TASK_RETRY,
                &json!({
                    "taskId": task_id,
                    "retries": attempt,
                    "delayMs": delay.as_millis() as u64,
                    "error": reason,
                }),
            );
            return FailureOutcome::Retrying { attempt, delay };
        }

        execution.retries = task.retries;
        if execution.status != TaskStatus::Failed {
            execution.fail(reason.clone(), now);
        }
        state.counters.failed += 1;
        state.finished.push(execution.clone());
        drop(state);

        error!(
            task_id = %task_id,
            definition = %task.definition.id,
            retries = task.retries,
            error = %reason,
            "Task failed permanently"
        );
        self.events.emit_quiet(
            events::TASK_FAILED,
            &serde_json::to_value(&execution).unwrap_or_default(),
        );
        FailureOutcome::Exhausted
    }

    /// Purge terminal executions that ended more than `max_age` ago.
    pub fn cleanup_old_completed_tasks(&self, max_age: Duration) -> usize {
        let cutoff = self.clock.now() - chrono_duration(max_age);
        let removed = self
            .state
            .lock()
            .finished
            .retain(|e| e.end_time.unwrap_or(e.start_time) >= cutoff);
        if removed > 0 {
            info!(removed, "Cleaned up completed tasks");
        }
        removed
    }

    // --- Views ---

    /// Retained terminal executions, newest `limit`, oldest first.
    pub fn get_completed_tasks(&self, limit: usize) -> Vec<TaskExecution> {
        self.state.lock().finished.recent(limit)
    }

    /// Queued tasks in bucket order.
    pub fn get_queued_tasks(&self) -> Vec<ScheduledTask> {
        self.state.lock().buckets.iter().cloned().collect()
    }

    /// Tasks handed out by [`process_queue`](Self::process_queue) and not yet reported back.
    pub fn get_running_tasks(&self) -> Vec<ScheduledTask> {
        self.state.lock().running.values().cloned().collect()
    }

    /// Whether `task_id` is waiting in a bucket.
    pub fn is_queued(&self, task_id: &str) -> bool {
        self.state.lock().index.contains_key(task_id)
    }

    /// Change the admission limit. Values below 1 are raised to 1.
    pub fn set_max_concurrent_tasks(&self, max: usize) {
        let max = max.max(1);
        self.max_concurrent.store(max, Ordering::SeqCst);
        info!(max_concurrent_tasks = max, "Scheduler concurrency updated");
    }

    /// Counters and queue sizes.
    pub fn get_scheduler_stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        SchedulerStats {
            high_priority: state.buckets.high.len(),
            normal_priority: state.buckets.normal.len(),
            low_priority: state.buckets.low.len(),
            total_queued: state.buckets.len(),
            running: state.running.len(),
            completed: state.counters.completed,
            failed: state.counters.failed,
            retried: state.counters.retried,
            cancelled: state.counters.cancelled,
            retained_executions: state.finished.len(),
            recurring: state.recurring.len(),
            max_concurrent_tasks: self.max_concurrent.load(Ordering::SeqCst),
            is_running: self.running.load(Ordering::SeqCst),
        }
    }

    // --- Driver ---

    /// Whether the admission loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the periodic admission loop, handing every admitted task to
    /// `dispatcher` on its own tokio task.
    pub fn start(self: &Arc<Self>, dispatcher: Arc<dyn TaskDispatcher>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !scheduler.is_running() {
                    continue;
                }
                for task in scheduler.process_queue() {
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move { dispatcher.dispatch(task).await });
                }
            }
        });
        *self.driver.lock() = Some(handle);
        info!(tick_ms = self.tick_interval.as_millis() as u64, "Task scheduler started");
    }

    /// Stop admitting tasks. Tasks already dispatched keep running.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
        info!("Task scheduler stopped");
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}
