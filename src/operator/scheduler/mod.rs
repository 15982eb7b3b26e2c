/*
 * Copyright (C) 2025 The Staticpod Operator Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Background job runner for the operator's long-lived loops: watch
//! streams, pruning and resync ticks, and the simulated installer.

use crate::operator::logger::log_error;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

pub type JobFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobResult {
    Stop,
    Continue,
}

#[derive(Clone)]
pub struct ScheduleContext {
    task_id: TaskId,
    label: &'static str,
    cancellation: CancellationToken,
    scheduled_for: Option<DateTime<Utc>>,
    iteration: u64,
}

impl ScheduleContext {
    fn new(
        task_id: TaskId,
        label: &'static str,
        cancellation: CancellationToken,
        scheduled_for: Option<DateTime<Utc>>,
        iteration: u64,
    ) -> Self {
        ScheduleContext {
            task_id,
            label,
            cancellation,
            scheduled_for,
            iteration,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn scheduled_for(&self) -> Option<DateTime<Utc>> {
        self.scheduled_for
    }

    /// Zero for the first run of a job, incremented on every interval tick.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TaskId(u64);

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    next_id: AtomicU64,
}

#[derive(Clone, Debug)]
pub enum ScheduleSpec {
    Immediate {
        label: &'static str,
    },
    After {
        label: &'static str,
        delay: Duration,
    },
    /// Runs every `period` until the job returns [`JobResult::Stop`] or the
    /// task is cancelled. The first run happens one period after scheduling.
    Interval {
        label: &'static str,
        period: Duration,
    },
}

type JobFn = dyn Fn(ScheduleContext) -> JobFuture + Send + Sync + 'static;

pub struct ScheduledTaskHandle {
    cancellation: CancellationToken,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn global() -> Scheduler {
        static INSTANCE: OnceLock<Scheduler> = OnceLock::new();
        INSTANCE
            .get_or_init(|| Scheduler {
                inner: Arc::new(SchedulerInner {
                    next_id: AtomicU64::new(1),
                }),
            })
            .clone()
    }

    pub fn schedule<F>(&self, spec: ScheduleSpec, job: F) -> ScheduledTaskHandle
    where
        F: Fn(ScheduleContext) -> JobFuture + Send + Sync + 'static,
    {
        self.schedule_with_token(CancellationToken::new(), spec, job)
    }

    /// Schedules `job` under a child of `parent`, so cancelling the parent
    /// stops the task as well.
    pub fn schedule_child<F>(
        &self,
        parent: &CancellationToken,
        spec: ScheduleSpec,
        job: F,
    ) -> ScheduledTaskHandle
    where
        F: Fn(ScheduleContext) -> JobFuture + Send + Sync + 'static,
    {
        self.schedule_with_token(parent.child_token(), spec, job)
    }

    fn schedule_with_token<F>(
        &self,
        cancellation: CancellationToken,
        spec: ScheduleSpec,
        job: F,
    ) -> ScheduledTaskHandle
    where
        F: Fn(ScheduleContext) -> JobFuture + Send + Sync + 'static,
    {
        let job = Arc::new(job) as Arc<JobFn>;
        let task_id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let join_handle = self.spawn_for_spec(task_id, &cancellation, spec, job);
        ScheduledTaskHandle {
            cancellation,
            join: Arc::new(Mutex::new(Some(join_handle))),
        }
    }

    fn spawn_for_spec(
        &self,
        task_id: TaskId,
        cancellation: &CancellationToken,
        spec: ScheduleSpec,
        job: Arc<JobFn>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        let cancellation = cancellation.clone();

        match spec {
            ScheduleSpec::Immediate { label } => {
                let ctx = ScheduleContext::new(task_id, label, cancellation, Some(Utc::now()), 0);
                tokio::spawn(async move {
                    scheduler.run_job(job, ctx).await;
                })
            }
            ScheduleSpec::After { label, delay } => {
                self.spawn_after(task_id, cancellation, label, delay, job)
            }
            ScheduleSpec::Interval { label, period } => {
                self.spawn_interval(task_id, cancellation, label, period, job)
            }
        }
    }

    async fn run_job(&self, job: Arc<JobFn>, ctx: ScheduleContext) -> JobResult {
        if ctx.cancellation.is_cancelled() {
            return JobResult::Stop;
        }

        AssertUnwindSafe((job.clone())(ctx.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                let task_id = ctx.task_id.0.to_string();
                log_error(
                    "scheduler",
                    "Task panicked; stopping task",
                    &[("task_id", task_id.as_str()), ("label", ctx.label)],
                );
                JobResult::Stop
            })
    }

    fn spawn_after(
        &self,
        task_id: TaskId,
        cancellation: CancellationToken,
        label: &'static str,
        delay: Duration,
        job: Arc<JobFn>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        let scheduled_for = compute_scheduled_time(delay);
        tokio::spawn(async move {
            let sleeper = time::sleep(delay);
            tokio::pin!(sleeper);
            tokio::select! {
                _ = cancellation.cancelled() => return,
                _ = sleeper.as_mut() => {}
            }

            let ctx = ScheduleContext::new(task_id, label, cancellation.clone(), scheduled_for, 0);
            let _ = scheduler.run_job(job, ctx).await;
        })
    }

    fn spawn_interval(
        &self,
        task_id: TaskId,
        cancellation: CancellationToken,
        label: &'static str,
        period: Duration,
        job: Arc<JobFn>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut iteration = 0u64;
            loop {
                let scheduled_for = compute_scheduled_time(period);
                let sleeper = time::sleep(period);
                tokio::pin!(sleeper);
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = sleeper.as_mut() => {}
                }

                let ctx = ScheduleContext::new(
                    task_id,
                    label,
                    cancellation.clone(),
                    scheduled_for,
                    iteration,
                );
                if scheduler.run_job(job.clone(), ctx).await == JobResult::Stop {
                    break;
                }
                iteration += 1;
            }
        })
    }
}

fn compute_scheduled_time(delay: Duration) -> Option<DateTime<Utc>> {
    if delay.is_zero() {
        Some(Utc::now())
    } else {
        ChronoDuration::from_std(delay)
            .ok()
            .map(|delta| Utc::now() + delta)
    }
}

impl ScheduledTaskHandle {
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn abort(&self) {
        if let Some(handle) = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// Waits for the task to finish. Subsequent calls return immediately.
    pub async fn join(&self) -> Result<(), tokio::task::JoinError> {
        let maybe_handle = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = maybe_handle {
            handle.await.map(|_| ())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time;

    #[tokio::test]
    async fn immediate_task_executes() {
        let scheduler = Scheduler::global();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let handle = scheduler.schedule(ScheduleSpec::Immediate { label: "immediate" }, move |ctx| {
            let counter = counter_clone.clone();
            Box::pin(async move {
                assert_eq!(ctx.label(), "immediate");
                assert_eq!(ctx.iteration(), 0);
                counter.fetch_add(1, Ordering::SeqCst);
                JobResult::Stop
            })
        });

        handle.join().await.expect("join should succeed");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delayed_task_executes() {
        let scheduler = Scheduler::global();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let handle = scheduler.schedule(
            ScheduleSpec::After {
                label: "delayed",
                delay: Duration::from_millis(20),
            },
            move |ctx| {
                let counter = counter_clone.clone();
                Box::pin(async move {
                    assert!(ctx.scheduled_for().is_some());
                    counter.fetch_add(1, Ordering::SeqCst);
                    JobResult::Stop
                })
            },
        );

        handle.join().await.expect("join should succeed");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interval_task_repeats_until_stopped() {
        let scheduler = Scheduler::global();
        let executions = Arc::new(AtomicUsize::new(0));
        let executions_clone = executions.clone();

        let handle = scheduler.schedule(
            ScheduleSpec::Interval {
                label: "interval",
                period: Duration::from_millis(10),
            },
            move |ctx| {
                let executions = executions_clone.clone();
                Box::pin(async move {
                    let count = executions.fetch_add(1, Ordering::SeqCst) + 1;
                    assert_eq!(ctx.iteration() as usize, count - 1);
                    if count >= 3 {
                        JobResult::Stop
                    } else {
                        JobResult::Continue
                    }
                })
            },
        );

        handle.join().await.expect("join should succeed");
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelling_parent_stops_child_tasks() {
        let scheduler = Scheduler::global();
        let parent = CancellationToken::new();
        let executions = Arc::new(AtomicUsize::new(0));
        let executions_clone = executions.clone();

        let handle = scheduler.schedule_child(
            &parent,
            ScheduleSpec::After {
                label: "cancelled",
                delay: Duration::from_secs(30),
            },
            move |_| {
                let executions = executions_clone.clone();
                Box::pin(async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    JobResult::Stop
                })
            },
        );

        parent.cancel();
        assert!(handle.is_cancelled());
        time::timeout(Duration::from_secs(1), handle.join())
            .await
            .expect("task exits after cancellation")
            .expect("join should succeed");
        assert_eq!(executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_job_is_isolated() {
        let scheduler = Scheduler::global();
        let handle = scheduler.schedule(ScheduleSpec::Immediate { label: "panics" }, |_| {
            Box::pin(async move {
                let fail = true;
                if fail {
                    panic!("job failure");
                }
                JobResult::Stop
            })
        });

        handle.join().await.expect("panic is caught inside the task");
    }
}
