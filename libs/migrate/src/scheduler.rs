//! Reactor that multiplexes every in-flight partition move.
//!
//! All tasks of a batch run on one control loop. A task is either sleeping
//! until a deadline (kept in a min-heap keyed by wake time) or waiting on one
//! outstanding request (a future in a [`FuturesUnordered`] set, tagged with a
//! registration). Each iteration blocks for at most the time until the
//! earliest deadline, resumes the owners of completed requests and expired
//! deadlines, and applies the directives they return.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::cancel::{CancelReason, Cancellation};
use crate::clock;
use crate::phase::{Directive, PhaseEngine, Reply, Wake};
use crate::task::{MigrationTask, MoveResult, Registration, TaskSummary, WaitMode};

type SleepQueue = BinaryHeap<Reverse<(Instant, usize)>>;

/// Outcome of one batch.
#[derive(Debug)]
pub struct BatchReport {
    /// Every task of the batch, all terminal.
    pub tasks: Vec<MigrationTask>,

    /// Set if the batch was stopped early.
    pub cancelled: Option<CancelReason>,
}

impl BatchReport {
    /// Returns true if every task succeeded and the batch was not cancelled.
    pub fn all_succeeded(&self) -> bool {
        self.cancelled.is_none()
            && self
                .tasks
                .iter()
                .all(|task| task.result() == MoveResult::Success)
    }

    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.tasks.iter().map(MigrationTask::summary).collect()
    }
}

/// Runs batches of migration tasks to completion.
#[derive(Clone)]
pub struct Scheduler {
    engine: PhaseEngine,
}

impl Scheduler {
    pub fn new(engine: PhaseEngine) -> Self {
        Self { engine }
    }

    /// Run `tasks` until all are terminal or `cancel` fires.
    ///
    /// On cancellation every unfinished task is torn down and reported failed.
    pub async fn run(&self, tasks: Vec<MigrationTask>, cancel: &mut Cancellation) -> BatchReport {
        self.run_observed(tasks, cancel, |_| {}).await
    }

    /// Like [`Scheduler::run`], calling `observe` with every task before each
    /// reactor iteration.
    #[instrument(skip_all, fields(tasks = tasks.len()))]
    pub async fn run_observed<F>(
        &self,
        tasks: Vec<MigrationTask>,
        cancel: &mut Cancellation,
        mut observe: F,
    ) -> BatchReport
    where
        F: FnMut(&[MigrationTask]),
    {
        let mut reactor = Reactor::new(&self.engine, tasks);
        info!(live = reactor.live, "Starting migration batch");

        let cancelled = loop {
            observe(&reactor.tasks);

            if reactor.live == 0 {
                break None;
            }
            if let Some(reason) = cancel.reason() {
                break Some(reason);
            }

            let tasks = &reactor.tasks;
            let timeout = next_timeout(&mut reactor.sleeping, clock::now(), |index, at| {
                tasks[index].wait().wake_at() == Some(at)
            });

            let event = if timeout == Some(Duration::ZERO) {
                // Something is due already; only pick up completions that are ready.
                match reactor.in_flight.next().now_or_never() {
                    Some(Some(completion)) => Event::Ready(completion),
                    _ => Event::Timeout,
                }
            } else {
                tokio::select! {
                    biased;

                    reason = cancel.triggered() => Event::Cancelled(reason),

                    Some(completion) = reactor.in_flight.next(), if !reactor.in_flight.is_empty() => {
                        Event::Ready(completion)
                    }

                    _ = sleep_for(timeout) => Event::Timeout,
                }
            };

            let mut ready = Vec::new();
            match event {
                Event::Cancelled(reason) => break Some(reason),
                Event::Ready(completion) => ready.push(completion),
                Event::Timeout => {}
            }
            while let Some(Some(completion)) = reactor.in_flight.next().now_or_never() {
                ready.push(completion);
            }

            for completion in ready {
                reactor.complete(completion);
            }
            for index in reactor.take_due(clock::now()) {
                reactor.resume(index, Wake::Timer);
            }
        };

        if let Some(reason) = cancelled {
            reactor.abort_all(reason);
        }

        let report = BatchReport {
            tasks: reactor.tasks,
            cancelled,
        };
        let succeeded = report
            .tasks
            .iter()
            .filter(|task| task.result() == MoveResult::Success)
            .count();
        info!(
            succeeded,
            failed = report.tasks.len() - succeeded,
            cancelled = ?report.cancelled,
            "Migration batch finished"
        );
        report
    }
}

enum Event {
    Ready(Completion),
    Timeout,
    Cancelled(CancelReason),
}

struct Completion {
    index: usize,
    registration: Registration,
    reply: Reply,
}

struct Reactor<'a> {
    engine: &'a PhaseEngine,
    tasks: Vec<MigrationTask>,
    sleeping: SleepQueue,
    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,
    /// Owner of each outstanding registration.
    registrations: HashMap<Registration, usize>,
    next_registration: u64,
    /// Non-terminal tasks.
    live: usize,
}

impl<'a> Reactor<'a> {
    fn new(engine: &'a PhaseEngine, mut tasks: Vec<MigrationTask>) -> Self {
        let mut sleeping = SleepQueue::new();
        let mut live = 0;

        for (index, task) in tasks.iter_mut().enumerate() {
            if task.is_terminal() {
                continue;
            }
            live += 1;
            let wake_at = task.wait().wake_at().unwrap_or_else(clock::now);
            task.set_wait(WaitMode::Sleeping { wake_at });
            sleeping.push(Reverse((wake_at, index)));
        }

        Self {
            engine,
            tasks,
            sleeping,
            in_flight: FuturesUnordered::new(),
            registrations: HashMap::new(),
            next_registration: 0,
            live,
        }
    }

    fn complete(&mut self, completion: Completion) {
        let Completion {
            index,
            registration,
            reply,
        } = completion;

        let owner = self.registrations.remove(&registration);
        let current = self.tasks[index].wait().registration() == Some(registration);
        if owner != Some(index) || !current {
            debug!(index, registration = registration.0, "Dropping stale completion");
            return;
        }
        self.resume(index, Wake::Ready(reply));
    }

    /// Pop every sleeper whose deadline has passed. Stale heap entries are discarded.
    fn take_due(&mut self, now: Instant) -> Vec<usize> {
        let mut due = Vec::new();
        while let Some(Reverse((wake_at, index))) = self.sleeping.peek().copied() {
            if !clock::is_due(wake_at, now) {
                break;
            }
            self.sleeping.pop();
            if self.tasks[index].wait().wake_at() == Some(wake_at) {
                due.push(index);
            }
        }
        due
    }

    fn resume(&mut self, index: usize, wake: Wake) {
        let directive = self.engine.resume(&mut self.tasks[index], wake);
        self.apply(index, directive);
    }

    fn apply(&mut self, index: usize, directive: Directive) {
        let previous = self.tasks[index].wait().registration();
        if let Some(previous) = previous {
            self.registrations.remove(&previous);
        }

        match directive {
            Directive::AwaitSocket(inflight) => {
                let registration = Registration(self.next_registration);
                self.next_registration += 1;
                self.registrations.insert(registration, index);
                self.tasks[index].set_wait(WaitMode::Socket { registration });

                trace!(
                    partition = %self.tasks[index].partition(),
                    request = inflight.label,
                    registration = registration.0,
                    "Waiting on request"
                );

                let future = inflight.future;
                self.in_flight.push(
                    async move {
                        Completion {
                            index,
                            registration,
                            reply: future.await,
                        }
                    }
                    .boxed(),
                );
            }
            Directive::AwaitTime(wake_at) => {
                self.tasks[index].set_wait(WaitMode::Sleeping { wake_at });
                self.sleeping.push(Reverse((wake_at, index)));
            }
            Directive::Finished(result) => {
                self.live -= 1;
                debug!(
                    partition = %self.tasks[index].partition(),
                    result = ?result,
                    live = self.live,
                    "Task finished"
                );
            }
        }
    }

    /// Tear down every unfinished task. Dropping in-flight requests releases
    /// the sessions they hold.
    fn abort_all(&mut self, reason: CancelReason) {
        warn!(reason = %reason, live = self.live, "Cancelling migration batch");
        self.in_flight.clear();
        self.registrations.clear();
        self.sleeping.clear();
        for task in &mut self.tasks {
            PhaseEngine::abort(task, reason);
        }
        self.live = 0;
    }
}

/// Time to block before the earliest valid deadline.
///
/// Zero if a deadline has passed, `None` if nothing sleeps. Entries that
/// `is_current` rejects are stale and removed.
fn next_timeout(
    sleeping: &mut SleepQueue,
    now: Instant,
    is_current: impl Fn(usize, Instant) -> bool,
) -> Option<Duration> {
    while let Some(Reverse((wake_at, index))) = sleeping.peek().copied() {
        if is_current(index, wake_at) {
            return Some(clock::wait_until(wake_at, now));
        }
        sleeping.pop();
    }
    None
}

async fn sleep_for(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}
