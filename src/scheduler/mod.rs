//! Lifecycle- and interval-driven job runner.
//!
//! Jobs bind to host lifecycle phases, to a repeating interval, or both.
//! Phases run strictly in order, each at most once. Interval timers start
//! after the `Start` phase and stop when `Stop` begins. A job naming a
//! lease only runs on the instance that acquires it; for interval jobs the
//! lease's release history doubles as a fleet-wide "last ran at" clock.

pub mod job;
pub mod phase;
pub mod registration;
pub mod timer;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{BoxError, Error, Result};
use crate::lease::{LeaseAcquisition, LeaseCondition, LeaseManager};

pub use job::{Job, JobContext, JobTrigger};
pub use phase::{LifecyclePhase, PhaseSet};
pub use registration::{JobCondition, JobRegistration};
pub use timer::{next_run_delay, random_jitter, ScheduleAnchor};

#[derive(Default)]
struct State {
    last_phase: Option<LifecyclePhase>,
    registrations: Vec<Arc<JobRegistration>>,
    conditions: Vec<JobCondition>,
}

struct Inner {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    leases: Option<Arc<LeaseManager>>,
    state: Mutex<State>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    /// Cancelled when the host shuts down.
    shutdown: CancellationToken,
    /// Cancelled at `Stop`, on disposal, or when the host shuts down.
    timer_cancel: CancellationToken,
}

/// Runs registered jobs across the host lifecycle.
pub struct JobScheduler {
    inner: Arc<Inner>,
    disposed: AtomicBool,
}

impl JobScheduler {
    /// `leases` may be `None` for hosts without a lease store; registering a
    /// leased job is then a configuration error.
    pub fn new(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        leases: Option<Arc<LeaseManager>>,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                leases,
                state: Mutex::new(State::default()),
                timers: Mutex::new(Vec::new()),
                shutdown: shutdown.child_token(),
                timer_cancel: shutdown.child_token(),
            }),
            disposed: AtomicBool::new(false),
        }
    }

    pub async fn register(&self, registration: JobRegistration) -> Result<()> {
        let name = registration.name.clone();
        if name.trim().is_empty() {
            return Err(Error::Configuration("job name must not be empty".into()));
        }
        if registration.phases.is_empty() && registration.interval.is_none() {
            return Err(Error::Configuration(format!(
                "job '{}' has neither a lifecycle phase nor an interval",
                name
            )));
        }
        if registration.lease_name.is_some() {
            if registration.runs_in(LifecyclePhase::Starting) {
                return Err(starting_with_lease(&name));
            }
            if self.inner.leases.is_none() {
                return Err(Error::Configuration(format!(
                    "job '{}' needs a lease but no lease manager is configured",
                    name
                )));
            }
        }

        let mut state = self.inner.state.lock().await;
        if state.last_phase.is_some_and(|last| last >= LifecyclePhase::Start) {
            return Err(Error::Configuration(format!(
                "job '{}' registered after the scheduler started",
                name
            )));
        }
        if state.registrations.iter().any(|r| r.name == name) {
            return Err(Error::Configuration(format!(
                "job '{}' is already registered",
                name
            )));
        }

        tracing::debug!(
            job = %name,
            phases = ?registration.phases,
            interval = ?registration.interval,
            lease = ?registration.lease_name,
            "Job registered"
        );
        state.registrations.push(Arc::new(registration));
        Ok(())
    }

    pub async fn add_condition(&self, condition: JobCondition) {
        self.inner.state.lock().await.conditions.push(condition);
    }

    /// Names of registered jobs, in registration order.
    pub async fn job_names(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state.registrations.iter().map(|r| r.name.clone()).collect()
    }

    pub async fn last_phase(&self) -> Option<LifecyclePhase> {
        self.inner.state.lock().await.last_phase
    }

    /// Runs every job bound to `phase`, one after another.
    ///
    /// The first job error aborts the phase. `Start` additionally launches
    /// interval timers once its jobs are done; `Stop` halts them before its
    /// jobs run.
    pub async fn run_phase(&self, phase: LifecyclePhase) -> Result<()> {
        let registrations = {
            let mut state = self.inner.state.lock().await;
            if let Some(last) = state.last_phase {
                if phase <= last {
                    return Err(Error::PhaseOutOfOrder {
                        requested: phase,
                        last,
                    });
                }
            }
            state.last_phase = Some(phase);
            state
                .registrations
                .iter()
                .filter(|r| r.runs_in(phase))
                .cloned()
                .collect::<Vec<_>>()
        };

        tracing::info!(phase = %phase, jobs = registrations.len(), "Running lifecycle phase");

        if phase >= LifecyclePhase::Stop {
            self.stop_timers().await;
        }

        for registration in &registrations {
            self.inner.run_lifecycle_job(registration, phase).await?;
        }

        if phase == LifecyclePhase::Start {
            self.start_timers().await;
        }
        Ok(())
    }

    /// Runs `Starting`, `Start` and `Started`.
    pub async fn start(&self) -> Result<()> {
        for phase in LifecyclePhase::STARTUP {
            self.run_phase(phase).await?;
        }
        Ok(())
    }

    /// Runs `Stopping`, `Stop` and `Stopped`.
    pub async fn stop(&self) -> Result<()> {
        for phase in LifecyclePhase::SHUTDOWN {
            self.run_phase(phase).await?;
        }
        Ok(())
    }

    /// Stops interval timers and waits for in-flight ticks.
    ///
    /// Returns true for the one call that performed the teardown; concurrent
    /// and repeated calls return false.
    pub async fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.stop_timers().await;
        tracing::debug!("Job scheduler disposed");
        true
    }

    async fn start_timers(&self) {
        let state = self.inner.state.lock().await;
        let mut timers = self.inner.timers.lock().await;
        for registration in &state.registrations {
            let Some(interval) = registration.interval else {
                continue;
            };
            tracing::debug!(job = %registration.name, ?interval, "Starting job timer");
            timers.push(tokio::spawn(timer_loop(
                self.inner.clone(),
                registration.clone(),
                interval,
            )));
        }
    }

    async fn stop_timers(&self) {
        self.inner.timer_cancel.cancel();
        let timers = std::mem::take(&mut *self.inner.timers.lock().await);
        for result in join_all(timers).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Job timer task failed");
            }
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.inner.timer_cancel.cancel();
    }
}

fn starting_with_lease(name: &str) -> Error {
    Error::Configuration(format!(
        "job '{}' cannot take a lease in the starting phase",
        name
    ))
}

impl Inner {
    /// Evaluates matching global conditions, then the job's own predicate.
    async fn is_enabled(&self, registration: &JobRegistration) -> Result<bool> {
        let conditions: Vec<JobCondition> = {
            let state = self.state.lock().await;
            state
                .conditions
                .iter()
                .filter(|c| c.applies_to(registration))
                .cloned()
                .collect()
        };

        let failed = |source: BoxError| Error::JobFailed {
            name: registration.name.clone(),
            source,
        };

        for condition in conditions {
            if !(condition.predicate)(&registration.name).await.map_err(failed)? {
                return Ok(false);
            }
        }
        match &registration.enabled {
            Some(predicate) => predicate().await.map_err(failed),
            None => Ok(true),
        }
    }

    async fn run_lifecycle_job(&self, registration: &JobRegistration, phase: LifecyclePhase) -> Result<()> {
        let name = &registration.name;
        if !self.is_enabled(registration).await? {
            tracing::debug!(job = %name, phase = %phase, "Job disabled, skipping");
            return Ok(());
        }

        // Shutdown does not cut short the jobs of the stop phases.
        let parent = (phase < LifecyclePhase::Stopping).then_some(&self.shutdown);

        let lease = match &registration.lease_name {
            Some(_) if phase == LifecyclePhase::Starting => return Err(starting_with_lease(name)),
            Some(lease_name) => match self.lease_manager(name)?.acquire_lease(lease_name, None, parent).await? {
                LeaseAcquisition::Acquired(lease) => Some(lease),
                other => {
                    tracing::debug!(job = %name, phase = %phase, lease = %lease_name, outcome = ?other, "Lease not acquired, skipping");
                    return Ok(());
                }
            },
            None => None,
        };

        if let Some(gate) = &registration.ready {
            tracing::debug!(job = %name, "Waiting for job to become ready");
            gate().await;
        }

        let cancel = match &lease {
            Some(lease) => lease.cancellation_token(),
            None => parent.map(CancellationToken::child_token).unwrap_or_default(),
        };
        let result = self
            .execute(registration, JobTrigger::Phase(phase), cancel)
            .await;

        if let Some(lease) = lease {
            lease.dispose().await;
        }
        result
    }

    /// One interval tick. Returns what the next tick should be anchored to.
    async fn tick(&self, registration: &JobRegistration, interval: Duration) -> Result<ScheduleAnchor> {
        let name = &registration.name;
        if !self.is_enabled(registration).await? {
            tracing::debug!(job = %name, "Job disabled, rescheduling");
            return Ok(ScheduleAnchor::Completed);
        }

        let Some(lease_name) = &registration.lease_name else {
            self.execute(registration, JobTrigger::Interval, self.timer_cancel.child_token())
                .await?;
            return Ok(ScheduleAnchor::Completed);
        };

        let acquisition = self
            .lease_manager(name)?
            .acquire_lease(
                lease_name,
                Some(LeaseCondition::NotReleasedWithin(interval)),
                Some(&self.timer_cancel),
            )
            .await?;

        match acquisition {
            LeaseAcquisition::Acquired(lease) => {
                let result = self
                    .execute(registration, JobTrigger::Interval, lease.cancellation_token())
                    .await;
                lease.dispose().await;
                result.map(|_| ScheduleAnchor::Completed)
            }
            LeaseAcquisition::ConditionUnmet { released_at, .. } => {
                tracing::debug!(job = %name, released_at = %released_at, "Job ran elsewhere recently");
                Ok(ScheduleAnchor::ReleasedAt(released_at))
            }
            LeaseAcquisition::Unavailable { expires, .. } => {
                tracing::debug!(job = %name, expires = %expires, "Job running elsewhere");
                Ok(ScheduleAnchor::HeldUntil(expires))
            }
        }
    }

    /// Builds a fresh job instance, runs it and disposes it.
    async fn execute(&self, registration: &JobRegistration, trigger: JobTrigger, cancel: CancellationToken) -> Result<()> {
        let ctx = JobContext {
            name: registration.name.clone(),
            trigger,
            lease_name: registration.lease_name.clone(),
            cancel,
        };

        tracing::debug!(job = %ctx.name, trigger = %trigger, "Running job");
        let mut job = (registration.factory)();
        let result = job.run(&ctx).await;
        if let Err(e) = job.dispose().await {
            tracing::warn!(job = %ctx.name, error = %e, "Failed to dispose job");
        }

        result.map_err(|source| Error::JobFailed {
            name: ctx.name.clone(),
            source,
        })
    }

    fn lease_manager(&self, job: &str) -> Result<&LeaseManager> {
        self.leases.as_deref().ok_or_else(|| {
            Error::Configuration(format!(
                "job '{}' needs a lease but no lease manager is configured",
                job
            ))
        })
    }
}

async fn timer_loop(inner: Arc<Inner>, registration: Arc<JobRegistration>, interval: Duration) {
    let leased = registration.lease_name.is_some();
    let jitter = || {
        if leased {
            random_jitter(inner.config.jitter)
        } else {
            Duration::ZERO
        }
    };
    let mut delay = if leased { jitter() } else { interval };

    if let Some(gate) = &registration.ready {
        tracing::debug!(job = %registration.name, "Waiting for job to become ready");
        tokio::select! {
            biased;
            _ = inner.timer_cancel.cancelled() => {
                tracing::debug!(job = %registration.name, "Job timer stopped before becoming ready");
                return;
            }
            _ = gate() => {}
        }
    }

    loop {
        tokio::select! {
            biased;
            _ = inner.timer_cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let tick = AssertUnwindSafe(inner.tick(&registration, interval)).catch_unwind();
        delay = match tick.await {
            Ok(Ok(anchor)) => next_run_delay(inner.clock.now(), anchor, interval, jitter()),
            Ok(Err(e)) => {
                tracing::error!(job = %registration.name, error = %e, "Scheduled job failed");
                interval
            }
            Err(_) => {
                tracing::error!(job = %registration.name, "Scheduled job panicked");
                interval
            }
        };
    }

    tracing::debug!(job = %registration.name, "Job timer stopped");
}
