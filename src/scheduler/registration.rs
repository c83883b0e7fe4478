use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::BoxError;
use crate::scheduler::{Job, LifecyclePhase, PhaseSet};

pub type JobFactory = Arc<dyn Fn() -> Box<dyn Job> + Send + Sync>;
pub type EnabledPredicate = Arc<dyn Fn() -> BoxFuture<'static, Result<bool, BoxError>> + Send + Sync>;
pub type ReadyGate = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
pub type ConditionPredicate =
    Arc<dyn Fn(&str) -> BoxFuture<'static, Result<bool, BoxError>> + Send + Sync>;

/// Describes when and how a job runs.
///
/// A registration needs at least one lifecycle phase or a non-zero
/// interval; it may have both.
#[derive(Clone)]
pub struct JobRegistration {
    pub(crate) name: String,
    pub(crate) lease_name: Option<String>,
    pub(crate) interval: Option<Duration>,
    pub(crate) phases: PhaseSet,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) enabled: Option<EnabledPredicate>,
    pub(crate) ready: Option<ReadyGate>,
    pub(crate) factory: JobFactory,
}

impl JobRegistration {
    pub fn new<F, J>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> J + Send + Sync + 'static,
        J: Job + 'static,
    {
        Self {
            name: name.into(),
            lease_name: None,
            interval: None,
            phases: PhaseSet::EMPTY,
            tags: BTreeSet::new(),
            enabled: None,
            ready: None,
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Job>),
        }
    }

    /// A job bound to one or more lifecycle phases.
    pub fn lifecycle<F, J>(name: impl Into<String>, phases: impl Into<PhaseSet>, factory: F) -> Self
    where
        F: Fn() -> J + Send + Sync + 'static,
        J: Job + 'static,
    {
        Self::new(name, factory).on_phases(phases)
    }

    /// A job that runs every `interval` between `Start` and `Stop`.
    pub fn scheduled<F, J>(name: impl Into<String>, interval: Duration, factory: F) -> Self
    where
        F: Fn() -> J + Send + Sync + 'static,
        J: Job + 'static,
    {
        Self::new(name, factory).every(interval)
    }

    pub fn on_phases(mut self, phases: impl Into<PhaseSet>) -> Self {
        let phases = phases.into();
        self.phases = phases.iter().fold(self.phases, PhaseSet::with);
        self
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Only one instance across the fleet runs the job at a time.
    pub fn with_lease(mut self, lease_name: impl Into<String>) -> Self {
        self.lease_name = Some(lease_name.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Re-evaluated before every run; `Ok(false)` skips the run.
    pub fn enabled_when<F, Fut>(mut self, predicate: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, BoxError>> + Send + 'static,
    {
        self.enabled = Some(Arc::new(move || predicate().boxed()));
        self
    }

    /// Lifecycle runs wait for `gate` after the lease is taken and before the body runs.
    /// Interval timers wait for it once, before scheduling their first run.
    pub fn wait_for_ready<F, Fut>(mut self, gate: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ready = Some(Arc::new(move || gate().boxed()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lease_name(&self) -> Option<&str> {
        self.lease_name.as_deref()
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn phases(&self) -> PhaseSet {
        self.phases
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub(crate) fn runs_in(&self, phase: LifecyclePhase) -> bool {
        self.phases.contains(phase)
    }
}

impl fmt::Debug for JobRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistration")
            .field("name", &self.name)
            .field("lease_name", &self.lease_name)
            .field("interval", &self.interval)
            .field("phases", &self.phases)
            .field("tags", &self.tags)
            .field("enabled", &self.enabled.is_some())
            .field("ready", &self.ready.is_some())
            .finish()
    }
}

/// A scheduler-wide run condition, optionally limited to jobs with a tag.
///
/// The predicate receives the job name and is evaluated before every run
/// of every matching job.
#[derive(Clone)]
pub struct JobCondition {
    pub(crate) tag: Option<String>,
    pub(crate) predicate: ConditionPredicate,
}

impl JobCondition {
    pub fn new<F, Fut>(predicate: F) -> Self
    where
        F: Fn(&str) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, BoxError>> + Send + 'static,
    {
        Self {
            tag: None,
            predicate: Arc::new(move |name| predicate(name).boxed()),
        }
    }

    pub fn tagged<F, Fut>(tag: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&str) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, BoxError>> + Send + 'static,
    {
        Self {
            tag: Some(tag.into()),
            ..Self::new(predicate)
        }
    }

    pub(crate) fn applies_to(&self, registration: &JobRegistration) -> bool {
        match &self.tag {
            Some(tag) => registration.has_tag(tag),
            None => true,
        }
    }
}

impl fmt::Debug for JobCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobCondition").field("tag", &self.tag).finish()
    }
}
