use std::fmt;

/// Host lifecycle phases, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecyclePhase {
    Starting,
    Start,
    Started,
    Stopping,
    Stop,
    Stopped,
}

impl LifecyclePhase {
    pub const ALL: [LifecyclePhase; 6] = [
        LifecyclePhase::Starting,
        LifecyclePhase::Start,
        LifecyclePhase::Started,
        LifecyclePhase::Stopping,
        LifecyclePhase::Stop,
        LifecyclePhase::Stopped,
    ];

    pub const STARTUP: [LifecyclePhase; 3] = [
        LifecyclePhase::Starting,
        LifecyclePhase::Start,
        LifecyclePhase::Started,
    ];

    pub const SHUTDOWN: [LifecyclePhase; 3] = [
        LifecyclePhase::Stopping,
        LifecyclePhase::Stop,
        LifecyclePhase::Stopped,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecyclePhase::Starting => write!(f, "starting"),
            LifecyclePhase::Start => write!(f, "start"),
            LifecyclePhase::Started => write!(f, "started"),
            LifecyclePhase::Stopping => write!(f, "stopping"),
            LifecyclePhase::Stop => write!(f, "stop"),
            LifecyclePhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// A set of lifecycle phases.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PhaseSet(u8);

impl PhaseSet {
    pub const EMPTY: PhaseSet = PhaseSet(0);

    pub fn with(self, phase: LifecyclePhase) -> Self {
        PhaseSet(self.0 | phase.bit())
    }

    pub fn contains(&self, phase: LifecyclePhase) -> bool {
        self.0 & phase.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = LifecyclePhase> + '_ {
        LifecyclePhase::ALL
            .into_iter()
            .filter(move |phase| self.contains(*phase))
    }
}

impl From<LifecyclePhase> for PhaseSet {
    fn from(phase: LifecyclePhase) -> Self {
        PhaseSet::EMPTY.with(phase)
    }
}

impl<const N: usize> From<[LifecyclePhase; N]> for PhaseSet {
    fn from(phases: [LifecyclePhase; N]) -> Self {
        phases.into_iter().collect()
    }
}

impl FromIterator<LifecyclePhase> for PhaseSet {
    fn from_iter<I: IntoIterator<Item = LifecyclePhase>>(iter: I) -> Self {
        iter.into_iter().fold(PhaseSet::EMPTY, PhaseSet::with)
    }
}

impl fmt::Debug for PhaseSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
