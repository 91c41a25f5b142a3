use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Duration;
use tracing::info;

use feedwatch_core::{
    config::{JobConfig, PhaseCadence},
    PhaseKind, PriorityTier,
};

use crate::{
    error::{Result, SchedulerError},
    fetch::FetchCapability,
};

/// One year. Longer configured cadences are clamped.
const MAX_CADENCE_SECS: u64 = 366 * 24 * 3600;

/// Validated base cadence for every season phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    regular: Duration,
    pre_season: Duration,
    off_season: Duration,
}

impl Cadence {
    pub fn new(regular: Duration, pre_season: Duration, off_season: Duration) -> Result<Self> {
        for (phase, d) in [
            (PhaseKind::Regular, regular),
            (PhaseKind::PreSeason, pre_season),
            (PhaseKind::OffSeason, off_season),
        ] {
            if d <= Duration::zero() {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{phase} cadence must be positive"
                )));
            }
        }
        Ok(Self {
            regular,
            pre_season,
            off_season,
        })
    }

    /// Same cadence in every phase.
    pub fn uniform(every: Duration) -> Result<Self> {
        Self::new(every, every, every)
    }

    pub fn for_phase(&self, phase: PhaseKind) -> Duration {
        match phase {
            PhaseKind::Regular => self.regular,
            PhaseKind::PreSeason => self.pre_season,
            PhaseKind::OffSeason => self.off_season,
        }
    }
}

impl TryFrom<&PhaseCadence> for Cadence {
    type Error = SchedulerError;

    fn try_from(c: &PhaseCadence) -> Result<Self> {
        let secs = |s: u64| Duration::seconds(s.min(MAX_CADENCE_SECS) as i64);
        Cadence::new(
            secs(c.regular_secs),
            secs(c.pre_season_secs),
            secs(c.off_season_secs),
        )
    }
}

/// The hot-reloadable part of a job definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobProfile {
    pub tier: PriorityTier,
    pub cadence: Cadence,
}

/// Full replacement table: job id → profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CadenceTable(BTreeMap<String, JobProfile>);

impl CadenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, profile: JobProfile) {
        self.0.insert(id.into(), profile);
    }

    pub fn get(&self, id: &str) -> Option<&JobProfile> {
        self.0.get(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build from the job section of the config file.
    pub fn from_config(jobs: &[JobConfig]) -> Result<Self> {
        let mut table = Self::new();
        for job in jobs {
            if table.get(&job.id).is_some() {
                return Err(SchedulerError::DuplicateJob { id: job.id.clone() });
            }
            let cadence = Cadence::try_from(&job.cadence).map_err(|e| {
                SchedulerError::InvalidConfig(format!("job {}: {e}", job.id))
            })?;
            table.insert(
                job.id.clone(),
                JobProfile {
                    tier: job.tier,
                    cadence,
                },
            );
        }
        Ok(table)
    }
}

/// Identifies a data source. Never mutated: a reload swaps in a new value.
#[derive(Clone)]
pub struct JobDescriptor {
    pub id: String,
    pub tier: PriorityTier,
    pub cadence: Cadence,
    /// Maximum overlapping invocations of this job (usually 1).
    pub max_concurrent: u32,
    pub fetch: Arc<dyn FetchCapability>,
}

impl JobDescriptor {
    pub fn new(
        id: impl Into<String>,
        tier: PriorityTier,
        cadence: Cadence,
        fetch: Arc<dyn FetchCapability>,
    ) -> Self {
        Self {
            id: id.into(),
            tier,
            cadence,
            max_concurrent: 1,
            fetch,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    fn with_profile(&self, profile: &JobProfile) -> Self {
        Self {
            tier: profile.tier,
            cadence: profile.cadence,
            ..self.clone()
        }
    }
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("cadence", &self.cadence)
            .field("max_concurrent", &self.max_concurrent)
            .finish_non_exhaustive()
    }
}

/// Job descriptor table, ordered by id.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: BTreeMap<String, Arc<JobDescriptor>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor. Fails with `DuplicateJob` when the id is taken.
    pub fn register(&mut self, descriptor: JobDescriptor) -> Result<Arc<JobDescriptor>> {
        if self.jobs.contains_key(&descriptor.id) {
            return Err(SchedulerError::DuplicateJob { id: descriptor.id });
        }
        info!(job_id = %descriptor.id, tier = %descriptor.tier, "job registered");
        let descriptor = Arc::new(descriptor);
        self.jobs
            .insert(descriptor.id.clone(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Build from the config job table, asking `fetch_for` for each job's capability.
    pub fn from_config<F>(jobs: &[JobConfig], mut fetch_for: F) -> Result<Self>
    where
        F: FnMut(&JobConfig) -> Arc<dyn FetchCapability>,
    {
        let table = CadenceTable::from_config(jobs)?;
        let mut registry = Self::new();
        for job in jobs {
            let Some(profile) = table.get(&job.id) else {
                continue;
            };
            let descriptor = JobDescriptor::new(job.id.clone(), profile.tier, profile.cadence, fetch_for(job))
                .with_max_concurrent(job.max_concurrent);
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    pub fn lookup(&self, id: &str) -> Result<Arc<JobDescriptor>> {
        self.jobs
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob { id: id.to_string() })
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<JobDescriptor>> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Replace every job's tier and cadence in one step.
    ///
    /// The table must name exactly the registered jobs. Nothing changes on
    /// error. Runs already dispatched hold their own descriptor and are
    /// unaffected.
    pub fn replace_table(&mut self, table: &CadenceTable) -> Result<()> {
        if let Some(extra) = table.0.keys().find(|id| !self.jobs.contains_key(*id)) {
            return Err(SchedulerError::InvalidConfig(format!(
                "reload names unregistered job: {extra}"
            )));
        }
        if let Some(missing) = self.jobs.keys().find(|id| table.get(id).is_none()) {
            return Err(SchedulerError::InvalidConfig(format!(
                "reload is missing job: {missing}"
            )));
        }

        let next: BTreeMap<String, Arc<JobDescriptor>> = self
            .jobs
            .iter()
            .filter_map(|(id, desc)| {
                table
                    .get(id)
                    .map(|profile| (id.clone(), Arc::new(desc.with_profile(profile))))
            })
            .collect();
        self.jobs = next;
        info!(jobs = self.jobs.len(), "cadence table replaced");
        Ok(())
    }
}
