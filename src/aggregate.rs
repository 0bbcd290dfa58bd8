//! Result Aggregate, Simulation Instances and the Persisted Container.

use std::collections::HashSet;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};
use tracing::warn;

use crate::collect::Observables;
use crate::config::{ReactionConfig, SimulationMode};
use crate::driver::ProgramRun;
use crate::params::ParameterDescriptor;
use crate::perturb::PerturbedValue;
use crate::unit::UnitStage;
use crate::workdir::WorkingDirPaths;
use crate::{FailureKind, TmcError};

pub const CONTAINER_SCHEMA_VERSION: u32 = 1;

/// Which collection an instance counts toward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstanceGroup {
    /// Unperturbed reference run.
    Baseline,
    SingleParameter { parameter: String },
    Joint,
}

impl InstanceGroup {
    pub fn name(&self) -> &str {
        match self {
            Self::Baseline => "baseline",
            Self::SingleParameter { parameter } => parameter,
            Self::Joint => "joint",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub stage: UnitStage,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum InstanceOutcome {
    Collected(Observables),
    Failed(FailureRecord),
}

/// One complete pipeline run for one draw, successful or permanently failed.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationInstance {
    pub id: usize,
    pub label: String,
    pub group: InstanceGroup,
    pub draw: usize,
    pub parameters: Vec<PerturbedValue>,
    pub outcome: InstanceOutcome,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub attempts: usize,
    /// Exit status of every program the successful attempt ran.
    #[serde(default)]
    pub runs: Vec<ProgramRun>,
    #[serde(default)]
    pub working_dirs: Option<WorkingDirPaths>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub elapsed_secs: f64,
}

impl SimulationInstance {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, InstanceOutcome::Collected(_))
    }

    pub fn observables(&self) -> Option<&Observables> {
        match &self.outcome {
            InstanceOutcome::Collected(observables) => Some(observables),
            InstanceOutcome::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Complete,
    #[default]
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Interruption {
    ExhaustedRetries { attempts: usize },
    Cancelled,
}

/// Versioned on-disk form of a [`ResultAggregate`].
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedContainer {
    pub schema_version: u32,
    #[serde(default)]
    pub created_at: String,
    pub reaction: ReactionConfig,
    pub mode: SimulationMode,
    /// Successful instances requested per group.
    pub requested_samples: usize,
    #[serde(default)]
    pub parameters: Vec<ParameterDescriptor>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub status: CampaignStatus,
    #[serde(default)]
    pub interruption: Option<Interruption>,
    #[serde(default)]
    pub baseline: Option<SimulationInstance>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub single_parameters: Vec<SimulationInstance>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub tmc: Vec<SimulationInstance>,
}

impl PersistedContainer {
    pub fn instance_count(&self) -> usize {
        self.single_parameters.len() + self.tmc.len()
    }

    /// Concatenates batches of the same reaction and mode, renumbering
    /// instance ids in input order.
    pub fn merge(containers: Vec<PersistedContainer>) -> Result<PersistedContainer, TmcError> {
        let mut iter = containers.into_iter();
        let Some(first) = iter.next() else {
            return Err(TmcError::InvalidContainer("nothing to merge".to_string()));
        };
        let first = ResultAggregate::load(first)?.finalize();

        let mut merged = PersistedContainer {
            single_parameters: Vec::new(),
            tmc: Vec::new(),
            baseline: None,
            ..first.clone()
        };
        let mut next_id = 0;
        let mut absorb = |merged: &mut PersistedContainer, batch: PersistedContainer| {
            if merged.baseline.is_none() {
                merged.baseline = batch.baseline.map(|mut b| {
                    b.id = next_id;
                    next_id += 1;
                    b
                });
            } else if batch.baseline.is_some() {
                warn!("dropping extra baseline instance while merging");
            }
            for mut instance in batch.single_parameters {
                instance.id = next_id;
                next_id += 1;
                merged.single_parameters.push(instance);
            }
            for mut instance in batch.tmc {
                instance.id = next_id;
                next_id += 1;
                merged.tmc.push(instance);
            }
        };
        absorb(&mut merged, first);

        for batch in iter {
            let batch = ResultAggregate::load(batch)?.finalize();
            if batch.reaction != merged.reaction || batch.mode != merged.mode {
                return Err(TmcError::InvalidContainer(
                    "containers describe different reactions or modes".to_string(),
                ));
            }
            merged.requested_samples += batch.requested_samples;
            for descriptor in &batch.parameters {
                if !merged.parameters.iter().any(|p| p.name == descriptor.name) {
                    merged.parameters.push(descriptor.clone());
                }
            }
            if batch.status == CampaignStatus::Incomplete {
                merged.status = CampaignStatus::Incomplete;
                if merged.interruption.is_none() {
                    merged.interruption = batch.interruption.clone();
                }
            }
            absorb(&mut merged, batch);
        }

        merged.created_at = Utc::now().to_rfc3339();
        Ok(merged)
    }
}

#[derive(Debug, Default)]
struct AggregateState {
    next_id: usize,
    baseline: Option<SimulationInstance>,
    single_parameters: Vec<SimulationInstance>,
    tmc: Vec<SimulationInstance>,
    status: CampaignStatus,
    interruption: Option<Interruption>,
}

/// Append-only collection of every instance of a campaign.
#[derive(Debug)]
pub struct ResultAggregate {
    reaction: ReactionConfig,
    mode: SimulationMode,
    requested_samples: usize,
    parameters: Vec<ParameterDescriptor>,
    state: Mutex<AggregateState>,
}

impl ResultAggregate {
    pub fn new(
        reaction: ReactionConfig,
        mode: SimulationMode,
        requested_samples: usize,
        parameters: Vec<ParameterDescriptor>,
    ) -> Self {
        Self {
            reaction,
            mode,
            requested_samples,
            parameters,
            state: Mutex::new(AggregateState::default()),
        }
    }

    pub fn reaction(&self) -> &ReactionConfig {
        &self.reaction
    }

    pub fn mode(&self) -> SimulationMode {
        self.mode
    }

    pub fn requested_samples(&self) -> usize {
        self.requested_samples
    }

    /// Stores `instance` under a fresh id and returns that id. Baseline
    /// instances replace nothing: a second baseline is rejected.
    pub fn append(&self, mut instance: SimulationInstance) -> Result<usize, TmcError> {
        let mut state = self.state.lock();
        let id = state.next_id;
        instance.id = id;
        match instance.group {
            InstanceGroup::Baseline => {
                if state.baseline.is_some() {
                    return Err(TmcError::InvalidContainer(
                        "baseline instance already recorded".to_string(),
                    ));
                }
                state.baseline = Some(instance);
            }
            InstanceGroup::SingleParameter { .. } => state.single_parameters.push(instance),
            InstanceGroup::Joint => state.tmc.push(instance),
        }
        state.next_id += 1;
        Ok(id)
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.single_parameters.len() + state.tmc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every non-baseline instance, in id order.
    pub fn instances(&self) -> Vec<SimulationInstance> {
        let state = self.state.lock();
        let mut all: Vec<SimulationInstance> = state
            .single_parameters
            .iter()
            .chain(state.tmc.iter())
            .cloned()
            .collect();
        all.sort_by_key(|instance| instance.id);
        all
    }

    pub fn baseline(&self) -> Option<SimulationInstance> {
        self.state.lock().baseline.clone()
    }

    pub fn successful_count(&self, group: &InstanceGroup) -> usize {
        let state = self.state.lock();
        state
            .single_parameters
            .iter()
            .chain(state.tmc.iter())
            .filter(|instance| &instance.group == group && instance.is_success())
            .count()
    }

    pub fn status(&self) -> CampaignStatus {
        self.state.lock().status
    }

    pub fn interruption(&self) -> Option<Interruption> {
        self.state.lock().interruption.clone()
    }

    pub fn mark_complete(&self) {
        let mut state = self.state.lock();
        state.status = CampaignStatus::Complete;
        state.interruption = None;
    }

    pub fn mark_incomplete(&self, interruption: Interruption) {
        let mut state = self.state.lock();
        state.status = CampaignStatus::Incomplete;
        state.interruption = Some(interruption);
    }

    pub fn finalize(&self) -> PersistedContainer {
        let state = self.state.lock();
        PersistedContainer {
            schema_version: CONTAINER_SCHEMA_VERSION,
            created_at: Utc::now().to_rfc3339(),
            reaction: self.reaction.clone(),
            mode: self.mode,
            requested_samples: self.requested_samples,
            parameters: self.parameters.clone(),
            status: state.status,
            interruption: state.interruption.clone(),
            baseline: state.baseline.clone(),
            single_parameters: state.single_parameters.clone(),
            tmc: state.tmc.clone(),
        }
    }

    pub fn load(container: PersistedContainer) -> Result<Self, TmcError> {
        if container.schema_version > CONTAINER_SCHEMA_VERSION {
            return Err(TmcError::InvalidContainer(format!(
                "schema version {} is newer than the supported version {}",
                container.schema_version, CONTAINER_SCHEMA_VERSION
            )));
        }

        let mut seen = HashSet::new();
        let all = container
            .baseline
            .iter()
            .chain(container.single_parameters.iter())
            .chain(container.tmc.iter());
        for instance in all {
            if !seen.insert(instance.id) {
                return Err(TmcError::InvalidContainer(format!(
                    "instance id {} appears more than once",
                    instance.id
                )));
            }
        }
        if container.status == CampaignStatus::Complete && container.interruption.is_some() {
            return Err(TmcError::InvalidContainer(
                "complete container carries an interruption".to_string(),
            ));
        }

        let next_id = seen.iter().max().map_or(0, |max| max + 1);
        Ok(Self {
            reaction: container.reaction,
            mode: container.mode,
            requested_samples: container.requested_samples,
            parameters: container.parameters,
            state: Mutex::new(AggregateState {
                next_id,
                baseline: container.baseline,
                single_parameters: container.single_parameters,
                tmc: container.tmc,
                status: container.status,
                interruption: container.interruption,
            }),
        })
    }
}
