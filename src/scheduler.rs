//! Concurrency Scheduler.
//!
//! Work is organised in groups (one per parameter in single-parameter mode,
//! one joint group in TMC mode). Workers claim draw indices from a group
//! only while `succeeded + in_flight < requested`, so a group never runs more
//! units than it needs. Every attempt, retries included, is charged to a
//! campaign-wide budget.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, warn};

use crate::aggregate::{
    FailureRecord, InstanceGroup, InstanceOutcome, Interruption, PersistedContainer,
    ResultAggregate, SimulationInstance,
};
use crate::collect::Collector;
use crate::config::{CampaignFile, SamplingStrategy, SimulationMode};
use crate::driver::{CancelToken, ProgramRunner};
use crate::output::write_container;
use crate::params::{resolve_descriptors, ParameterDescriptor};
use crate::perturb::{unit_rng, PerturbedValue, Perturber};
use crate::unit::{UnitExecutor, UnitFailure, UnitPlan, UnitStage, UnitSuccess};
use crate::workdir::WorkdirManager;
use crate::TmcError;

pub const BASELINE_LABEL: &str = "Unperturbed";

#[derive(Debug, Clone)]
pub struct CampaignReport {
    pub container: PersistedContainer,
    pub container_path: PathBuf,
    pub attempts: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Campaign-wide attempt ceiling.
#[derive(Debug)]
pub struct AttemptBudget {
    max: usize,
    used: AtomicUsize,
    exhausted: AtomicBool,
}

impl AttemptBudget {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            used: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    pub fn try_consume(&self) -> bool {
        let consumed = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.max).then_some(used + 1)
            })
            .is_ok();
        if !consumed {
            self.exhausted.store(true, Ordering::SeqCst);
        }
        consumed
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct ClaimState {
    succeeded: usize,
    in_flight: usize,
    next_draw: usize,
}

struct GroupProgress {
    index: usize,
    group: InstanceGroup,
    label_prefix: String,
    /// Descriptors drawn for this group: one in single-parameter mode, all
    /// of them in TMC mode.
    descriptors: Vec<ParameterDescriptor>,
    target: usize,
    state: Mutex<ClaimState>,
}

impl GroupProgress {
    fn claim(&self) -> Option<usize> {
        let mut state = self.state.lock();
        if state.succeeded + state.in_flight >= self.target {
            return None;
        }
        let draw = state.next_draw;
        state.next_draw += 1;
        state.in_flight += 1;
        Some(draw)
    }

    fn settle(&self, succeeded: bool) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        if succeeded {
            state.succeeded += 1;
        }
    }

    fn succeeded(&self) -> usize {
        self.state.lock().succeeded
    }

    fn label(&self, draw: usize) -> String {
        format!("{}_{draw}", self.label_prefix)
    }
}

struct Campaign<'a> {
    file: &'a CampaignFile,
    executor: UnitExecutor,
    perturber: Perturber,
    aggregate: ResultAggregate,
    budget: AttemptBudget,
    cancel: CancelToken,
    groups: Vec<GroupProgress>,
    next_group: AtomicUsize,
}

/// Runs a whole campaign and writes its container to `paths.output_dir`.
///
/// Per-unit failures are recorded and retried; only an exhausted attempt
/// budget is returned as an error, after the partial container is written.
pub fn run_campaign(
    file: &CampaignFile,
    runner: Arc<dyn ProgramRunner>,
    cancel: CancelToken,
) -> Result<CampaignReport, TmcError> {
    file.validate()?;
    let descriptors = resolve_descriptors(
        &file.parameters,
        &file.perturbation,
        file.paths.parameter_defaults.as_deref(),
    )?;
    let limits = file.limits();
    let samples = file.samples_per_group();

    let groups: Vec<GroupProgress> = match file.campaign.mode {
        SimulationMode::SingleParameters => descriptors
            .iter()
            .enumerate()
            .map(|(index, descriptor)| GroupProgress {
                index,
                group: InstanceGroup::SingleParameter {
                    parameter: descriptor.name.clone(),
                },
                label_prefix: format!("Param_{}", descriptor.name),
                descriptors: vec![descriptor.clone()],
                target: samples,
                state: Mutex::new(ClaimState::default()),
            })
            .collect(),
        SimulationMode::Tmc => vec![GroupProgress {
            index: 0,
            group: InstanceGroup::Joint,
            label_prefix: "TMC".to_string(),
            descriptors: descriptors.clone(),
            target: samples,
            state: Mutex::new(ClaimState::default()),
        }],
    };

    let campaign = Campaign {
        file,
        executor: UnitExecutor {
            reaction: file.reaction.clone(),
            programs: file.programs.clone(),
            workdirs: WorkdirManager::new(&file.paths),
            collector: Collector::new(file.programs.evaporation_outputs.clone()).with_summaries(
                file.programs
                    .fission_outputs
                    .iter()
                    .map(|spec| spec.for_reaction(&file.reaction))
                    .collect(),
            ),
            runner,
            cancel: cancel.clone(),
            with_evaporation: file.campaign.with_evaporation,
            retain_working_dirs: file.campaign.retain_working_dirs,
        },
        perturber: Perturber::new(file.perturbation.clone()),
        aggregate: ResultAggregate::new(
            file.reaction.clone(),
            file.campaign.mode,
            samples,
            descriptors,
        ),
        budget: AttemptBudget::new(file.max_total_attempts()),
        cancel,
        groups,
        next_group: AtomicUsize::new(0),
    };

    info!(
        mode = file.campaign.mode.as_str(),
        groups = campaign.groups.len(),
        samples_per_group = samples,
        max_attempts = file.max_total_attempts(),
        "campaign started"
    );

    thread::scope(|scope| -> Result<(), TmcError> {
        if file.campaign.run_baseline {
            scope.spawn(|| campaign.run_baseline());
        }
        match file.campaign.mode {
            SimulationMode::SingleParameters => campaign.run_lanes(
                limits.parameters_in_flight.min(campaign.groups.len()),
                limits.repeats_per_parameter,
            ),
            SimulationMode::Tmc => campaign.run_flat(limits.tmc_workers),
        }
    })?;

    campaign.finish()
}

fn build_pool(threads: usize, name: &'static str) -> Result<ThreadPool, TmcError> {
    Ok(ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(move |idx| format!("{name}-{idx}"))
        .build()?)
}

impl Campaign<'_> {
    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.budget.is_exhausted()
    }

    /// Single-parameter mode: `outer` lanes each take whole groups off the
    /// queue and work them with `inner` concurrent repeats.
    fn run_lanes(&self, outer: usize, inner: usize) -> Result<(), TmcError> {
        let outer = outer.max(1);
        let lanes = build_pool(outer, "tmc-parameter")?;
        let repeat_pools = (0..outer)
            .map(|_| build_pool(inner, "tmc-repeat"))
            .collect::<Result<Vec<_>, _>>()?;

        lanes.scope(|scope| {
            for pool in &repeat_pools {
                scope.spawn(move |_| {
                    while let Some(group) = self.next_group() {
                        if self.should_stop() {
                            break;
                        }
                        pool.scope(|inner_scope| {
                            for _ in 0..inner {
                                inner_scope.spawn(|_| self.worker(group));
                            }
                        });
                        info!(
                            group = group.group.name(),
                            succeeded = group.succeeded(),
                            requested = group.target,
                            "parameter finished"
                        );
                    }
                });
            }
        });
        Ok(())
    }

    /// TMC mode: one flat pool working the joint group.
    fn run_flat(&self, workers: usize) -> Result<(), TmcError> {
        let pool = build_pool(workers, "tmc-joint")?;
        pool.scope(|scope| {
            for group in &self.groups {
                for _ in 0..workers {
                    scope.spawn(move |_| self.worker(group));
                }
            }
        });
        Ok(())
    }

    fn next_group(&self) -> Option<&GroupProgress> {
        let idx = self.next_group.fetch_add(1, Ordering::SeqCst);
        self.groups.get(idx)
    }

    fn draw(&self, group: &GroupProgress, draw: usize) -> Result<Vec<PerturbedValue>, TmcError> {
        if self.file.campaign.sampling == SamplingStrategy::MaxMin {
            let factor = self.perturber.factor_for_draw(draw).ok_or_else(|| {
                TmcError::InvalidConfig("max_min sampling needs at least one factor".to_string())
            })?;
            return Ok(group
                .descriptors
                .iter()
                .map(|descriptor| self.perturber.scale(descriptor, factor))
                .collect());
        }

        let mut rng = unit_rng(self.file.campaign.seed, group.index, draw);
        group
            .descriptors
            .iter()
            .map(|descriptor| self.perturber.perturb(descriptor, &mut rng))
            .collect()
    }

    fn worker(&self, group: &GroupProgress) {
        while !self.should_stop() {
            let Some(draw) = group.claim() else {
                break;
            };
            let label = group.label(draw);

            let parameters = match self.draw(group, draw) {
                Ok(parameters) => parameters,
                Err(error) => {
                    if !self.budget.try_consume() {
                        group.settle(false);
                        break;
                    }
                    self.record_failure(
                        UnitPlan {
                            label,
                            group: group.group.clone(),
                            draw,
                            parameters: Vec::new(),
                        },
                        UnitFailure {
                            error,
                            stage: UnitStage::Prepare,
                            working_dirs: None,
                            elapsed: Default::default(),
                        },
                        1,
                    );
                    group.settle(false);
                    continue;
                }
            };

            let plan = UnitPlan {
                label,
                group: group.group.clone(),
                draw,
                parameters,
            };
            let succeeded = self.run_with_retries(&plan, true);
            group.settle(succeeded);
        }
    }

    /// Runs `plan` until it succeeds or its retries are used up. Returns
    /// whether an instance was collected.
    fn run_with_retries(&self, plan: &UnitPlan, charge_budget: bool) -> bool {
        let retries = self.file.campaign.retries_per_unit;
        let mut attempt = 0;

        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if charge_budget && !self.budget.try_consume() {
                debug!(label = %plan.label, "attempt budget exhausted before dispatch");
                return false;
            }

            match self.executor.execute(plan, attempt) {
                Ok(success) => {
                    self.record_success(plan, success, attempt + 1);
                    return true;
                }
                Err(failure)
                    if matches!(failure.error, TmcError::Cancelled) || self.cancel.is_cancelled() =>
                {
                    debug!(label = %plan.label, "unit discarded after cancellation");
                    return false;
                }
                Err(failure) if attempt < retries => {
                    warn!(
                        label = %plan.label,
                        stage = %failure.stage,
                        attempt = attempt + 1,
                        error = %failure.error,
                        "unit failed, retrying"
                    );
                    attempt += 1;
                }
                Err(failure) => {
                    warn!(
                        label = %plan.label,
                        stage = %failure.stage,
                        error = %failure.error,
                        "unit failed permanently"
                    );
                    self.record_failure(plan.clone(), failure, attempt + 1);
                    return false;
                }
            }
        }
    }

    fn record_success(&self, plan: &UnitPlan, success: UnitSuccess, attempts: usize) {
        let instance = SimulationInstance {
            id: 0,
            label: plan.label.clone(),
            group: plan.group.clone(),
            draw: plan.draw,
            parameters: plan.parameters.clone(),
            outcome: InstanceOutcome::Collected(success.observables),
            attempts,
            runs: success.runs,
            working_dirs: success.working_dirs,
            elapsed_secs: success.elapsed.as_secs_f64(),
        };
        if let Err(err) = self.aggregate.append(instance) {
            warn!(label = %plan.label, error = %err, "instance could not be recorded");
        } else {
            debug!(label = %plan.label, attempts, "instance collected");
        }
    }

    fn record_failure(&self, plan: UnitPlan, failure: UnitFailure, attempts: usize) {
        let instance = SimulationInstance {
            id: 0,
            label: plan.label.clone(),
            group: plan.group,
            draw: plan.draw,
            parameters: plan.parameters,
            outcome: InstanceOutcome::Failed(FailureRecord {
                kind: failure.error.kind(),
                stage: failure.stage,
                message: failure.error.to_string(),
            }),
            attempts,
            runs: Vec::new(),
            working_dirs: failure.working_dirs,
            elapsed_secs: failure.elapsed.as_secs_f64(),
        };
        if let Err(err) = self.aggregate.append(instance) {
            warn!(label = %plan.label, error = %err, "failed instance could not be recorded");
        }
    }

    /// Unperturbed reference run; it does not draw on the attempt budget.
    fn run_baseline(&self) {
        let plan = UnitPlan {
            label: BASELINE_LABEL.to_string(),
            group: InstanceGroup::Baseline,
            draw: 0,
            parameters: Vec::new(),
        };
        if self.run_with_retries(&plan, false) {
            info!("baseline instance collected");
        }
    }

    fn finish(self) -> Result<CampaignReport, TmcError> {
        let complete = self.groups.iter().all(|g| g.succeeded() >= g.target);
        let attempts = self.budget.used();

        if self.cancel.is_cancelled() && !complete {
            self.aggregate.mark_incomplete(Interruption::Cancelled);
        } else if complete {
            self.aggregate.mark_complete();
        } else {
            self.aggregate
                .mark_incomplete(Interruption::ExhaustedRetries { attempts });
        }

        let container = self.aggregate.finalize();
        let container_path = write_container(&self.file.paths.output_dir, &container)?;

        let instances = container.single_parameters.iter().chain(container.tmc.iter());
        let succeeded = instances.clone().filter(|i| i.is_success()).count();
        let failed = instances.count() - succeeded;

        info!(
            path = %container_path.display(),
            status = ?container.status,
            succeeded,
            failed,
            attempts,
            "campaign finished"
        );

        if matches!(container.interruption, Some(Interruption::ExhaustedRetries { .. })) {
            return Err(TmcError::ExhaustedRetries {
                attempts,
                succeeded,
                requested: self.file.total_requested(),
                container: Some(container_path),
            });
        }

        Ok(CampaignReport {
            container,
            container_path,
            attempts,
            succeeded,
            failed,
        })
    }
}
