//! One unit of work: prepare → program A → chain → program B → collect,
//! with the working directories released on every exit path.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aggregate::InstanceGroup;
use crate::collect::{Collector, Observables};
use crate::config::{ProgramsConfig, ReactionConfig};
use crate::driver::{CancelToken, ProgramRun, ProgramRunner};
use crate::fragments::{read_yield_table, write_fragment_files, YieldTable};
use crate::inputs::{write_evaporation_input, write_fission_inputs};
use crate::perturb::PerturbedValue;
use crate::workdir::{WorkdirManager, WorkingDirPaths, WorkingDirs};
use crate::TmcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStage {
    Prepare,
    Fission,
    Chain,
    Evaporation,
    Collect,
}

impl fmt::Display for UnitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Prepare => "prepare",
            Self::Fission => "fission",
            Self::Chain => "chain",
            Self::Evaporation => "evaporation",
            Self::Collect => "collect",
        };
        f.write_str(name)
    }
}

/// A fully drawn unit: its label, group and the parameter values to run.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitPlan {
    pub label: String,
    pub group: InstanceGroup,
    pub draw: usize,
    pub parameters: Vec<PerturbedValue>,
}

#[derive(Debug)]
pub struct UnitSuccess {
    pub observables: Observables,
    /// Program A first, then program B when it ran.
    pub runs: Vec<ProgramRun>,
    pub working_dirs: Option<WorkingDirPaths>,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct UnitFailure {
    pub error: TmcError,
    pub stage: UnitStage,
    pub working_dirs: Option<WorkingDirPaths>,
    pub elapsed: Duration,
}

/// Label of the scratch directories for one attempt of a unit.
pub fn attempt_label(label: &str, attempt: usize) -> String {
    if attempt == 0 {
        label.to_string()
    } else {
        format!("{label}_retry{attempt}")
    }
}

/// Read-only context shared by every worker.
pub struct UnitExecutor {
    pub reaction: ReactionConfig,
    pub programs: ProgramsConfig,
    pub workdirs: WorkdirManager,
    pub collector: Collector,
    pub runner: Arc<dyn ProgramRunner>,
    pub cancel: CancelToken,
    pub with_evaporation: bool,
    pub retain_working_dirs: bool,
}

impl UnitExecutor {
    pub fn execute(&self, plan: &UnitPlan, attempt: usize) -> Result<UnitSuccess, UnitFailure> {
        let started = Instant::now();
        let run_label = attempt_label(&plan.label, attempt);

        let mut dirs = match self.workdirs.prepare(&run_label) {
            Ok(dirs) => dirs,
            Err(error) => {
                return Err(UnitFailure {
                    error,
                    stage: UnitStage::Prepare,
                    working_dirs: None,
                    elapsed: started.elapsed(),
                })
            }
        };

        let result = self.pipeline(plan, &run_label, &mut dirs);
        let working_dirs = self.retain_working_dirs.then(|| dirs.paths());

        match dirs.release(self.retain_working_dirs) {
            Ok(report) if !report.missing.is_empty() => {
                debug!(label = %run_label, missing = report.missing.len(), "cleanup found missing paths")
            }
            Ok(_) => {}
            Err(err) => warn!(label = %run_label, error = %err, "working directory cleanup failed"),
        }

        let elapsed = started.elapsed();
        match result {
            Ok((observables, runs)) => Ok(UnitSuccess {
                observables,
                runs,
                working_dirs,
                elapsed,
            }),
            Err((stage, error)) => Err(UnitFailure {
                error,
                stage,
                working_dirs,
                elapsed,
            }),
        }
    }

    fn pipeline(
        &self,
        plan: &UnitPlan,
        run_label: &str,
        dirs: &mut WorkingDirs,
    ) -> Result<(Observables, Vec<ProgramRun>), (UnitStage, TmcError)> {
        let at = |stage: UnitStage| move |err: TmcError| (stage, err);
        let mut runs = Vec::with_capacity(2);

        let list_mode = write_fission_inputs(
            dirs.fission_dir(),
            &self.reaction,
            self.programs.list_mode,
            &plan.parameters,
        )
        .map_err(at(UnitStage::Prepare))?;

        debug!(label = run_label, stage = %UnitStage::Fission, "running");
        let fission = self.programs.fission.for_run(run_label);
        let run = self
            .runner
            .run(&fission, dirs.fission_dir(), &[list_mode.clone()], &self.cancel)
            .and_then(|result| result.into_record(&fission.name))
            .map_err(at(UnitStage::Fission))?;
        debug!(label = run_label, exit_code = ?run.exit_code, elapsed_secs = run.elapsed_secs, "fission finished");
        runs.push(run);

        debug!(label = run_label, stage = %UnitStage::Chain, "running");
        let table = self.chain(&list_mode, run_label, dirs).map_err(at(UnitStage::Chain))?;

        let evaporation_dir = if self.with_evaporation {
            debug!(label = run_label, stage = %UnitStage::Evaporation, "running");
            write_evaporation_input(
                dirs.evaporation_dir(),
                run_label,
                &self.reaction,
                &self.programs.evaporation_keywords,
            )
            .map_err(at(UnitStage::Evaporation))?;
            let evaporation = self.programs.evaporation.for_run(run_label);
            let run = self
                .runner
                .run(&evaporation, dirs.evaporation_dir(), &[], &self.cancel)
                .and_then(|result| result.into_record(&evaporation.name))
                .map_err(at(UnitStage::Evaporation))?;
            debug!(label = run_label, exit_code = ?run.exit_code, elapsed_secs = run.elapsed_secs, "evaporation finished");
            runs.push(run);
            Some(dirs.evaporation_dir())
        } else {
            None
        };

        debug!(label = run_label, stage = %UnitStage::Collect, "running");
        let observables = self
            .collector
            .collect(&plan.label, table, dirs.fission_dir(), evaporation_dir)
            .map_err(at(UnitStage::Collect))?;
        Ok((observables, runs))
    }

    /// Reduces program A's events and hands them to program B as fragment
    /// files. Program B only starts after this has completed.
    fn chain(
        &self,
        list_mode: &Path,
        run_label: &str,
        dirs: &mut WorkingDirs,
    ) -> Result<YieldTable, TmcError> {
        let table = read_yield_table(list_mode, self.reaction.compound_a)?;
        if self.with_evaporation {
            let target = dirs.fragment_dir().to_path_buf();
            let written = write_fragment_files(
                &target,
                &table,
                &self.reaction,
                run_label,
                &self.programs.fragment_energies_mev,
            )?;
            for path in written {
                dirs.track_external(path);
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::collect::{sample_generator_summary, SummarySpec};
    use crate::config::PathsConfig;
    use crate::driver::ExecutionResult;
    use crate::fragments::LIST_MODE_COLUMNS;

    /// Writes a small list-mode file and a generator summary, then reports
    /// the configured exit status.
    struct FixedRunner {
        success: bool,
        exit_code: Option<i32>,
    }

    impl ProgramRunner for FixedRunner {
        fn run(
            &self,
            _program: &crate::config::ProgramSpec,
            working_dir: &Path,
            expected_outputs: &[PathBuf],
            _cancel: &CancelToken,
        ) -> Result<ExecutionResult, TmcError> {
            let mut cols = vec!["0".to_string(); LIST_MODE_COLUMNS];
            for (col, value) in [(2, "38"), (3, "54"), (4, "96"), (5, "140"), (22, "170.0")] {
                cols[col] = value.to_string();
            }
            let line = cols.join(" ");
            fs::write(&expected_outputs[0], format!("{line}\n{line}\n"))
                .map_err(TmcError::io(&expected_outputs[0]))?;
            let summary = working_dir.join("out/GEF_92_236_n.dat");
            fs::write(&summary, sample_generator_summary()).map_err(TmcError::io(&summary))?;
            Ok(ExecutionResult {
                success: self.success,
                exit_code: self.exit_code,
                elapsed: Duration::from_millis(20),
                output_paths: expected_outputs.to_vec(),
            })
        }
    }

    fn executor(root: &Path, runner: FixedRunner) -> UnitExecutor {
        let reaction = ReactionConfig::default();
        let summaries = SummarySpec::fission_defaults()
            .iter()
            .map(|spec| spec.for_reaction(&reaction))
            .collect();
        UnitExecutor {
            reaction,
            programs: ProgramsConfig::default(),
            workdirs: WorkdirManager::new(&PathsConfig {
                work_root: root.to_path_buf(),
                ..Default::default()
            }),
            collector: Collector::new(Vec::new()).with_summaries(summaries),
            runner: Arc::new(runner),
            cancel: CancelToken::new(),
            with_evaporation: false,
            retain_working_dirs: false,
        }
    }

    fn plan() -> UnitPlan {
        UnitPlan {
            label: "TMC_0".to_string(),
            group: InstanceGroup::Joint,
            draw: 0,
            parameters: Vec::new(),
        }
    }

    #[test]
    fn exit_codes_of_finished_runs_are_kept() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let runner = FixedRunner {
            success: true,
            exit_code: Some(0),
        };
        let success = executor(tmp.path(), runner).execute(&plan(), 0).expect("unit");

        assert_eq!(success.runs.len(), 1);
        assert_eq!(success.runs[0].program, "gef");
        assert_eq!(success.runs[0].exit_code, Some(0));
        assert_eq!(success.observables.fission.summary.scalars["gef_mean_txe"], 21.3);
    }

    #[test]
    fn unsuccessful_result_fails_the_fission_stage() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let runner = FixedRunner {
            success: false,
            exit_code: Some(2),
        };
        let failure = executor(tmp.path(), runner).execute(&plan(), 0).unwrap_err();

        assert_eq!(failure.stage, UnitStage::Fission);
        assert!(matches!(failure.error, TmcError::ExternalProgramFailure { .. }));
        assert!(!tmp.path().join("fission/TMC_0").exists());
    }

    #[test]
    fn retries_get_their_own_directory_label() {
        assert_eq!(attempt_label("TMC_3", 0), "TMC_3");
        assert_eq!(attempt_label("TMC_3", 2), "TMC_3_retry2");
    }

    #[test]
    fn stage_names_are_stable() {
        assert_eq!(UnitStage::Evaporation.to_string(), "evaporation");
        assert_eq!(
            serde_json::to_string(&UnitStage::Chain).expect("serialize"),
            "\"chain\""
        );
    }
}
