//! fission-tmc - Total Monte Carlo orchestration
//!
//! Drives repeated coupled runs of a fission-fragment generator (program A)
//! and an evaporation code (program B) with perturbed model parameters,
//! harvests their outputs against the parameter values that produced them,
//! and persists the whole campaign as one container file.

pub mod aggregate;
pub mod collect;
pub mod config;
pub mod driver;
pub mod fragments;
pub mod inputs;
pub mod output;
pub mod params;
pub mod perturb;
pub mod scheduler;
pub mod unit;
pub mod workdir;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use aggregate::{
    CampaignStatus, Interruption, PersistedContainer, ResultAggregate, SimulationInstance,
};
pub use collect::{Collector, Observables};
pub use config::{CampaignFile, ReactionConfig, SimulationMode};
pub use driver::{cancel_on_shutdown_signal, CancelToken, ProgramRunner, SubprocessRunner};
pub use params::{DistributionKind, ParameterDescriptor};
pub use perturb::Perturber;
pub use scheduler::{run_campaign, CampaignReport};
pub use workdir::{WorkdirManager, WorkingDirs};

#[derive(Debug, Error)]
pub enum TmcError {
    #[error("working directory {path} is already in use by an active run")]
    DirectoryConflict { path: PathBuf },
    #[error("io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} failed ({exit}): {diagnostics}")]
    ExternalProgramFailure {
        program: String,
        exit: String,
        diagnostics: String,
    },
    #[error("{program} reported success but {path} was not produced")]
    OutputMissing { program: String, path: PathBuf },
    #[error("{program} exceeded its wall-clock limit of {limit:?} and was terminated")]
    Timeout { program: String, limit: Duration },
    #[error("malformed output {path} (line {line}): {reason}")]
    MalformedOutput {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error(
        "attempt budget exhausted after {attempts} attempts: {succeeded} of {requested} instances succeeded"
    )]
    ExhaustedRetries {
        attempts: usize,
        succeeded: usize,
        requested: usize,
        container: Option<PathBuf>,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid container: {0}")]
    InvalidContainer(String),
    #[error("campaign cancelled")]
    Cancelled,
    #[error("shutdown signal handler: {0}")]
    Signal(#[source] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("worker pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Serializable tag of a [`TmcError`], stored with failed instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DirectoryConflict,
    IoFailure,
    ExternalProgramFailure,
    OutputMissing,
    Timeout,
    MalformedOutput,
    ExhaustedRetries,
    InvalidConfig,
    Cancelled,
    Other,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectoryConflict => "directory_conflict",
            Self::IoFailure => "io_failure",
            Self::ExternalProgramFailure => "external_program_failure",
            Self::OutputMissing => "output_missing",
            Self::Timeout => "timeout",
            Self::MalformedOutput => "malformed_output",
            Self::ExhaustedRetries => "exhausted_retries",
            Self::InvalidConfig => "invalid_config",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        }
    }
}

impl TmcError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::DirectoryConflict { .. } => FailureKind::DirectoryConflict,
            Self::Io { .. } => FailureKind::IoFailure,
            Self::ExternalProgramFailure { .. } => FailureKind::ExternalProgramFailure,
            Self::OutputMissing { .. } => FailureKind::OutputMissing,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::MalformedOutput { .. } => FailureKind::MalformedOutput,
            Self::ExhaustedRetries { .. } => FailureKind::ExhaustedRetries,
            Self::InvalidConfig(_) => FailureKind::InvalidConfig,
            Self::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Other,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, line: usize, reason: impl Into<String>) -> Self {
        Self::MalformedOutput {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }
}
