use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

use crate::collect::{OutputSpec, SummarySpec};
use crate::params::ParameterEntry;
use crate::TmcError;

/// Immutable description of the fission reaction under study.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactionConfig {
    #[serde_as(as = "DefaultOnNull")]
    pub target_z: u32,
    /// Mass number of the compound (fissioning) nucleus.
    #[serde_as(as = "DefaultOnNull")]
    pub compound_a: u32,
    #[serde_as(as = "DefaultOnNull")]
    pub incident_energy_mev: f64,
    #[serde_as(as = "DefaultOnNull")]
    pub particle: IncidentParticle,
    /// Monte Carlo events simulated by the fission-fragment generator per run.
    #[serde_as(as = "DefaultOnNull")]
    pub fission_events: u64,
}

impl Default for ReactionConfig {
    fn default() -> Self {
        Self {
            target_z: 92,
            compound_a: 236,
            incident_energy_mev: 2.53e-8,
            particle: IncidentParticle::Neutron,
            fission_events: 100_000,
        }
    }
}

impl ReactionConfig {
    pub fn validate(&self) -> Result<(), TmcError> {
        self.element_symbol()?;

        if self.compound_a <= self.target_z + 1 {
            return Err(TmcError::InvalidConfig(format!(
                "compound_a {} is not a valid mass number for Z = {}",
                self.compound_a, self.target_z
            )));
        }

        if !self.incident_energy_mev.is_finite() || self.incident_energy_mev <= 0.0 {
            return Err(TmcError::InvalidConfig(
                "incident_energy_mev must be finite and positive".to_string(),
            ));
        }

        if self.fission_events < 100_000 {
            return Err(TmcError::InvalidConfig(
                "fission_events must be at least 100000".to_string(),
            ));
        }

        Ok(())
    }

    pub fn element_symbol(&self) -> Result<&'static str, TmcError> {
        element_symbol(self.target_z).ok_or_else(|| {
            TmcError::InvalidConfig(format!("no element symbol known for Z = {}", self.target_z))
        })
    }

    /// Mass number of the target nucleus before neutron capture.
    pub fn target_a(&self) -> u32 {
        self.compound_a.saturating_sub(1)
    }

    /// Energy as it appears in file names: integral energies lose their decimals.
    pub fn energy_label(&self) -> String {
        let energy = self.incident_energy_mev;
        if energy.fract() == 0.0 && energy.abs() < 1e15 {
            format!("{}", energy as i64)
        } else {
            float_repr(energy)
        }
    }

    /// Energy as written into the external programs' input files.
    pub fn energy_input(&self) -> String {
        float_repr(self.incident_energy_mev)
    }

    /// Event count in units of 10^5, the multiplier the generator reads.
    pub fn event_multiplier(&self) -> u64 {
        self.fission_events / 100_000
    }

    /// `Z92_A236_n_E2.53e-08MeV`, shared by list-mode and container files.
    pub fn file_stem(&self) -> String {
        format!(
            "Z{}_A{}_{}_E{}MeV",
            self.target_z,
            self.compound_a,
            self.particle.tag(),
            self.energy_label()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IncidentParticle {
    #[default]
    Neutron,
}

impl IncidentParticle {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Neutron => "n",
        }
    }

    /// Option word understood by the fission-fragment generator.
    pub fn generator_option(self) -> &'static str {
        match self {
            Self::Neutron => "EN",
        }
    }
}

pub fn element_symbol(z: u32) -> Option<&'static str> {
    let symbol = match z {
        90 => "Th",
        91 => "Pa",
        92 => "U",
        93 => "Np",
        94 => "Pu",
        95 => "Am",
        96 => "Cm",
        97 => "Bk",
        98 => "Cf",
        99 => "Es",
        100 => "Fm",
        _ => return None,
    };
    Some(symbol)
}

/// Shortest round-trip rendering with a two-digit signed exponent below 1e-4
/// or from 1e16 up, and a trailing `.0` for integral values.
pub fn float_repr(value: f64) -> String {
    if value == 0.0 {
        return "0.0".to_string();
    }
    if !value.is_finite() {
        return format!("{value}");
    }

    let scientific = format!("{value:e}");
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some((m, e)) => (m.to_string(), e.parse::<i32>().unwrap_or(0)),
        None => (scientific.clone(), 0),
    };

    if !(-4..16).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exponent.abs());
    }

    let plain = format!("{value}");
    if plain.contains('.') {
        plain
    } else {
        format!("{plain}.0")
    }
}

/// Fixed-precision scientific notation with a two-digit signed exponent
/// (`6.00e+00`).
pub fn format_sci(value: f64, precision: usize) -> String {
    let raw = format!("{value:.precision$e}");
    match raw.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => raw,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimulationMode {
    /// One parameter varied at a time, the others held at default.
    #[default]
    SingleParameters,
    /// All selected parameters varied jointly in every draw.
    Tmc,
}

impl SimulationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleParameters => "single_parameters",
            Self::Tmc => "tmc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    #[default]
    Random,
    /// Deterministic user scaling factors instead of random draws.
    MaxMin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnevenBatchPolicy {
    #[default]
    Allow,
    Reject,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignSettings {
    #[serde_as(as = "DefaultOnNull")]
    pub mode: SimulationMode,
    /// Successful instances requested per parameter, or in total for TMC.
    #[serde_as(as = "DefaultOnNull")]
    pub samples: usize,
    #[serde_as(as = "DefaultOnNull")]
    pub seed: u64,
    #[serde_as(as = "DefaultOnNull")]
    pub sampling: SamplingStrategy,
    #[serde_as(as = "DefaultOnNull")]
    pub with_evaporation: bool,
    #[serde_as(as = "DefaultOnNull")]
    pub run_baseline: bool,
    #[serde_as(as = "DefaultOnNull")]
    pub retain_working_dirs: bool,
    #[serde_as(as = "DefaultOnNull")]
    pub retries_per_unit: usize,
    #[serde(default)]
    pub max_total_attempts: Option<usize>,
    #[serde_as(as = "DefaultOnNull")]
    pub uneven_batches: UnevenBatchPolicy,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            mode: SimulationMode::SingleParameters,
            samples: 100,
            seed: 0x7AC0_2024_0001_u64,
            sampling: SamplingStrategy::Random,
            with_evaporation: true,
            run_baseline: true,
            retain_working_dirs: false,
            retries_per_unit: 2,
            max_total_attempts: None,
            uneven_batches: UnevenBatchPolicy::Allow,
        }
    }
}

/// Worker ceilings; omitted values are derived from the available cores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub parameters_in_flight: Option<usize>,
    pub repeats_per_parameter: Option<usize>,
    pub tmc_workers: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyLimits {
    pub parameters_in_flight: usize,
    pub repeats_per_parameter: usize,
    pub tmc_workers: usize,
}

impl ConcurrencyConfig {
    pub fn resolve(&self, cores: usize) -> ConcurrencyLimits {
        let cores = cores.max(1);
        let parameters_in_flight = self
            .parameters_in_flight
            .unwrap_or_else(|| (cores.saturating_sub(2) / 3).max(1));
        let repeats_per_parameter = self
            .repeats_per_parameter
            .unwrap_or_else(|| (cores.saturating_sub(parameters_in_flight) / 2).max(1));
        let tmc_workers = self.tmc_workers.unwrap_or_else(|| (2 * cores / 3).max(1));

        ConcurrencyLimits {
            parameters_in_flight,
            repeats_per_parameter,
            tmc_workers,
        }
    }

    pub fn validate(&self) -> Result<(), TmcError> {
        let explicit = [
            ("parameters_in_flight", self.parameters_in_flight),
            ("repeats_per_parameter", self.repeats_per_parameter),
            ("tmc_workers", self.tmc_workers),
        ];
        for (name, value) in explicit {
            if value == Some(0) {
                return Err(TmcError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Distribution widths, fixed for the lifetime of a campaign.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerturbationConfig {
    /// Relative half-width of the ordinary uniform rule.
    #[serde_as(as = "DefaultOnNull")]
    pub uniform_width: f64,
    /// Relative standard deviation of the ordinary normal rule.
    #[serde_as(as = "DefaultOnNull")]
    pub normal_relative_st_dev: f64,
    #[serde_as(as = "DefaultOnNull")]
    pub special_uniform_half_range: f64,
    #[serde_as(as = "DefaultOnNull")]
    pub special_st_dev: f64,
    #[serde(default = "default_max_min_factors")]
    pub max_min_factors: Vec<f64>,
}

fn default_max_min_factors() -> Vec<f64> {
    vec![1.0, 1.5]
}

impl Default for PerturbationConfig {
    fn default() -> Self {
        Self {
            uniform_width: 0.5,
            normal_relative_st_dev: 0.03,
            special_uniform_half_range: 0.5,
            special_st_dev: 0.03,
            max_min_factors: default_max_min_factors(),
        }
    }
}

impl PerturbationConfig {
    pub fn validate(&self) -> Result<(), TmcError> {
        let widths = [
            ("uniform_width", self.uniform_width),
            ("normal_relative_st_dev", self.normal_relative_st_dev),
            ("special_uniform_half_range", self.special_uniform_half_range),
            ("special_st_dev", self.special_st_dev),
        ];
        for (name, value) in widths {
            if !value.is_finite() || value < 0.0 {
                return Err(TmcError::InvalidConfig(format!(
                    "{name} must be finite and non-negative"
                )));
            }
        }

        if self.max_min_factors.iter().any(|f| !f.is_finite()) {
            return Err(TmcError::InvalidConfig(
                "max_min_factors must contain only finite values".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Parent of the per-run scratch directories.
    pub work_root: PathBuf,
    pub output_dir: PathBuf,
    /// Generator parameter source (`Parameters.bas`) used for missing defaults.
    pub parameter_defaults: Option<PathBuf>,
    /// Shared directory the evaporation code reads fragment files from. When
    /// unset, fragment files go into the evaporation working directory.
    pub fragment_library: Option<PathBuf>,
    /// Files copied into every fission-program working directory.
    pub fission_template: Option<PathBuf>,
    pub evaporation_template: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("runtime"),
            output_dir: PathBuf::from("output"),
            parameter_defaults: None,
            fragment_library: None,
            fission_template: None,
            evaporation_template: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StdinSource {
    Null,
    Text(String),
    /// File inside the working directory.
    File(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StdoutSink {
    Discard,
    File(String),
}

/// Command-line contract of one external program. `{label}` in arguments and
/// redirect file names is replaced by the run label.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramSpec {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub stdin: StdinSource,
    pub stdout: StdoutSink,
    pub timeout_ms: Option<u64>,
    #[serde_as(as = "DefaultOnNull")]
    pub poll_interval_ms: u64,
}

impl Default for ProgramSpec {
    fn default() -> Self {
        Self {
            name: "program".to_string(),
            command: PathBuf::new(),
            args: Vec::new(),
            stdin: StdinSource::Null,
            stdout: StdoutSink::Discard,
            timeout_ms: None,
            poll_interval_ms: 200,
        }
    }
}

impl ProgramSpec {
    pub fn fission_default() -> Self {
        Self {
            name: "gef".to_string(),
            command: PathBuf::from("GEF"),
            stdin: StdinSource::Text("\n".to_string()),
            ..Default::default()
        }
    }

    pub fn evaporation_default() -> Self {
        Self {
            name: "talys".to_string(),
            command: PathBuf::from("talys"),
            stdin: StdinSource::File("{label}_input.in".to_string()),
            stdout: StdoutSink::File("{label}_output.out".to_string()),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn for_run(&self, label: &str) -> Self {
        let fill = |s: &str| s.replace("{label}", label);
        Self {
            args: self.args.iter().map(|a| fill(a)).collect(),
            stdin: match &self.stdin {
                StdinSource::File(name) => StdinSource::File(fill(name)),
                other => other.clone(),
            },
            stdout: match &self.stdout {
                StdoutSink::File(name) => StdoutSink::File(fill(name)),
                other => other.clone(),
            },
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), TmcError> {
        if self.name.trim().is_empty() {
            return Err(TmcError::InvalidConfig(
                "program name must not be empty".to_string(),
            ));
        }

        if self.command.as_os_str().is_empty() {
            return Err(TmcError::InvalidConfig(format!(
                "program {} has no command",
                self.name
            )));
        }

        if self.poll_interval_ms == 0 {
            return Err(TmcError::InvalidConfig(format!(
                "program {}: poll_interval_ms must be greater than zero",
                self.name
            )));
        }

        if self.timeout_ms == Some(0) {
            return Err(TmcError::InvalidConfig(format!(
                "program {}: timeout_ms must be greater than zero when set",
                self.name
            )));
        }

        let redirects = [
            match &self.stdin {
                StdinSource::File(name) => Some(name),
                _ => None,
            },
            match &self.stdout {
                StdoutSink::File(name) => Some(name),
                StdoutSink::Discard => None,
            },
        ];
        for name in redirects.into_iter().flatten() {
            if !is_confined(Path::new(name)) {
                return Err(TmcError::InvalidConfig(format!(
                    "program {}: redirect file {name} must be a relative path inside the working directory",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// True for non-empty relative paths without `..` or root components.
pub fn is_confined(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// List-mode layout requested from the fission-fragment generator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListModeFormat {
    #[default]
    #[serde(rename = "lmd")]
    Plain,
    /// Adds prompt neutron and gamma energies per fragment.
    #[serde(rename = "lmd+")]
    Extended,
}

impl ListModeFormat {
    pub fn generator_option(self) -> &'static str {
        match self {
            Self::Plain => "lmd",
            Self::Extended => "lmd+",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramsConfig {
    pub fission: ProgramSpec,
    pub evaporation: ProgramSpec,
    pub list_mode: ListModeFormat,
    /// Excitation energies (MeV) for which a fragment file is written.
    pub fragment_energies_mev: Vec<f64>,
    /// Extra evaporation keywords, appended after the built-in set.
    pub evaporation_keywords: BTreeMap<String, String>,
    pub fission_outputs: Vec<SummarySpec>,
    pub evaporation_outputs: Vec<OutputSpec>,
}

impl Default for ProgramsConfig {
    fn default() -> Self {
        Self {
            fission: ProgramSpec::fission_default(),
            evaporation: ProgramSpec::evaporation_default(),
            list_mode: ListModeFormat::default(),
            fragment_energies_mev: vec![6.0, 7.0],
            evaporation_keywords: BTreeMap::new(),
            fission_outputs: SummarySpec::fission_defaults(),
            evaporation_outputs: OutputSpec::evaporation_defaults(),
        }
    }
}

impl ProgramsConfig {
    pub fn validate(&self) -> Result<(), TmcError> {
        self.fission.validate()?;
        self.evaporation.validate()?;

        if self.fragment_energies_mev.is_empty()
            || self
                .fragment_energies_mev
                .iter()
                .any(|e| !e.is_finite() || *e < 0.0)
        {
            return Err(TmcError::InvalidConfig(
                "fragment_energies_mev must hold at least one finite, non-negative energy"
                    .to_string(),
            ));
        }

        let mut names = HashSet::new();
        for output in &self.fission_outputs {
            output.validate()?;
            if !names.insert(output.name.as_str()) {
                return Err(TmcError::InvalidConfig(format!(
                    "fission output {} is listed twice",
                    output.name
                )));
            }
        }

        let mut prefixes = HashSet::new();
        for output in &self.evaporation_outputs {
            output.validate()?;
            if !prefixes.insert(output.prefix.as_str()) {
                return Err(TmcError::InvalidConfig(format!(
                    "evaporation output prefix {} is listed twice",
                    output.prefix
                )));
            }
        }

        Ok(())
    }
}

/// Top-level campaign file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignFile {
    pub reaction: ReactionConfig,
    pub campaign: CampaignSettings,
    pub concurrency: ConcurrencyConfig,
    pub perturbation: PerturbationConfig,
    pub paths: PathsConfig,
    pub programs: ProgramsConfig,
    pub parameters: Vec<ParameterEntry>,
}

impl CampaignFile {
    pub fn from_toml_file(path: &Path) -> Result<Self, TmcError> {
        let raw = fs::read_to_string(path).map_err(TmcError::io(path))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, TmcError> {
        Ok(toml::from_str(raw)?)
    }

    /// Instances per group: the sample count, or the factor count for max-min.
    pub fn samples_per_group(&self) -> usize {
        match self.campaign.sampling {
            SamplingStrategy::Random => self.campaign.samples,
            SamplingStrategy::MaxMin => self.perturbation.max_min_factors.len(),
        }
    }

    pub fn group_count(&self) -> usize {
        match self.campaign.mode {
            SimulationMode::SingleParameters => self.parameters.len(),
            SimulationMode::Tmc => 1,
        }
    }

    pub fn total_requested(&self) -> usize {
        self.group_count() * self.samples_per_group()
    }

    pub fn max_total_attempts(&self) -> usize {
        self.campaign
            .max_total_attempts
            .unwrap_or_else(|| self.total_requested() * (self.campaign.retries_per_unit + 1))
    }

    pub fn limits(&self) -> ConcurrencyLimits {
        self.concurrency.resolve(available_cores())
    }

    pub fn validate(&self) -> Result<(), TmcError> {
        self.reaction.validate()?;
        self.concurrency.validate()?;
        self.perturbation.validate()?;
        self.programs.validate()?;

        if self.campaign.samples == 0 {
            return Err(TmcError::InvalidConfig(
                "samples must be greater than zero".to_string(),
            ));
        }

        if self.parameters.is_empty() {
            return Err(TmcError::InvalidConfig(
                "at least one parameter must be selected for perturbation".to_string(),
            ));
        }

        // Fragment file ids are lowercased, so names must differ beyond case.
        let mut names = HashSet::new();
        for entry in &self.parameters {
            entry.validate()?;
            if !names.insert(entry.name.to_ascii_lowercase()) {
                return Err(TmcError::InvalidConfig(format!(
                    "parameter {} is listed twice (names are compared without case)",
                    entry.name
                )));
            }
        }

        if self.campaign.sampling == SamplingStrategy::MaxMin {
            if self.campaign.mode != SimulationMode::SingleParameters {
                return Err(TmcError::InvalidConfig(
                    "max_min sampling is only available in single_parameters mode".to_string(),
                ));
            }
            if self.perturbation.max_min_factors.is_empty() {
                return Err(TmcError::InvalidConfig(
                    "max_min sampling needs at least one factor".to_string(),
                ));
            }
        }

        if let Some(max) = self.campaign.max_total_attempts {
            if max < self.total_requested() {
                return Err(TmcError::InvalidConfig(format!(
                    "max_total_attempts ({max}) is below the {} requested instances",
                    self.total_requested()
                )));
            }
        }

        if self.campaign.uneven_batches == UnevenBatchPolicy::Reject {
            let limits = self.limits();
            let (batch, ceiling) = match self.campaign.mode {
                SimulationMode::SingleParameters => {
                    (self.samples_per_group(), limits.repeats_per_parameter)
                }
                SimulationMode::Tmc => (self.samples_per_group(), limits.tmc_workers),
            };
            if batch % ceiling != 0 {
                return Err(TmcError::InvalidConfig(format!(
                    "{batch} samples per group is not a multiple of the worker ceiling {ceiling}"
                )));
            }
        }

        Ok(())
    }
}
