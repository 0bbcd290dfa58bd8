//! Parameter descriptors and the generator's parameter source file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PerturbationConfig;
use crate::TmcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistributionKind {
    #[default]
    Uniform,
    Normal,
}

/// One parameter as written in the campaign file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterEntry {
    pub name: String,
    /// Read from the parameter source file when absent.
    pub default: Option<f64>,
    pub distribution: DistributionKind,
    pub width: Option<f64>,
    /// Forces the zero-default rules; inferred from the default when absent.
    pub special_case: Option<bool>,
    pub special_rule: Option<DistributionKind>,
}

impl ParameterEntry {
    pub fn validate(&self) -> Result<(), TmcError> {
        if self.name.is_empty()
            || self.name.contains(char::is_whitespace)
            || self.name.contains(['=', '/', '\\'])
        {
            return Err(TmcError::InvalidConfig(format!(
                "parameter name {:?} must be a single token without '=' or path separators",
                self.name
            )));
        }

        if let Some(default) = self.default {
            if !default.is_finite() {
                return Err(TmcError::InvalidConfig(format!(
                    "parameter {}: default must be finite",
                    self.name
                )));
            }
        }

        if let Some(width) = self.width {
            if !width.is_finite() || width < 0.0 {
                return Err(TmcError::InvalidConfig(format!(
                    "parameter {}: width must be finite and non-negative",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// A tunable model quantity with its perturbation rule, fixed for a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub name: String,
    pub default: f64,
    pub distribution: DistributionKind,
    /// Relative width for ordinary parameters, absolute range or standard
    /// deviation for special-case ones.
    pub width: f64,
    pub special_case: bool,
    pub special_rule: DistributionKind,
}

impl ParameterDescriptor {
    pub fn from_entry(entry: &ParameterEntry, default: f64, config: &PerturbationConfig) -> Self {
        let special_case = entry.special_case.unwrap_or(default == 0.0);
        let special_rule = entry.special_rule.unwrap_or(entry.distribution);
        let width = entry.width.unwrap_or(match (special_case, special_rule, entry.distribution) {
            (true, DistributionKind::Uniform, _) => config.special_uniform_half_range,
            (true, DistributionKind::Normal, _) => config.special_st_dev,
            (false, _, DistributionKind::Uniform) => config.uniform_width,
            (false, _, DistributionKind::Normal) => config.normal_relative_st_dev,
        });

        Self {
            name: entry.name.clone(),
            default,
            distribution: entry.distribution,
            width,
            special_case,
            special_rule,
        }
    }

    /// The distribution actually sampled.
    pub fn effective_distribution(&self) -> DistributionKind {
        if self.special_case {
            self.special_rule
        } else {
            self.distribution
        }
    }
}

/// Builds descriptors for every entry, filling missing defaults from
/// `defaults_file`.
pub fn resolve_descriptors(
    entries: &[ParameterEntry],
    config: &PerturbationConfig,
    defaults_file: Option<&Path>,
) -> Result<Vec<ParameterDescriptor>, TmcError> {
    let needs_file = entries.iter().any(|entry| entry.default.is_none());
    let file_defaults = match (needs_file, defaults_file) {
        (false, _) => BTreeMap::new(),
        (true, Some(path)) => read_parameter_defaults(path)?,
        (true, None) => {
            return Err(TmcError::InvalidConfig(
                "parameters without a default need paths.parameter_defaults".to_string(),
            ))
        }
    };

    entries
        .iter()
        .map(|entry| {
            let default = match entry.default {
                Some(value) => value,
                None => *file_defaults.get(&entry.name).ok_or_else(|| {
                    TmcError::InvalidConfig(format!(
                        "parameter {} has no default in the parameter source file",
                        entry.name
                    ))
                })?,
            };
            Ok(ParameterDescriptor::from_entry(entry, default, config))
        })
        .collect()
}

/// Reads `name = value` assignments; `'` starts a comment.
pub fn read_parameter_defaults(path: &Path) -> Result<BTreeMap<String, f64>, TmcError> {
    let raw = fs::read_to_string(path).map_err(TmcError::io(path))?;
    let mut defaults = BTreeMap::new();

    for (idx, line) in raw.lines().enumerate() {
        let code = line.split('\'').next().unwrap_or_default();
        let tokens: Vec<&str> = code.split_whitespace().collect();
        if tokens.len() < 3 || tokens[1] != "=" {
            continue;
        }
        match tokens[2].parse::<f64>() {
            Ok(value) => {
                defaults.entry(tokens[0].to_string()).or_insert(value);
            }
            Err(_) => debug!(line = idx + 1, name = tokens[0], "skipping non-numeric assignment"),
        }
    }

    Ok(defaults)
}
