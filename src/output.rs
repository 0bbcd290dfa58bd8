use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use csv::Writer;

use crate::aggregate::{InstanceOutcome, PersistedContainer, SimulationInstance};
use crate::config::ReactionConfig;
use crate::TmcError;

/// `Z92_A236_n_E2.53e-08MeV.json`: one container per reaction and energy.
pub fn container_file_name(reaction: &ReactionConfig) -> String {
    format!("{}.json", reaction.file_stem())
}

pub fn create_timestamped_output_dir(output_root: &Path) -> Result<PathBuf, TmcError> {
    fs::create_dir_all(output_root).map_err(TmcError::io(output_root))?;

    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%SZ").to_string();
    let mut output_dir = output_root.join(&timestamp);
    let mut counter = 1_u32;

    while output_dir.exists() {
        output_dir = output_root.join(format!("{timestamp}-{counter:02}"));
        counter += 1;
    }

    fs::create_dir_all(&output_dir).map_err(TmcError::io(&output_dir))?;
    Ok(output_dir)
}

/// Writes the container into `dir` through a temporary file, so readers
/// never observe a half-written container.
pub fn write_container(dir: &Path, container: &PersistedContainer) -> Result<PathBuf, TmcError> {
    fs::create_dir_all(dir).map_err(TmcError::io(dir))?;
    let path = dir.join(container_file_name(&container.reaction));
    write_container_to(&path, container)?;
    Ok(path)
}

pub fn write_container_to(path: &Path, container: &PersistedContainer) -> Result<(), TmcError> {
    let json = serde_json::to_string_pretty(container)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(TmcError::io(&tmp))?;
    fs::rename(&tmp, path).map_err(TmcError::io(path))
}

pub fn read_container(path: &Path) -> Result<PersistedContainer, TmcError> {
    let raw = fs::read_to_string(path).map_err(TmcError::io(path))?;
    Ok(serde_json::from_str(&raw)?)
}

fn fmt_f64(value: f64) -> String {
    format!("{value:.10}")
}

fn all_instances(container: &PersistedContainer) -> impl Iterator<Item = &SimulationInstance> {
    container
        .baseline
        .iter()
        .chain(container.single_parameters.iter())
        .chain(container.tmc.iter())
}

fn status_of(instance: &SimulationInstance) -> String {
    match &instance.outcome {
        InstanceOutcome::Collected(_) => "collected".to_string(),
        InstanceOutcome::Failed(failure) => format!("failed:{}", failure.kind.as_str()),
    }
}

/// Flattens a container into `parameters.csv` and `scalars.csv`.
pub fn export_csv(container: &PersistedContainer, dir: &Path) -> Result<Vec<PathBuf>, TmcError> {
    fs::create_dir_all(dir).map_err(TmcError::io(dir))?;

    let parameters_path = dir.join("parameters.csv");
    let mut writer = Writer::from_path(&parameters_path)?;
    writer.write_record([
        "instance",
        "label",
        "group",
        "status",
        "parameter",
        "default",
        "random_value",
        "value",
    ])?;
    for instance in all_instances(container) {
        let status = status_of(instance);
        for parameter in &instance.parameters {
            writer.write_record([
                instance.id.to_string(),
                instance.label.clone(),
                instance.group.name().to_string(),
                status.clone(),
                parameter.name.clone(),
                fmt_f64(parameter.default),
                fmt_f64(parameter.random_value),
                fmt_f64(parameter.value),
            ])?;
        }
    }
    writer.flush().map_err(TmcError::io(&parameters_path))?;

    let scalars_path = dir.join("scalars.csv");
    let mut writer = Writer::from_path(&scalars_path)?;
    writer.write_record(["instance", "label", "observable", "value"])?;
    for instance in all_instances(container) {
        let Some(observables) = instance.observables() else {
            continue;
        };
        for (name, value) in observables.scalars() {
            writer.write_record([
                instance.id.to_string(),
                instance.label.clone(),
                name,
                fmt_f64(value),
            ])?;
        }
    }
    writer.flush().map_err(TmcError::io(&scalars_path))?;

    Ok(vec![parameters_path, scalars_path])
}
