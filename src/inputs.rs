//! File-based input contracts of the two external programs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{float_repr, ListModeFormat, ReactionConfig};
use crate::perturb::PerturbedValue;
use crate::TmcError;

pub const FISSION_PARAMETER_FILE: &str = "MyParameters.dat";
pub const FISSION_CONTROL_FILE: &str = "file.in";

/// Writes the generator's control file, reaction input and parameter
/// overrides into `dir`, returning the list-mode file the run must produce.
pub fn write_fission_inputs(
    dir: &Path,
    reaction: &ReactionConfig,
    list_mode: ListModeFormat,
    parameters: &[PerturbedValue],
) -> Result<PathBuf, TmcError> {
    let option = reaction.particle.generator_option();
    let input_name = format!(
        "{}{}{}.in",
        reaction.element_symbol()?,
        reaction.target_a(),
        option
    );

    let mut overrides = String::new();
    for parameter in parameters {
        overrides.push_str(&format!("{} = {}\n", parameter.name, float_repr(parameter.value)));
    }
    write(&dir.join(FISSION_PARAMETER_FILE), &overrides)?;

    write(
        &dir.join(FISSION_CONTROL_FILE),
        &format!("\"in/{input_name}\"\nEND"),
    )?;

    let in_dir = dir.join("in");
    let out_dir = dir.join("out");
    for sub in [&in_dir, &out_dir] {
        fs::create_dir_all(sub).map_err(TmcError::io(sub))?;
    }

    let body = format!(
        "{}\n{}\nOptions(global,MyParameters,{})\n{}, {}, \"{}\"\nEND",
        reaction.event_multiplier(),
        reaction.energy_input(),
        list_mode.generator_option(),
        reaction.target_z,
        reaction.compound_a,
        option
    );
    write(&in_dir.join(input_name), &body)?;

    Ok(list_mode_path(dir, reaction))
}

pub fn list_mode_path(dir: &Path, reaction: &ReactionConfig) -> PathBuf {
    dir.join("out").join(format!("{}.lmd", reaction.file_stem()))
}

/// Built-in evaporation keywords, in the order they are written.
pub fn evaporation_keywords(reaction: &ReactionConfig) -> Result<Vec<(String, String)>, TmcError> {
    let fixed = [
        ("projectile", reaction.particle.tag().to_string()),
        ("element", reaction.element_symbol()?.to_string()),
        ("mass", reaction.target_a().to_string()),
        ("energy", reaction.energy_input()),
        ("fission", "y".to_string()),
        ("ejectiles", "g n".to_string()),
        ("massdis", "y".to_string()),
        ("fymodel", "4".to_string()),
        ("ffmodel", "1".to_string()),
        ("elow", "0.000001".to_string()),
        ("Rfiseps", "0.000000001".to_string()),
        ("outspectra", "y".to_string()),
        ("bins", "100".to_string()),
        ("channels", "n".to_string()),
        ("maxchannel", "8".to_string()),
        ("Rspincutff", "4".to_string()),
        ("Rspincut", "0.4".to_string()),
    ];
    Ok(fixed
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect())
}

/// Writes `<label>_input.in`. Overrides replace built-in keywords of the same
/// name and are otherwise appended; the fragment file id always comes last.
pub fn write_evaporation_input(
    dir: &Path,
    label: &str,
    reaction: &ReactionConfig,
    overrides: &BTreeMap<String, String>,
) -> Result<PathBuf, TmcError> {
    let mut keywords = evaporation_keywords(reaction)?;
    for (key, value) in overrides {
        match keywords.iter_mut().find(|(existing, _)| existing == key) {
            Some(slot) => slot.1 = value.clone(),
            None => keywords.push((key.clone(), value.clone())),
        }
    }

    let mut body = String::new();
    for (key, value) in &keywords {
        body.push_str(&format!("{key} {value}\n"));
    }
    body.push_str(&format!("geffissionfileid {label}"));

    let path = dir.join(format!("{label}_input.in"));
    write(&path, &body)?;
    Ok(path)
}

fn write(path: &Path, contents: &str) -> Result<(), TmcError> {
    fs::write(path, contents).map_err(TmcError::io(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fission_inputs_follow_the_generator_layout() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let reaction = ReactionConfig {
            fission_events: 300_000,
            ..Default::default()
        };
        let params = vec![PerturbedValue {
            name: "Emax_valley".to_string(),
            default: 10.0,
            random_value: 10.25,
            value: 10.25,
        }];

        let lmd = write_fission_inputs(tmp.path(), &reaction, ListModeFormat::Plain, &params)
            .expect("write");
        assert_eq!(lmd, tmp.path().join("out/Z92_A236_n_E2.53e-08MeV.lmd"));

        let control = fs::read_to_string(tmp.path().join("file.in")).expect("read");
        assert_eq!(control, "\"in/U235EN.in\"\nEND");

        let input = fs::read_to_string(tmp.path().join("in/U235EN.in")).expect("read");
        assert_eq!(
            input,
            "3\n2.53e-08\nOptions(global,MyParameters,lmd)\n92, 236, \"EN\"\nEND"
        );

        let overrides = fs::read_to_string(tmp.path().join("MyParameters.dat")).expect("read");
        assert_eq!(overrides, "Emax_valley = 10.25\n");
    }

    #[test]
    fn baseline_run_gets_an_empty_parameter_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_fission_inputs(tmp.path(), &ReactionConfig::default(), ListModeFormat::Plain, &[])
            .expect("write");
        let overrides = fs::read_to_string(tmp.path().join("MyParameters.dat")).expect("read");
        assert!(overrides.is_empty());
    }

    #[test]
    fn extended_list_mode_is_requested_in_the_options_line() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_fission_inputs(tmp.path(), &ReactionConfig::default(), ListModeFormat::Extended, &[])
            .expect("write");
        let input = fs::read_to_string(tmp.path().join("in/U235EN.in")).expect("read");
        assert!(input.contains("Options(global,MyParameters,lmd+)"), "{input}");
    }

    #[test]
    fn evaporation_input_carries_keywords_and_file_id() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let reaction = ReactionConfig {
            target_z: 94,
            compound_a: 240,
            incident_energy_mev: 1.0,
            ..Default::default()
        };
        let mut overrides = BTreeMap::new();
        overrides.insert("bins".to_string(), "60".to_string());
        overrides.insert("best".to_string(), "y".to_string());

        let path = write_evaporation_input(tmp.path(), "TMC_4", &reaction, &overrides)
            .expect("write");
        assert_eq!(path, tmp.path().join("TMC_4_input.in"));

        let body = fs::read_to_string(path).expect("read");
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines[0], "projectile n");
        assert_eq!(lines[1], "element Pu");
        assert_eq!(lines[2], "mass 239");
        assert_eq!(lines[3], "energy 1.0");
        assert!(lines.contains(&"bins 60"));
        assert!(!lines.contains(&"bins 100"));
        assert_eq!(lines[lines.len() - 2], "best y");
        assert_eq!(lines[lines.len() - 1], "geffissionfileid TMC_4");
    }
}
