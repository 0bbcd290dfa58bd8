//! Fission-fragment chain between the two programs: list-mode events from
//! the generator are reduced to a fragment yield table and written as the
//! evaporation code's fission-fragment files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{format_sci, ReactionConfig};
use crate::TmcError;

/// Minimum whitespace-separated columns of one list-mode event line.
pub const LIST_MODE_COLUMNS: usize = 23;

/// Upper bound on charge and mass numbers read from list-mode events.
pub const MAX_NUCLEON_NUMBER: u32 = 512;

const COL_Z1: usize = 2;
const COL_Z2: usize = 3;
const COL_A1: usize = 4;
const COL_A2: usize = 5;
const COL_EXC1: usize = 18;
const COL_EXC2: usize = 19;
const COL_TKE: usize = 22;

/// Emission line tags of the extended (`lmd+`) list-mode layout: prompt
/// neutrons of the light and heavy fragment, then three gamma components
/// per fragment.
const TAG_NEUTRON_LIGHT: usize = 1;
const TAG_NEUTRON_HEAVY: usize = 2;
const TAGS_GAMMA_LIGHT: [usize; 3] = [3, 4, 5];
const TAGS_GAMMA_HEAVY: [usize; 3] = [6, 7, 8];
const EMISSION_TAGS: usize = 8;

/// Neutron emission lines hold four fields per neutron, energy first.
const NEUTRON_FIELDS: usize = 4;

/// Summed prompt emission energies (MeV) of one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EmissionEnergies {
    pub neutron_light: f64,
    pub neutron_heavy: f64,
    pub gamma_light: f64,
    pub gamma_heavy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FissionEvent {
    pub z1: u32,
    pub z2: u32,
    pub a1: u32,
    pub a2: u32,
    pub excitation1: f64,
    pub excitation2: f64,
    pub tke: f64,
    /// Present when the file uses the extended layout.
    pub emission: Option<EmissionEnergies>,
}

/// Tag of an emission line: a lone digit 1-8 in front of the values.
fn emission_tag(line: &str) -> Option<usize> {
    let mut chars = line.chars();
    let tag = chars.next()?.to_digit(10)? as usize;
    let lone = chars.next().map_or(true, char::is_whitespace);
    ((1..=EMISSION_TAGS).contains(&tag) && lone).then_some(tag)
}

fn parse_energy(path: &Path, line_no: usize, token: &str) -> Result<f64, TmcError> {
    token
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| TmcError::malformed(path, line_no, format!("{token:?} is not an energy")))
}

/// Sum of the energies on one emission line.
fn emission_sum(path: &Path, line_no: usize, tag: usize, values: &str) -> Result<f64, TmcError> {
    let tokens: Vec<&str> = values.split_whitespace().collect();
    if tag <= TAG_NEUTRON_HEAVY {
        tokens
            .iter()
            .step_by(NEUTRON_FIELDS)
            .map(|t| parse_energy(path, line_no, t))
            .sum()
    } else {
        tokens
            .iter()
            .filter(|t| t.starts_with(|c: char| c.is_ascii_digit()))
            .map(|t| parse_energy(path, line_no, t))
            .sum()
    }
}

/// Reads plain (`lmd`) and extended (`lmd+`) list-mode files.
///
/// In the extended layout the n-th emission line of each tag belongs to the
/// n-th event; events without a line for some tag emit nothing there.
pub fn parse_list_mode(path: &Path) -> Result<Vec<FissionEvent>, TmcError> {
    let raw = fs::read_to_string(path).map_err(TmcError::io(path))?;
    let mut events = Vec::new();
    let mut emission_lines: [Vec<(usize, &str)>; EMISSION_TAGS] = Default::default();

    for (idx, line) in raw.lines().enumerate() {
        let line_no = idx + 1;
        let data = line.split('*').next().unwrap_or_default().trim();
        if data.is_empty() {
            continue;
        }
        if let Some(tag) = emission_tag(data) {
            emission_lines[tag - 1].push((line_no, &data[1..]));
            continue;
        }

        let tokens: Vec<&str> = data.split_whitespace().collect();
        if tokens.len() < LIST_MODE_COLUMNS {
            return Err(TmcError::malformed(
                path,
                line_no,
                format!(
                    "expected at least {LIST_MODE_COLUMNS} columns, found {}",
                    tokens.len()
                ),
            ));
        }

        let number = |col: usize| -> Result<f64, TmcError> {
            tokens[col]
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| {
                    TmcError::malformed(path, line_no, format!("column {col} is not a number"))
                })
        };
        let count = |col: usize| -> Result<u32, TmcError> {
            let value = number(col)?;
            if value < 0.0 || value.fract() != 0.0 || value > f64::from(MAX_NUCLEON_NUMBER) {
                return Err(TmcError::malformed(
                    path,
                    line_no,
                    format!("column {col} is not an integer between 0 and {MAX_NUCLEON_NUMBER}"),
                ));
            }
            Ok(value as u32)
        };

        events.push(FissionEvent {
            z1: count(COL_Z1)?,
            z2: count(COL_Z2)?,
            a1: count(COL_A1)?,
            a2: count(COL_A2)?,
            excitation1: number(COL_EXC1)?,
            excitation2: number(COL_EXC2)?,
            tke: number(COL_TKE)?,
            emission: None,
        });
    }

    if events.is_empty() {
        return Err(TmcError::malformed(path, 0, "list-mode file holds no events"));
    }
    if emission_lines.iter().any(|lines| !lines.is_empty()) {
        attach_emissions(path, &mut events, &emission_lines)?;
    }
    Ok(events)
}

fn attach_emissions(
    path: &Path,
    events: &mut [FissionEvent],
    emission_lines: &[Vec<(usize, &str)>; EMISSION_TAGS],
) -> Result<(), TmcError> {
    let mut sums = vec![EmissionEnergies::default(); events.len()];

    for (slot, lines) in emission_lines.iter().enumerate() {
        let tag = slot + 1;
        if let Some(&(line_no, _)) = lines.get(events.len()) {
            return Err(TmcError::malformed(
                path,
                line_no,
                format!("more emission lines tagged {tag} than events"),
            ));
        }
        for (emission, &(line_no, values)) in sums.iter_mut().zip(lines) {
            let sum = emission_sum(path, line_no, tag, values)?;
            match tag {
                TAG_NEUTRON_LIGHT => emission.neutron_light += sum,
                TAG_NEUTRON_HEAVY => emission.neutron_heavy += sum,
                t if TAGS_GAMMA_LIGHT.contains(&t) => emission.gamma_light += sum,
                t if TAGS_GAMMA_HEAVY.contains(&t) => emission.gamma_heavy += sum,
                _ => {}
            }
        }
    }

    for (event, emission) in events.iter_mut().zip(sums) {
        event.emission = Some(emission);
    }
    Ok(())
}

/// Per-pair mean and sample standard deviation of the prompt emission
/// energies (MeV), from extended list-mode files only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmissionYield {
    pub neutron_light: f64,
    pub neutron_light_std: f64,
    pub neutron_heavy: f64,
    pub neutron_heavy_std: f64,
    pub gamma_light: f64,
    pub gamma_light_std: f64,
    pub gamma_heavy: f64,
    pub gamma_heavy_std: f64,
}

/// One fragment pair, light fragment first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentYield {
    pub z_light: u32,
    pub a_light: u32,
    pub z_heavy: u32,
    pub a_heavy: u32,
    pub yield_fraction: f64,
    pub tke: f64,
    pub txe: f64,
    pub e_light: f64,
    pub w_light: f64,
    pub e_heavy: f64,
    pub w_heavy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emission: Option<EmissionYield>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldTable {
    pub rows: Vec<FragmentYield>,
    pub total_events: usize,
    /// Events whose fragment masses do not add up to the compound nucleus.
    pub multichance_events: usize,
    /// Events of fragment pairs seen only once.
    pub ignored_events: usize,
}

impl YieldTable {
    pub fn mean_tke(&self) -> f64 {
        self.rows.iter().map(|r| r.yield_fraction * r.tke).sum()
    }

    pub fn mean_txe(&self) -> f64 {
        self.rows.iter().map(|r| r.yield_fraction * r.txe).sum()
    }

    /// Yield-weighted emission energies; `None` unless every pair carries them.
    pub fn mean_emission(&self) -> Option<EmissionEnergies> {
        let mut total = EmissionEnergies::default();
        for row in &self.rows {
            let emission = row.emission?;
            total.neutron_light += row.yield_fraction * emission.neutron_light;
            total.neutron_heavy += row.yield_fraction * emission.neutron_heavy;
            total.gamma_light += row.yield_fraction * emission.gamma_light;
            total.gamma_heavy += row.yield_fraction * emission.gamma_heavy;
        }
        (!self.rows.is_empty()).then_some(total)
    }
}

#[derive(Default)]
struct PairAccumulator {
    tke: Vec<f64>,
    light: Vec<f64>,
    heavy: Vec<f64>,
    emission: Vec<EmissionEnergies>,
}

impl PairAccumulator {
    fn emission_yield(&self) -> Option<EmissionYield> {
        if self.emission.len() != self.tke.len() {
            return None;
        }
        let column = |pick: fn(&EmissionEnergies) -> f64| -> Vec<f64> {
            self.emission.iter().map(pick).collect()
        };
        let neutron_light = column(|e| e.neutron_light);
        let neutron_heavy = column(|e| e.neutron_heavy);
        let gamma_light = column(|e| e.gamma_light);
        let gamma_heavy = column(|e| e.gamma_heavy);
        Some(EmissionYield {
            neutron_light: mean(&neutron_light),
            neutron_light_std: sample_std(&neutron_light),
            neutron_heavy: mean(&neutron_heavy),
            neutron_heavy_std: sample_std(&neutron_heavy),
            gamma_light: mean(&gamma_light),
            gamma_light_std: sample_std(&gamma_light),
            gamma_heavy: mean(&gamma_heavy),
            gamma_heavy_std: sample_std(&gamma_heavy),
        })
    }
}

/// Groups events into fragment pairs. Returns `None` when no pair occurs
/// more than once.
///
/// Emission energies are already split by light and heavy fragment, so they
/// are not swapped together with the fragments.
pub fn reduce_events(events: &[FissionEvent], compound_a: u32) -> Option<YieldTable> {
    let mut groups: BTreeMap<(u32, u32, u32, u32), PairAccumulator> = BTreeMap::new();
    let mut multichance_events = 0;

    for event in events {
        if event.a1.checked_add(event.a2) != Some(compound_a) {
            multichance_events += 1;
            continue;
        }
        let (light, heavy) = if event.a1 > event.a2 {
            ((event.z2, event.a2, event.excitation2), (event.z1, event.a1, event.excitation1))
        } else {
            ((event.z1, event.a1, event.excitation1), (event.z2, event.a2, event.excitation2))
        };
        let group = groups.entry((light.0, light.1, heavy.0, heavy.1)).or_default();
        group.tke.push(event.tke);
        group.light.push(light.2);
        group.heavy.push(heavy.2);
        if let Some(emission) = event.emission {
            group.emission.push(emission);
        }
    }

    let ignored_events = groups.values().filter(|g| g.tke.len() == 1).count();
    let kept_events: usize = groups
        .values()
        .map(|g| g.tke.len())
        .filter(|&n| n > 1)
        .sum();
    if kept_events == 0 {
        return None;
    }

    let rows = groups
        .into_iter()
        .filter(|(_, g)| g.tke.len() > 1)
        .map(|((z_light, a_light, z_heavy, a_heavy), g)| {
            let txe: Vec<f64> = g.light.iter().zip(&g.heavy).map(|(l, h)| l + h).collect();
            FragmentYield {
                z_light,
                a_light,
                z_heavy,
                a_heavy,
                yield_fraction: g.tke.len() as f64 / kept_events as f64,
                tke: mean(&g.tke),
                txe: mean(&txe),
                e_light: mean(&g.light),
                w_light: sample_std(&g.light),
                e_heavy: mean(&g.heavy),
                w_heavy: sample_std(&g.heavy),
                emission: g.emission_yield(),
            }
        })
        .collect();

    Some(YieldTable {
        rows,
        total_events: events.len(),
        multichance_events,
        ignored_events,
    })
}

/// Parses and reduces the list-mode output of one generator run.
pub fn read_yield_table(path: &Path, compound_a: u32) -> Result<YieldTable, TmcError> {
    let events = parse_list_mode(path)?;
    reduce_events(&events, compound_a)
        .ok_or_else(|| TmcError::malformed(path, 0, "no fragment pair occurs more than once"))
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> f64 {
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// The label is lowercased to match the file id the evaporation code looks up.
pub fn fragment_file_name(reaction: &ReactionConfig, energy_mev: f64, label: &str) -> Result<String, TmcError> {
    Ok(format!(
        "{}{}_{}MeV_gef_{}.ff",
        reaction.element_symbol()?,
        reaction.compound_a,
        format_sci(energy_mev, 2),
        label.to_lowercase()
    ))
}

/// Writes one fragment file per energy into `dir`.
pub fn write_fragment_files(
    dir: &Path,
    table: &YieldTable,
    reaction: &ReactionConfig,
    label: &str,
    energies_mev: &[f64],
) -> Result<Vec<PathBuf>, TmcError> {
    let mut body = String::new();
    body.push_str(&format!("# Z        =   {:>3}\n", reaction.target_z));
    body.push_str(&format!("# A        =   {:>3}\n", reaction.compound_a));
    body.push_str(&format!(
        "# Ex (MeV) =   {:>3}\n",
        format_sci(reaction.incident_energy_mev, 2)
    ));
    body.push_str(&format!("# Ntotal   =   {:>3}\n", table.rows.len()));
    body.push_str(
        "# Zl  Al   Zh  Ah   Yield       TKE[MeV]    TXE[MeV]    El[MeV]     Wl[MeV]     Eh[MeV]     Wh[MeV]\n",
    );
    for row in &table.rows {
        body.push_str(&format!(
            "{:>4} {:>3} {:>4} {:>4}  {}  {}  {}  {}  {}  {}  {}\n",
            row.z_light,
            row.a_light,
            row.z_heavy,
            row.a_heavy,
            format_sci(row.yield_fraction, 4),
            format_sci(row.tke, 4),
            format_sci(row.txe, 4),
            format_sci(row.e_light, 4),
            format_sci(row.w_light, 4),
            format_sci(row.e_heavy, 4),
            format_sci(row.w_heavy, 4),
        ));
    }

    let mut written = Vec::with_capacity(energies_mev.len());
    for &energy in energies_mev {
        let path = dir.join(fragment_file_name(reaction, energy, label)?);
        fs::write(&path, &body).map_err(TmcError::io(&path))?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_line(z1: u32, z2: u32, a1: u32, a2: u32, e1: f64, e2: f64, tke: f64) -> String {
        let mut cols = vec!["0".to_string(); LIST_MODE_COLUMNS];
        cols[COL_Z1] = z1.to_string();
        cols[COL_Z2] = z2.to_string();
        cols[COL_A1] = a1.to_string();
        cols[COL_A2] = a2.to_string();
        cols[COL_EXC1] = e1.to_string();
        cols[COL_EXC2] = e2.to_string();
        cols[COL_TKE] = tke.to_string();
        cols.join(" ")
    }

    fn event(z1: u32, z2: u32, a1: u32, a2: u32, e1: f64, e2: f64, tke: f64) -> FissionEvent {
        FissionEvent {
            z1,
            z2,
            a1,
            a2,
            excitation1: e1,
            excitation2: e2,
            tke,
            emission: None,
        }
    }

    #[test]
    fn reduction_orders_groups_and_drops_singletons() {
        let events = vec![
            event(38, 54, 96, 140, 10.0, 12.0, 170.0),
            event(54, 38, 140, 96, 14.0, 8.0, 172.0),
            event(40, 52, 100, 136, 9.0, 11.0, 168.0),
            event(36, 56, 90, 145, 9.0, 11.0, 168.0),
            event(38, 54, 96, 140, 12.0, 10.0, 174.0),
            event(40, 52, 100, 136, 11.0, 13.0, 166.0),
            event(35, 57, 89, 147, 7.0, 7.0, 160.0),
        ];

        let table = reduce_events(&events, 236).expect("pairs found");
        assert_eq!(table.total_events, 7);
        assert_eq!(table.multichance_events, 1);
        assert_eq!(table.ignored_events, 1);
        assert_eq!(table.rows.len(), 2);

        let sr = &table.rows[0];
        assert_eq!((sr.z_light, sr.a_light, sr.z_heavy, sr.a_heavy), (38, 96, 54, 140));
        assert!((sr.yield_fraction - 0.6).abs() < 1e-12);
        assert!((sr.tke - 172.0).abs() < 1e-12);
        assert!((sr.e_light - 10.0).abs() < 1e-12);
        assert!((sr.w_light - 2.0).abs() < 1e-12);
        assert!((sr.e_heavy - 12.0).abs() < 1e-12);
        assert!((sr.txe - 22.0).abs() < 1e-12);

        let total: f64 = table.rows.iter().map(|r| r.yield_fraction).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!((table.mean_tke() - (0.6 * 172.0 + 0.4 * 167.0)).abs() < 1e-9);
    }

    #[test]
    fn all_singletons_yield_nothing() {
        let events = vec![
            event(38, 54, 96, 140, 10.0, 12.0, 170.0),
            event(40, 52, 100, 136, 9.0, 11.0, 168.0),
        ];
        assert!(reduce_events(&events, 236).is_none());
    }

    #[test]
    fn parses_list_mode_with_comments() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("Z92_A236_n_E2.53e-08MeV.lmd");
        let body = format!(
            "* list-mode header\n{}\n\n{} * trailing comment\n",
            event_line(38, 54, 96, 140, 10.5, 12.5, 170.25),
            event_line(54, 38, 140, 96, 14.0, 8.0, 172.0),
        );
        fs::write(&path, body).expect("write");

        let events = parse_list_mode(&path).expect("parse");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].a2, 140);
        assert_eq!(events[0].tke, 170.25);
    }

    #[test]
    fn short_rows_and_empty_files_are_malformed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("short.lmd");
        fs::write(&path, format!("{}\n92 236 3\n", event_line(38, 54, 96, 140, 1.0, 1.0, 1.0)))
            .expect("write");
        match parse_list_mode(&path) {
            Err(TmcError::MalformedOutput { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed output, got {other:?}"),
        }

        let empty = tmp.path().join("empty.lmd");
        fs::write(&empty, "* only a header\n").expect("write");
        assert!(matches!(
            parse_list_mode(&empty),
            Err(TmcError::MalformedOutput { .. })
        ));
    }

    #[test]
    fn out_of_range_mass_numbers_are_malformed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("huge.lmd");
        let body = format!(
            "{}\n{}\n",
            event_line(38, 54, 96, 140, 1.0, 1.0, 1.0),
            event_line(38, 54, u32::MAX, 140, 10.0, 12.0, 170.0)
        );
        fs::write(&path, body).expect("write");

        match read_yield_table(&path, 236) {
            Err(TmcError::MalformedOutput { line, reason, .. }) => {
                assert_eq!(line, 2);
                assert!(reason.contains("column 4"), "{reason}");
            }
            other => panic!("expected malformed output, got {other:?}"),
        }
    }

    #[test]
    fn overflowing_mass_sum_counts_as_multichance() {
        let events = vec![
            event(38, 54, u32::MAX, 140, 10.0, 12.0, 170.0),
            event(38, 54, 96, 140, 10.0, 12.0, 170.0),
            event(38, 54, 96, 140, 12.0, 10.0, 174.0),
        ];
        let table = reduce_events(&events, 236).expect("pairs found");
        assert_eq!(table.multichance_events, 1);
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn extended_list_mode_carries_emission_energies() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("Z92_A236_n_E2.53e-08MeV.lmd");
        let body = format!(
            "* lmd+ output\n{}\n{}\n\
             1 1.5 0.1 0.2 0.3 0.5 0.1 0.2 0.3\n\
             1 1.0 0.1 0.2 0.3\n\
             2 2.0 0.1 0.2 0.3\n\
             2 3.0 0.1 0.2 0.3\n\
             3 0.25 n 0.25\n\
             4 1.0\n\
             7 0.5 0.5\n\
             7 1.5\n",
            event_line(38, 54, 96, 140, 10.0, 12.0, 170.0),
            event_line(54, 38, 140, 96, 14.0, 8.0, 172.0),
        );
        fs::write(&path, body).expect("write");

        let events = parse_list_mode(&path).expect("parse");
        assert_eq!(events.len(), 2);
        let first = events[0].emission.expect("emission");
        assert_eq!(first.neutron_light, 2.0);
        assert_eq!(first.neutron_heavy, 2.0);
        assert_eq!(first.gamma_light, 1.5);
        assert_eq!(first.gamma_heavy, 1.0);
        let second = events[1].emission.expect("emission");
        assert_eq!(second.neutron_light, 1.0);
        assert_eq!(second.neutron_heavy, 3.0);
        assert_eq!(second.gamma_light, 0.0);
        assert_eq!(second.gamma_heavy, 1.5);

        let table = reduce_events(&events, 236).expect("pairs found");
        let row = &table.rows[0];
        assert!((row.e_light - 9.0).abs() < 1e-12);
        let emission = row.emission.expect("emission yield");
        assert!((emission.neutron_light - 1.5).abs() < 1e-12);
        assert!((emission.neutron_heavy - 2.5).abs() < 1e-12);
        assert!((emission.neutron_heavy_std - 0.5f64.sqrt()).abs() < 1e-12);
        assert!((emission.gamma_heavy - 1.25).abs() < 1e-12);

        let mean = table.mean_emission().expect("mean emission");
        assert!((mean.gamma_light - 0.75).abs() < 1e-12);
    }

    #[test]
    fn plain_list_mode_has_no_emission() {
        let events = vec![
            event(38, 54, 96, 140, 10.0, 12.0, 170.0),
            event(38, 54, 96, 140, 12.0, 10.0, 174.0),
        ];
        let table = reduce_events(&events, 236).expect("pairs found");
        assert!(table.rows[0].emission.is_none());
        assert!(table.mean_emission().is_none());
    }

    #[test]
    fn surplus_emission_lines_are_malformed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("surplus.lmd");
        let body = format!(
            "{}\n1 1.0 0 0 0\n1 2.0 0 0 0\n",
            event_line(38, 54, 96, 140, 10.0, 12.0, 170.0)
        );
        fs::write(&path, body).expect("write");
        match parse_list_mode(&path) {
            Err(TmcError::MalformedOutput { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected malformed output, got {other:?}"),
        }
    }

    #[test]
    fn fragment_files_use_the_evaporation_layout() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let table = YieldTable {
            rows: vec![FragmentYield {
                z_light: 38,
                a_light: 96,
                z_heavy: 54,
                a_heavy: 140,
                yield_fraction: 0.0123,
                tke: 170.0,
                txe: 22.0,
                e_light: 10.0,
                w_light: 2.0,
                e_heavy: 12.0,
                w_heavy: 2.0,
                emission: None,
            }],
            total_events: 2,
            multichance_events: 0,
            ignored_events: 0,
        };

        let written = write_fragment_files(
            tmp.path(),
            &table,
            &ReactionConfig::default(),
            "TMC_7",
            &[6.0, 7.0],
        )
        .expect("write");
        assert_eq!(written.len(), 2);
        assert!(written[0].ends_with("U236_6.00e+00MeV_gef_tmc_7.ff"));
        assert!(written[1].ends_with("U236_7.00e+00MeV_gef_tmc_7.ff"));

        let body = fs::read_to_string(&written[0]).expect("read");
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines[0], "# Z        =    92");
        assert_eq!(lines[2], "# Ex (MeV) =   2.53e-08");
        assert_eq!(lines[3], "# Ntotal   =     1");
        assert_eq!(
            lines[5],
            "  38  96   54  140  1.2300e-02  1.7000e+02  2.2000e+01  1.0000e+01  2.0000e+00  1.2000e+01  2.0000e+00"
        );
    }
}
