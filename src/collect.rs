//! Result Collector: turns the programs' output files into named numeric
//! values and tables.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ReactionConfig;
use crate::fragments::{EmissionEnergies, FragmentYield, YieldTable};
use crate::TmcError;

/// Scalar read from a fixed header position (zero-based line and token).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderScalar {
    pub name: String,
    pub line: usize,
    pub token: usize,
}

/// One evaporation output file, found by name prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSpec {
    pub prefix: String,
    pub scalars: Vec<HeaderScalar>,
    /// Parse the `#`-commented numeric body.
    pub table: bool,
    /// Column subset of the table; all columns when absent.
    pub columns: Option<Vec<usize>>,
    pub required: bool,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            scalars: Vec::new(),
            table: true,
            columns: None,
            required: true,
        }
    }
}

fn scalar(name: &str, line: usize, token: usize) -> HeaderScalar {
    HeaderScalar {
        name: name.to_string(),
        line,
        token,
    }
}

impl OutputSpec {
    pub fn evaporation_defaults() -> Vec<Self> {
        vec![
            Self {
                prefix: "EavA".to_string(),
                ..Default::default()
            },
            Self {
                prefix: "nugA".to_string(),
                scalars: vec![scalar("nubar_prompt", 2, 5)],
                ..Default::default()
            },
            Self {
                prefix: "nunA".to_string(),
                scalars: vec![scalar("nubar_prompt", 2, 5)],
                ..Default::default()
            },
            Self {
                prefix: "pfgs".to_string(),
                scalars: vec![scalar("mean_energy_mev", 3, 3)],
                columns: Some(vec![0, 1]),
                ..Default::default()
            },
            Self {
                prefix: "pfns".to_string(),
                scalars: vec![scalar("mean_energy_mev", 3, 3)],
                columns: Some(vec![0, 1, 2]),
                ..Default::default()
            },
            Self {
                prefix: "Pnug".to_string(),
                scalars: vec![scalar("nubar_prompt", 2, 5)],
                table: false,
                ..Default::default()
            },
            Self {
                prefix: "Pnun".to_string(),
                scalars: vec![scalar("nubar_prompt", 2, 5)],
                ..Default::default()
            },
            Self {
                prefix: "yieldA".to_string(),
                scalars: vec![scalar("nuclides", 2, 4)],
                columns: Some(vec![0, 1, 2]),
                ..Default::default()
            },
        ]
    }

    pub fn validate(&self) -> Result<(), TmcError> {
        if self.prefix.is_empty() || self.prefix.contains(['/', '\\']) {
            return Err(TmcError::InvalidConfig(format!(
                "output prefix {:?} must be a plain file name prefix",
                self.prefix
            )));
        }
        if !self.table && self.scalars.is_empty() {
            return Err(TmcError::InvalidConfig(format!(
                "output {} reads neither scalars nor a table",
                self.prefix
            )));
        }
        if matches!(&self.columns, Some(cols) if cols.is_empty()) {
            return Err(TmcError::InvalidConfig(format!(
                "output {} selects no columns",
                self.prefix
            )));
        }
        Ok(())
    }
}

/// Scalar read `offset` lines away from the first line matching `anchor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchoredScalar {
    pub name: String,
    pub anchor: String,
    #[serde(default)]
    pub offset: isize,
    pub token: usize,
}

/// Numeric rows from `start` (plus `start_offset`) up to, not including,
/// `end` (plus `end_offset`). Rows may differ in width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchoredBlock {
    pub name: String,
    pub start: String,
    #[serde(default)]
    pub start_offset: isize,
    pub end: String,
    #[serde(default)]
    pub end_offset: isize,
}

/// One summary file of the fission-fragment generator, found by prefix and
/// suffix in `dir` below its working directory. `{stem}` in `dir` expands
/// to the reaction file stem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarySpec {
    pub name: String,
    pub dir: String,
    pub prefix: String,
    pub suffix: String,
    pub scalars: Vec<AnchoredScalar>,
    pub blocks: Vec<AnchoredBlock>,
    pub required: bool,
}

impl Default for SummarySpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            dir: "out".to_string(),
            prefix: String::new(),
            suffix: String::new(),
            scalars: Vec::new(),
            blocks: Vec::new(),
            required: true,
        }
    }
}

fn anchored(name: &str, anchor: &str, offset: isize, token: usize) -> AnchoredScalar {
    AnchoredScalar {
        name: name.to_string(),
        anchor: anchor.to_string(),
        offset,
        token,
    }
}

fn block(name: &str, start: (&str, isize), end: (&str, isize)) -> AnchoredBlock {
    AnchoredBlock {
        name: name.to_string(),
        start: start.0.to_string(),
        start_offset: start.1,
        end: end.0.to_string(),
        end_offset: end.1,
    }
}

const GAMMA_BY_MASS: &str = "--- Mass-dependent gamma multiplicity (from fragments) ---";
const GAMMA_DISTRIBUTION: &str =
    "--- Total gamma-multiplicity distribution (emission from fragments) ---";
const NEUTRONS_PRE: &str =
    "Apre  Nmean  Nmean          Multiplicity distribution, unnormalized (0 to 16)";
const NEUTRONS_POST: &str =
    "Apost  Nmean  Nmean         Multiplicity distribution, unnormalized (0 to 16)";
const NEUTRONS_LIGHT: &str = "--- Multiplicity distribution of prompt neutrons (light fragment) ---";
const TXE_SPECTRUM: &str = "--- TXE spectrum (bins with zero content suppressed) ---";
const TKE_SPECTRUM: &str =
    "--- TKE spectrum (pre- and post-neutron) (bins with zero content suppressed) ---";
const EKIN_SPECTRUM: &str = "--- A-Ekin spectrum (pre-neutron)---";

impl SummarySpec {
    /// The generator's `.dat` summary and its neutron-energy dump.
    pub fn fission_defaults() -> Vec<Self> {
        vec![
            Self {
                name: "gef".to_string(),
                prefix: "GEF_".to_string(),
                suffix: ".dat".to_string(),
                scalars: vec![
                    anchored("mean_gamma_multiplicity", "</Gamma_multiplicity>", -1, 3),
                    anchored("mean_gamma_energy", "</E_gammas>", -2, 3),
                    anchored("mean_prompt_neutrons", NEUTRONS_LIGHT, -9, 4),
                    anchored("std_prompt_neutrons", NEUTRONS_LIGHT, -8, 3),
                    anchored("mean_neutron_energy", "</Nspectrum>", 3, 4),
                    anchored("mean_tke_pre", TXE_SPECTRUM, -5, 4),
                    anchored("mean_q", TKE_SPECTRUM, -4, 4),
                    anchored("mean_txe", EKIN_SPECTRUM, -4, 4),
                ],
                blocks: vec![
                    block("gamma_multiplicity", (GAMMA_BY_MASS, 4), (GAMMA_DISTRIBUTION, -4)),
                    block("neutron_multiplicity_pre", (NEUTRONS_PRE, 2), (NEUTRONS_POST, -1)),
                ],
                ..Default::default()
            },
            Self {
                name: "en".to_string(),
                dir: "dmp/{stem}".to_string(),
                prefix: "EN".to_string(),
                suffix: ".dmp".to_string(),
                blocks: vec![block(
                    "neutron_energy",
                    (
                        "S: TITLE(Mean neutron energy over pre-neutron mass (from fragments in fragment frame))",
                        7,
                    ),
                    ("S: ANALYZER(ENApostfs)", -3),
                )],
                required: false,
                ..Default::default()
            },
        ]
    }

    /// Copy with `{stem}` in `dir` expanded for `reaction`.
    pub fn for_reaction(&self, reaction: &ReactionConfig) -> Self {
        Self {
            dir: self.dir.replace("{stem}", &reaction.file_stem()),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), TmcError> {
        let plain = |s: &str| !s.is_empty() && !s.contains(['/', '\\']);
        if !plain(self.name.as_str()) || !plain(self.prefix.as_str()) {
            return Err(TmcError::InvalidConfig(format!(
                "fission output {:?} needs a plain name and file prefix",
                self.name
            )));
        }
        let dir = self.dir.replace("{stem}", "stem");
        if !crate::config::is_confined(Path::new(&dir)) {
            return Err(TmcError::InvalidConfig(format!(
                "fission output {}: directory {} must stay inside the working directory",
                self.name, self.dir
            )));
        }
        if self.scalars.is_empty() && self.blocks.is_empty() {
            return Err(TmcError::InvalidConfig(format!(
                "fission output {} reads neither scalars nor blocks",
                self.name
            )));
        }
        let anchors = self
            .scalars
            .iter()
            .map(|s| s.anchor.as_str())
            .chain(self.blocks.iter().flat_map(|b| [b.start.as_str(), b.end.as_str()]));
        for anchor in anchors {
            if anchor.trim().is_empty() {
                return Err(TmcError::InvalidConfig(format!(
                    "fission output {} has an empty marker line",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericTable {
    pub rows: Vec<Vec<f64>>,
}

impl NumericTable {
    pub fn column_count(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FissionObservables {
    pub yields: Vec<FragmentYield>,
    pub total_events: usize,
    pub multichance_events: usize,
    pub ignored_events: usize,
    pub mean_tke: f64,
    pub mean_txe: f64,
    /// Yield-weighted prompt emission energies from extended list-mode runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_emission: Option<EmissionEnergies>,
    /// Values read from the generator's own summary files.
    #[serde(default)]
    pub summary: OutputValues,
}

impl From<YieldTable> for FissionObservables {
    fn from(table: YieldTable) -> Self {
        Self {
            mean_tke: table.mean_tke(),
            mean_txe: table.mean_txe(),
            mean_emission: table.mean_emission(),
            total_events: table.total_events,
            multichance_events: table.multichance_events,
            ignored_events: table.ignored_events,
            yields: table.rows,
            summary: OutputValues::default(),
        }
    }
}

/// Named scalars and tables harvested from one program's output files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputValues {
    /// Keyed `<prefix or name>_<scalar name>`.
    pub scalars: BTreeMap<String, f64>,
    pub tables: BTreeMap<String, NumericTable>,
}

/// Everything harvested from one run, tagged with its instance label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observables {
    pub instance: String,
    pub fission: FissionObservables,
    pub evaporation: Option<OutputValues>,
}

impl Observables {
    /// Flat `(name, value)` view of every scalar observable.
    pub fn scalars(&self) -> Vec<(String, f64)> {
        let mut out = vec![
            ("fission_mean_tke".to_string(), self.fission.mean_tke),
            ("fission_mean_txe".to_string(), self.fission.mean_txe),
            ("fission_fragment_pairs".to_string(), self.fission.yields.len() as f64),
            ("fission_ignored_events".to_string(), self.fission.ignored_events as f64),
        ];
        if let Some(emission) = &self.fission.mean_emission {
            out.extend([
                ("fission_neutron_energy_light".to_string(), emission.neutron_light),
                ("fission_neutron_energy_heavy".to_string(), emission.neutron_heavy),
                ("fission_gamma_energy_light".to_string(), emission.gamma_light),
                ("fission_gamma_energy_heavy".to_string(), emission.gamma_heavy),
            ]);
        }
        out.extend(self.fission.summary.scalars.iter().map(|(k, v)| (k.clone(), *v)));
        if let Some(evaporation) = &self.evaporation {
            out.extend(evaporation.scalars.iter().map(|(k, v)| (k.clone(), *v)));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Collector {
    outputs: Vec<OutputSpec>,
    summaries: Vec<SummarySpec>,
}

impl Collector {
    pub fn new(outputs: Vec<OutputSpec>) -> Self {
        Self {
            outputs,
            summaries: Vec::new(),
        }
    }

    /// Also read these generator summaries; `{stem}` must already be expanded.
    pub fn with_summaries(mut self, summaries: Vec<SummarySpec>) -> Self {
        self.summaries = summaries;
        self
    }

    pub fn collect(
        &self,
        instance: &str,
        fission: YieldTable,
        fission_dir: &Path,
        evaporation_dir: Option<&Path>,
    ) -> Result<Observables, TmcError> {
        let summary = self.collect_summaries(fission_dir)?;
        let evaporation = evaporation_dir
            .map(|dir| self.collect_evaporation(dir))
            .transpose()?;
        let mut fission = FissionObservables::from(fission);
        fission.summary = summary;
        Ok(Observables {
            instance: instance.to_string(),
            fission,
            evaporation,
        })
    }

    pub fn collect_summaries(&self, fission_dir: &Path) -> Result<OutputValues, TmcError> {
        let mut values = OutputValues::default();
        for spec in &self.summaries {
            let dir = fission_dir.join(&spec.dir);
            let names = if dir.is_dir() { file_names(&dir)? } else { Vec::new() };
            let matches: Vec<&String> = names
                .iter()
                .filter(|n| n.starts_with(&spec.prefix) && n.ends_with(&spec.suffix))
                .collect();
            let Some(first) = matches.first() else {
                if spec.required {
                    return Err(TmcError::OutputMissing {
                        program: "fission".to_string(),
                        path: dir.join(format!("{}*{}", spec.prefix, spec.suffix)),
                    });
                }
                continue;
            };
            if matches.len() > 1 {
                warn!(output = %spec.name, used = %first, count = matches.len(), "several summary files match");
            }

            let path = dir.join(first.as_str());
            let raw = fs::read_to_string(&path).map_err(TmcError::io(&path))?;
            let lines: Vec<&str> = raw.lines().collect();
            for scalar in &spec.scalars {
                let value = read_anchored_scalar(&path, &lines, scalar)?;
                values
                    .scalars
                    .insert(format!("{}_{}", spec.name, scalar.name), value);
            }
            for block in &spec.blocks {
                let table = read_anchored_block(&path, &lines, block)?;
                values
                    .tables
                    .insert(format!("{}_{}", spec.name, block.name), table);
            }
        }
        Ok(values)
    }

    pub fn collect_evaporation(&self, dir: &Path) -> Result<OutputValues, TmcError> {
        let names = file_names(dir)?;

        let mut observables = OutputValues::default();
        for spec in &self.outputs {
            let matches: Vec<&String> = names.iter().filter(|n| n.starts_with(&spec.prefix)).collect();
            let Some(first) = matches.first() else {
                if spec.required {
                    return Err(TmcError::OutputMissing {
                        program: "evaporation".to_string(),
                        path: dir.join(format!("{}*", spec.prefix)),
                    });
                }
                continue;
            };
            if matches.len() > 1 {
                warn!(prefix = %spec.prefix, used = %first, count = matches.len(), "several output files share a prefix");
            }

            let path = dir.join(first.as_str());
            let raw = fs::read_to_string(&path).map_err(TmcError::io(&path))?;
            if raw.trim().is_empty() {
                return Err(TmcError::malformed(&path, 0, "file is empty"));
            }

            for header in &spec.scalars {
                let value = read_header_scalar(&path, &raw, header)?;
                observables
                    .scalars
                    .insert(format!("{}_{}", spec.prefix, header.name), value);
            }
            if spec.table {
                let table = parse_table(&path, &raw, spec.columns.as_deref())?;
                observables.tables.insert(spec.prefix.clone(), table);
            }
        }

        Ok(observables)
    }
}

/// Sorted names of the regular files in `dir`.
fn file_names(dir: &Path) -> Result<Vec<String>, TmcError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(TmcError::io(dir))? {
        let entry = entry.map_err(TmcError::io(dir))?;
        if entry.file_type().map_err(TmcError::io(entry.path()))?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Index of the line `offset` away from the first line whose words equal
/// those of `anchor`.
fn locate(path: &Path, lines: &[&str], anchor: &str, offset: isize) -> Result<usize, TmcError> {
    let wanted: Vec<&str> = anchor.split_whitespace().collect();
    let found = lines
        .iter()
        .position(|line| line.split_whitespace().eq(wanted.iter().copied()))
        .ok_or_else(|| TmcError::malformed(path, 0, format!("marker {anchor:?} not found")))?;
    found
        .checked_add_signed(offset)
        .filter(|&idx| idx <= lines.len())
        .ok_or_else(|| {
            TmcError::malformed(
                path,
                found + 1,
                format!("offset {offset} from marker {anchor:?} leaves the file"),
            )
        })
}

fn read_anchored_scalar(path: &Path, lines: &[&str], scalar: &AnchoredScalar) -> Result<f64, TmcError> {
    let idx = locate(path, lines, &scalar.anchor, scalar.offset)?;
    let line_no = idx + 1;
    let token = lines
        .get(idx)
        .and_then(|line| line.split_whitespace().nth(scalar.token))
        .ok_or_else(|| {
            TmcError::malformed(path, line_no, format!("token {} is missing", scalar.token))
        })?;
    parse_number(path, line_no, token)
}

/// Rows holding `%` mark non-physical events and are skipped.
fn read_anchored_block(path: &Path, lines: &[&str], block: &AnchoredBlock) -> Result<NumericTable, TmcError> {
    let start = locate(path, lines, &block.start, block.start_offset)?;
    let end = locate(path, lines, &block.end, block.end_offset)?;
    if end < start {
        return Err(TmcError::malformed(
            path,
            start + 1,
            format!("block {} ends before it starts", block.name),
        ));
    }

    let mut rows = Vec::new();
    let mut skipped = 0;
    for (idx, line) in lines[start..end].iter().enumerate() {
        if line.contains('%') {
            skipped += 1;
            continue;
        }
        let line_no = start + idx + 1;
        let row = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .map(|t| parse_number(path, line_no, t))
            .collect::<Result<Vec<_>, _>>()?;
        if !row.is_empty() {
            rows.push(row);
        }
    }
    if skipped > 0 {
        debug!(path = %path.display(), block = %block.name, skipped, "rows with non-physical entries skipped");
    }
    if rows.is_empty() {
        return Err(TmcError::malformed(
            path,
            start + 1,
            format!("block {} holds no numeric rows", block.name),
        ));
    }
    Ok(NumericTable { rows })
}

fn parse_number(path: &Path, line: usize, token: &str) -> Result<f64, TmcError> {
    token
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| TmcError::malformed(path, line, format!("{token:?} is not a finite number")))
}

fn read_header_scalar(path: &Path, raw: &str, header: &HeaderScalar) -> Result<f64, TmcError> {
    let line_no = header.line + 1;
    let line = raw
        .lines()
        .nth(header.line)
        .ok_or_else(|| TmcError::malformed(path, line_no, "header line is missing"))?;
    let token = line.split_whitespace().nth(header.token).ok_or_else(|| {
        TmcError::malformed(
            path,
            line_no,
            format!("header token {} is missing", header.token),
        )
    })?;
    parse_number(path, line_no, token)
}

/// Parses the `#`-commented numeric body; every row must have the same width.
pub fn parse_table(path: &Path, raw: &str, columns: Option<&[usize]>) -> Result<NumericTable, TmcError> {
    let mut rows = Vec::new();
    let mut width = None;

    for (idx, line) in raw.lines().enumerate() {
        let line_no = idx + 1;
        let data = line.split('#').next().unwrap_or_default();
        let tokens: Vec<&str> = data.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        match width {
            None => width = Some(tokens.len()),
            Some(w) if w != tokens.len() => {
                return Err(TmcError::malformed(
                    path,
                    line_no,
                    format!("row has {} columns, expected {w}", tokens.len()),
                ))
            }
            Some(_) => {}
        }

        let row = match columns {
            None => tokens
                .iter()
                .map(|t| parse_number(path, line_no, t))
                .collect::<Result<Vec<_>, _>>()?,
            Some(cols) => cols
                .iter()
                .map(|&c| {
                    let token = tokens.get(c).ok_or_else(|| {
                        TmcError::malformed(path, line_no, format!("column {c} is missing"))
                    })?;
                    parse_number(path, line_no, token)
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(TmcError::malformed(path, 0, "no numeric rows"));
    }
    Ok(NumericTable { rows })
}

/// A generator `.dat` summary holding every marker of
/// [`SummarySpec::fission_defaults`].
#[cfg(test)]
pub(crate) fn sample_generator_summary() -> String {
    let lines = [
        "GEF results",
        GAMMA_BY_MASS,
        "  A   Mean   Sigma",
        "  (fragments)",
        "",
        "  80  1.5  2.5",
        "  81  %  2.6",
        "  82  1.7  2.7",
        "",
        "  A",
        "",
        "",
        GAMMA_DISTRIBUTION,
        "mean value = 7.25",
        "      </Gamma_multiplicity>",
        "mean value = 0.85",
        "",
        "      </E_gammas>",
        NEUTRONS_PRE,
        "",
        "  90  1.1  1.2  0  1",
        "  91  1.3  1.4  0  1",
        "",
        NEUTRONS_POST,
        "fragments mean value = 2.42",
        "std dev = 1.10",
        "",
        "",
        "",
        "",
        "",
        "",
        "",
        NEUTRONS_LIGHT,
        "      </Nspectrum>",
        "",
        "",
        "spectrum mean energy = 1.98",
        "pre mean value = 170.2",
        "",
        "",
        "",
        "",
        TXE_SPECTRUM,
        "Q mean value = 190.1",
        "",
        "",
        "",
        TKE_SPECTRUM,
        "TXE mean value = 21.3",
        "",
        "",
        "",
        EKIN_SPECTRUM,
    ];
    let mut body = lines.join("\n");
    body.push('\n');
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yield_table() -> YieldTable {
        YieldTable {
            rows: vec![FragmentYield {
                z_light: 38,
                a_light: 96,
                z_heavy: 54,
                a_heavy: 140,
                yield_fraction: 1.0,
                tke: 170.0,
                txe: 20.0,
                e_light: 10.0,
                w_light: 1.0,
                e_heavy: 10.0,
                w_heavy: 1.0,
                emission: None,
            }],
            total_events: 4,
            multichance_events: 1,
            ignored_events: 1,
        }
    }

    fn write_outputs(dir: &Path) {
        fs::write(
            dir.join("nunA.fis"),
            "# header\n# nu\n# Mean value (nubar-prompt)     =   2.4312\n#  A   nu\n 96  1.20\n 140 1.23\n",
        )
        .expect("write");
        fs::write(
            dir.join("pfns000.001.fis"),
            "# spectrum\n# energy\n# projectile\n# E-av  = 2.013 MeV\n 0.1 0.2 0.3 9.9\n 0.2 0.3 0.4 9.9\n",
        )
        .expect("write");
    }

    fn collector() -> Collector {
        Collector::new(vec![
            OutputSpec {
                prefix: "nunA".to_string(),
                scalars: vec![scalar("nubar_prompt", 2, 5)],
                ..Default::default()
            },
            OutputSpec {
                prefix: "pfns".to_string(),
                scalars: vec![scalar("mean_energy_mev", 3, 3)],
                columns: Some(vec![0, 1, 2]),
                ..Default::default()
            },
        ])
    }

    #[test]
    fn collects_scalars_and_tables_by_prefix() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_outputs(tmp.path());

        let observables = collector()
            .collect("TMC_0", yield_table(), tmp.path(), Some(tmp.path()))
            .expect("collect");
        assert_eq!(observables.instance, "TMC_0");
        assert_eq!(observables.fission.mean_tke, 170.0);

        assert!(observables.fission.summary.scalars.is_empty());
        let evaporation = observables.evaporation.expect("evaporation part");
        assert_eq!(evaporation.scalars["nunA_nubar_prompt"], 2.4312);
        assert_eq!(evaporation.scalars["pfns_mean_energy_mev"], 2.013);
        assert_eq!(evaporation.tables["nunA"].rows, vec![vec![96.0, 1.2], vec![140.0, 1.23]]);
        assert_eq!(evaporation.tables["pfns"].column_count(), 3);
    }

    #[test]
    fn missing_required_output_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("nunA.fis"), "# a\n# b\n# Mean value (nubar-prompt) = 2.0\n1 2\n")
            .expect("write");
        let err = collector().collect_evaporation(tmp.path()).unwrap_err();
        assert!(matches!(err, TmcError::OutputMissing { .. }));
    }

    #[test]
    fn ragged_or_truncated_files_are_malformed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_outputs(tmp.path());
        fs::write(tmp.path().join("nunA.fis"), "# a\n# b\n# Mean value (nubar-prompt) = 2.0\n1 2\n3\n")
            .expect("write");
        match collector().collect_evaporation(tmp.path()) {
            Err(TmcError::MalformedOutput { line, .. }) => assert_eq!(line, 5),
            other => panic!("expected malformed output, got {other:?}"),
        }

        fs::write(tmp.path().join("nunA.fis"), "# truncated\n").expect("write");
        assert!(matches!(
            collector().collect_evaporation(tmp.path()),
            Err(TmcError::MalformedOutput { .. })
        ));

        fs::write(tmp.path().join("nunA.fis"), "").expect("write");
        assert!(matches!(
            collector().collect_evaporation(tmp.path()),
            Err(TmcError::MalformedOutput { .. })
        ));
    }

    #[test]
    fn optional_outputs_may_be_absent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_outputs(tmp.path());
        let mut outputs = collector().outputs;
        outputs.push(OutputSpec {
            prefix: "yieldA".to_string(),
            required: false,
            ..Default::default()
        });
        let observables = Collector::new(outputs)
            .collect_evaporation(tmp.path())
            .expect("collect");
        assert!(!observables.tables.contains_key("yieldA"));
    }

    #[test]
    fn default_outputs_are_valid() {
        let defaults = OutputSpec::evaporation_defaults();
        assert_eq!(defaults.len(), 8);
        assert!(defaults.iter().all(|spec| spec.validate().is_ok()));
    }

    fn summary_collector() -> Collector {
        let reaction = ReactionConfig::default();
        let specs = SummarySpec::fission_defaults()
            .iter()
            .map(|spec| spec.for_reaction(&reaction))
            .collect();
        Collector::new(Vec::new()).with_summaries(specs)
    }

    #[test]
    fn generator_summary_is_read_around_marker_lines() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("out")).expect("out");
        fs::write(tmp.path().join("out/GEF_92_236_n.dat"), sample_generator_summary()).expect("write");

        let values = summary_collector().collect_summaries(tmp.path()).expect("collect");
        assert_eq!(values.scalars["gef_mean_gamma_multiplicity"], 7.25);
        assert_eq!(values.scalars["gef_mean_gamma_energy"], 0.85);
        assert_eq!(values.scalars["gef_mean_prompt_neutrons"], 2.42);
        assert_eq!(values.scalars["gef_std_prompt_neutrons"], 1.10);
        assert_eq!(values.scalars["gef_mean_neutron_energy"], 1.98);
        assert_eq!(values.scalars["gef_mean_tke_pre"], 170.2);
        assert_eq!(values.scalars["gef_mean_q"], 190.1);
        assert_eq!(values.scalars["gef_mean_txe"], 21.3);
        assert_eq!(
            values.tables["gef_gamma_multiplicity"].rows,
            vec![vec![80.0, 1.5, 2.5], vec![82.0, 1.7, 2.7]]
        );
        assert_eq!(values.tables["gef_neutron_multiplicity_pre"].rows.len(), 2);
        assert!(!values.tables.contains_key("en_neutron_energy"));
    }

    #[test]
    fn neutron_energy_dump_is_read_from_the_reaction_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("out")).expect("out");
        fs::write(tmp.path().join("out/GEF_92_236_n.dat"), sample_generator_summary()).expect("write");
        let dump_dir = tmp.path().join("dmp/Z92_A236_n_E2.53e-08MeV");
        fs::create_dir_all(&dump_dir).expect("dmp");
        let dump = "S: TITLE(Mean neutron energy over pre-neutron mass (from fragments in fragment frame))\n\
                    a\nb\nc\nd\ne\nA from 80 to 82\n\
                    1.9,2.0,2.1\n\
                    1.8,1.7\n\
                    x\ny\nz\n\
                    S: ANALYZER(ENApostfs)\n";
        fs::write(dump_dir.join("EN.dmp"), dump).expect("write");

        let values = summary_collector().collect_summaries(tmp.path()).expect("collect");
        assert_eq!(
            values.tables["en_neutron_energy"].rows,
            vec![vec![1.9, 2.0, 2.1], vec![1.8, 1.7]]
        );
    }

    #[test]
    fn missing_or_broken_generator_summary_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            summary_collector().collect_summaries(tmp.path()),
            Err(TmcError::OutputMissing { .. })
        ));

        fs::create_dir_all(tmp.path().join("out")).expect("out");
        let truncated: String = sample_generator_summary()
            .lines()
            .take_while(|line| *line != EKIN_SPECTRUM)
            .map(|line| format!("{line}\n"))
            .collect();
        fs::write(tmp.path().join("out/GEF_92_236_n.dat"), truncated).expect("write");
        match summary_collector().collect_summaries(tmp.path()) {
            Err(TmcError::MalformedOutput { reason, .. }) => assert!(reason.contains("not found"), "{reason}"),
            other => panic!("expected malformed output, got {other:?}"),
        }
    }

    #[test]
    fn summary_specs_are_validated() {
        assert!(SummarySpec::fission_defaults().iter().all(|spec| spec.validate().is_ok()));

        let escaping = SummarySpec {
            name: "gef".to_string(),
            dir: "../elsewhere".to_string(),
            prefix: "GEF_".to_string(),
            scalars: vec![anchored("x", "marker", 0, 0)],
            ..Default::default()
        };
        assert!(escaping.validate().is_err());

        let empty = SummarySpec {
            dir: "out".to_string(),
            scalars: Vec::new(),
            ..escaping
        };
        assert!(empty.validate().is_err());
    }
}
