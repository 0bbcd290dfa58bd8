use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

use fission_tmc::output::{
    create_timestamped_output_dir, export_csv, read_container, write_container_to,
};
use fission_tmc::{
    cancel_on_shutdown_signal, run_campaign, CampaignFile, CampaignStatus, CancelToken,
    PersistedContainer, SubprocessRunner,
};

/// Total Monte Carlo campaigns over a fission-fragment generator and an
/// evaporation code.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a campaign described by a TOML file; Ctrl-C stops it and keeps
    /// the partial results
    Run {
        #[arg(short, long)]
        config: PathBuf,

        /// Override the campaign seed
        #[arg(long)]
        seed: Option<u64>,

        /// Override the number of samples per group
        #[arg(long)]
        samples: Option<usize>,

        /// Root under which a timestamped output directory is created
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check a campaign file without running anything
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Merge containers of the same reaction and mode
    Merge {
        #[arg(short, long)]
        output: PathBuf,

        #[arg(required = true, num_args = 2..)]
        inputs: Vec<PathBuf>,
    },
    /// Flatten a container into CSV tables
    Export {
        #[arg(long)]
        container: PathBuf,

        #[arg(long)]
        outdir: PathBuf,
    },
}

fn main() {
    init_logging();
    if let Err(error) = try_main() {
        eprintln!("fission-tmc failed: {error:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn try_main() -> Result<()> {
    match Cli::parse().command {
        Command::Run {
            config,
            seed,
            samples,
            output,
        } => run(&config, seed, samples, output),
        Command::Validate { config } => validate(&config),
        Command::Merge { output, inputs } => merge(&output, &inputs),
        Command::Export { container, outdir } => export(&container, &outdir),
    }
}

fn load(config: &Path) -> Result<CampaignFile> {
    CampaignFile::from_toml_file(config)
        .with_context(|| format!("loading campaign file {}", config.display()))
}

fn run(
    config: &Path,
    seed: Option<u64>,
    samples: Option<usize>,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut file = load(config)?;
    if let Some(seed) = seed {
        file.campaign.seed = seed;
    }
    if let Some(samples) = samples {
        file.campaign.samples = samples;
    }
    let output_root = output.unwrap_or_else(|| file.paths.output_dir.clone());
    file.paths.output_dir = create_timestamped_output_dir(&output_root)
        .with_context(|| format!("creating output directory under {}", output_root.display()))?;

    let cancel = CancelToken::new();
    if let Err(err) = cancel_on_shutdown_signal(cancel.clone()) {
        warn!(error = %err, "campaign cannot be interrupted by signals");
    }
    let report = run_campaign(&file, Arc::new(SubprocessRunner), cancel)
        .context("campaign did not complete")?;

    println!("Container: {}", report.container_path.display());
    println!(
        "Instances: {} collected, {} failed, {} attempts",
        report.succeeded, report.failed, report.attempts
    );
    if report.container.status != CampaignStatus::Complete {
        bail!(
            "campaign stopped early ({:?}); partial results are in {}",
            report.container.interruption,
            report.container_path.display()
        );
    }
    Ok(())
}

fn validate(config: &Path) -> Result<()> {
    let file = load(config)?;
    file.validate()
        .with_context(|| format!("validating {}", config.display()))?;
    let limits = file.limits();
    println!("Reaction: {}", file.reaction.file_stem());
    println!(
        "Mode: {} ({} groups x {} samples, at most {} attempts)",
        file.campaign.mode.as_str(),
        file.group_count(),
        file.samples_per_group(),
        file.max_total_attempts()
    );
    println!(
        "Workers: {} parameters x {} repeats, {} joint",
        limits.parameters_in_flight, limits.repeats_per_parameter, limits.tmc_workers
    );
    Ok(())
}

fn merge(output: &Path, inputs: &[PathBuf]) -> Result<()> {
    let containers = inputs
        .iter()
        .map(|path| {
            read_container(path).with_context(|| format!("reading container {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    let merged = PersistedContainer::merge(containers).context("merging containers")?;
    write_container_to(output, &merged)
        .with_context(|| format!("writing merged container {}", output.display()))?;
    println!(
        "Merged {} containers ({} instances) into {}",
        inputs.len(),
        merged.instance_count(),
        output.display()
    );
    Ok(())
}

fn export(container: &Path, outdir: &Path) -> Result<()> {
    let container = read_container(container)
        .with_context(|| format!("reading container {}", container.display()))?;
    for path in export_csv(&container, outdir).context("exporting CSV")? {
        println!("Wrote {}", path.display());
    }
    Ok(())
}
