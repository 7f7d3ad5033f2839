use std::{fs, path::Path, path::PathBuf};

use clap::{AppSettings, Parser};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};
use rayon::prelude::*;

use ost_verify::{
    obs::{process_observation, Observation},
    stats::ArchiveStatistics,
    validate::ValidateConfig,
};

#[derive(Parser)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_long_args = true)]
struct Args {
    /// Observation directories, each holding one observing script (.evla)
    /// and its VCI documents (.vci).
    obs_dirs: Vec<PathBuf>,

    /// Absolute tolerance [Hz] on |expected - realized| LO offsets.
    #[clap(short, long, default_value = "1.0")]
    tolerance: f64,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    verbosity: u8,

    /// Disable progress bars.
    #[clap(long)]
    no_progress_bars: bool,
}

fn main() {
    let mut args = Args::parse();
    args.obs_dirs.sort_unstable();
    setup_logging(args.verbosity);

    let config = ValidateConfig {
        tolerance_hz: args.tolerance,
    };
    info!("Tolerance: {} Hz", config.tolerance_hz);
    info!("Observations: {}", args.obs_dirs.len());

    let progress = ProgressBar::new(args.obs_dirs.len() as _)
        .with_style(
            ProgressStyle::default_bar()
                .template("{msg:12}: [{wide_bar:.blue}] {pos:4}/{len:4} observations ({elapsed_precise}<{eta_precise})")
                .unwrap()
                .progress_chars("=> "),
        )
        .with_message("Validating");
    if args.no_progress_bars {
        progress.set_draw_target(ProgressDrawTarget::hidden());
    }

    // Each observation is independent; only the statistics are shared, and
    // they combine associatively.
    let stats: ArchiveStatistics<String> = args
        .obs_dirs
        .par_iter()
        .progress_with(progress)
        .map(|dir| {
            let mut partial = ArchiveStatistics::default();
            match process_dir(dir, &config) {
                Ok(obs) => {
                    if let Some(flag) = obs.worst_mixer_flag() {
                        if flag.is_bad() {
                            warn!("{}: applied f-shift is {flag:?} for some sub-band", obs.label);
                        }
                    }
                    partial.ingest(group_key(&obs), &obs.summary)
                }
                Err(e) => {
                    warn!("{}: {e}", dir.display());
                    partial.record_failure();
                }
            }
            partial
        })
        .reduce(ArchiveStatistics::default, ArchiveStatistics::merge);

    print_report(&stats);
}

/// Load an observation directory's files and run the pipeline. Exactly one
/// script and at least one VCI document are expected, as the scheduler
/// writes them.
fn process_dir(dir: &Path, config: &ValidateConfig) -> Result<Observation, String> {
    let mut script_paths = vec![];
    let mut vci_paths = vec![];
    let entries = fs::read_dir(dir).map_err(|e| format!("unreadable directory: {e}"))?;
    for entry in entries {
        let path = entry.map_err(|e| format!("unreadable directory: {e}"))?.path();
        match path.extension().and_then(|os_str| os_str.to_str()) {
            Some("evla") => script_paths.push(path),
            Some("vci") => vci_paths.push(path),
            _ => (),
        }
    }
    script_paths.sort_unstable();
    vci_paths.sort_unstable();

    let script_path = match script_paths.as_slice() {
        [] => return Err("no .evla script found".to_string()),
        [one] => one,
        _ => return Err("more than one .evla script found".to_string()),
    };

    let script_text = read_lossy(script_path)?;
    let vci_texts: Vec<String> = vci_paths
        .iter()
        .map(|p| read_lossy(p))
        .collect::<Result<_, _>>()?;
    let vci_refs: Vec<&str> = vci_texts.iter().map(String::as_str).collect();

    let label = dir
        .iter()
        .rev()
        .take(3)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<PathBuf>()
        .display()
        .to_string();
    process_observation(&label, &script_text, &vci_refs, config).map_err(|e| e.to_string())
}

/// Some of the older archive files are not UTF-8.
fn read_lossy(path: &Path) -> Result<String, String> {
    let bytes = fs::read(path).map_err(|e| format!("{}: {e}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Group archive statistics by receiver band.
fn group_key(obs: &Observation) -> String {
    obs.expected
        .iter()
        .chain(obs.realized.iter())
        .find_map(|s| s.band.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

fn print_report(stats: &ArchiveStatistics<String>) {
    info!("Observations aggregated: {}", stats.n_observations());
    info!("Observations failed:     {}", stats.failed_observations);
    for (band, group) in stats.groups() {
        let pass_rate = group
            .pass_rate()
            .map(|r| format!("{:.4}", r))
            .unwrap_or_else(|| "n/a".to_string());
        let mean_err = group
            .error
            .mean()
            .map(|m| format!("{:.3}", m))
            .unwrap_or_else(|| "n/a".to_string());
        info!(
            "band {band}: {} obs, {} comparisons, pass rate {pass_rate}, \
             {} unmatched, mean |err| {mean_err} Hz, \
             {} f-shift errors",
            group.observations,
            group.n_results,
            group.n_unmatched,
            group.n_fshift_errors,
        );
        info!(
            "  errors: {} script line(s), {} VCI element(s), {} skipped setup(s)",
            group.n_script_errors, group.n_vci_errors, group.n_extract_errors,
        );
        info!("  |err| histogram: {:?}", group.error_hist.counts());
    }
}

fn setup_logging(verbosity: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        2 => builder.filter_level(log::LevelFilter::Trace),
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
            builder.format(|buf, record| {
                use std::io::Write;

                let timestamp = buf.timestamp();
                let level = record.level();
                let target = record.target();
                let line = record.line().unwrap_or(0);
                let message = record.args();

                writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
            })
        }
    };
    builder.init();
}
