use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use fit_merge::{
    decode_fit, merge, JsonLinesSink, LapSummary, MemorySink, MergeError, MergeParams,
    MergeReport, MessageKind, Sample, StreamEvent,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Merge device and simulator FIT recordings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rewrite a device recording with position/elevation/speed from a simulator recording
    Merge(MergeArgs),
    /// Summarize FIT files: source tag, message counts and usable samples
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct MergeArgs {
    /// Device FIT file supplying structure, timing and laps
    #[arg(long, value_hint = ValueHint::FilePath)]
    primary: PathBuf,

    /// Simulator FIT file supplying position, elevation, speed and distance
    #[arg(long, value_hint = ValueHint::FilePath)]
    secondary: PathBuf,

    /// Merged output (JSON lines, one event per line)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Overwrite the output if it already exists
    #[arg(long, action = ArgAction::SetTrue)]
    force: bool,

    /// Run the merge and log the result without writing the merged output
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,

    /// Fail on FIT integrity (CRC) errors instead of warning
    #[arg(long, action = ArgAction::SetTrue)]
    strict: bool,

    /// Merge parameters as JSON; flags below override it
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Expected manufacturer of the primary file
    #[arg(long)]
    primary_source: Option<String>,

    /// Expected manufacturer of the secondary file
    #[arg(long)]
    secondary_source: Option<String>,

    /// Reject a primary file whose identity message has no manufacturer
    #[arg(long, action = ArgAction::SetTrue)]
    require_primary_source: bool,

    /// Optional CSV with one row per lap
    #[arg(long, value_hint = ValueHint::FilePath)]
    laps_csv: Option<PathBuf>,

    /// Optional JSON run report
    #[arg(long, value_hint = ValueHint::FilePath)]
    report: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// FIT files to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Merge(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Merge(args) => handle_merge(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn handle_merge(args: MergeArgs) -> Result<()> {
    check_paths(
        &args.primary,
        &args.secondary,
        &args.output,
        args.force || args.dry_run,
    )?;
    let params = resolve_params(&args)?;

    let t_parse = Instant::now();
    let (primary, secondary) = rayon::join(
        || load_stream(&args.primary, args.strict),
        || load_stream(&args.secondary, args.strict),
    );
    let (primary, secondary) = (primary?, secondary?);
    debug!(
        "Parse stage: {:.1} ms ({} primary, {} secondary messages)",
        t_parse.elapsed().as_secs_f64() * 1000.0,
        primary.len(),
        secondary.len()
    );

    let context = || {
        format!(
            "failed to merge {} with {}",
            args.primary.display(),
            args.secondary.display()
        )
    };
    let report = if args.dry_run {
        let mut sink = MemorySink::new();
        let report = merge(
            primary.into_iter().map(Ok),
            secondary.into_iter().map(Ok),
            &mut sink,
            &params,
        )
        .with_context(context)?;
        info!(
            "Dry run: {} events merged, {} not written",
            sink.events.len(),
            args.output.display()
        );
        report
    } else {
        let report = write_staged(&args.output, |sink| {
            merge(
                primary.into_iter().map(Ok),
                secondary.into_iter().map(Ok),
                sink,
                &params,
            )
        })
        .with_context(context)?;
        info!("Wrote merged stream: {}", args.output.display());
        report
    };

    log_report(&report);

    if let Some(path) = args.laps_csv.as_ref() {
        write_laps_csv(&report.laps, path)?;
        info!("Wrote lap table: {}", path.display());
    }
    if let Some(path) = args.report.as_ref() {
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &report)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote run report: {}", path.display());
    }
    Ok(())
}

/// Runs `run` against a temp file next to `output` and moves it into place only
/// on success; a failed merge leaves `output` untouched.
fn write_staged<F>(output: &Path, run: F) -> Result<MergeReport>
where
    F: FnOnce(&mut JsonLinesSink<&mut File>) -> Result<MergeReport, MergeError>,
{
    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut staged = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("failed to stage output in {}", dir.display()))?;
    let report = {
        let mut sink = JsonLinesSink::new(staged.as_file_mut());
        run(&mut sink)?
    };
    staged
        .persist(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    Ok(report)
}

/// Caller-side checks: FIT inputs, an output distinct from both inputs, and no
/// silent overwrite.
fn check_paths(primary: &Path, secondary: &Path, output: &Path, force: bool) -> Result<()> {
    for input in [primary, secondary] {
        if !has_fit_extension(input) {
            return Err(anyhow!(
                "{}: input filenames must end with .fit",
                input.display()
            ));
        }
    }
    if same_path(output, primary) || same_path(output, secondary) {
        return Err(anyhow!(
            "{}: output would overwrite an input file",
            output.display()
        ));
    }
    if output.exists() && !force {
        return Err(anyhow!(
            "{}: output already exists (use --force to overwrite)",
            output.display()
        ));
    }
    Ok(())
}

fn has_fit_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("fit"))
        .unwrap_or(false)
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn resolve_params(args: &MergeArgs) -> Result<MergeParams> {
    let mut params = match args.config.as_ref() {
        Some(path) => load_params(path)?,
        None => MergeParams::default(),
    };
    if let Some(tag) = args.primary_source.as_ref() {
        params.primary_source = tag.clone();
    }
    if let Some(tag) = args.secondary_source.as_ref() {
        params.secondary_source = tag.clone();
    }
    if args.require_primary_source {
        params.require_primary_source = true;
    }
    params.validate()?;
    Ok(params)
}

fn load_params(path: &Path) -> Result<MergeParams> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn load_stream(path: &Path, strict: bool) -> Result<Vec<StreamEvent>> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    decode_fit(&data, strict).with_context(|| format!("failed to parse {}", path.display()))
}

fn log_report(report: &MergeReport) {
    info!(
        "Records: {} matched, {} dropped of {} ({} secondary samples, {} incomplete)",
        report.records_matched,
        report.records_dropped,
        report.records_seen,
        report.samples_indexed,
        report.samples_skipped
    );
    if report.unrecognized_dropped > 0 {
        info!("Dropped {} unrecognized messages", report.unrecognized_dropped);
    }
    for session in &report.sessions {
        info!(
            "Session: {:.2} km in {} s, +{:.0}/-{:.0} m, avg {:.2} m/s, max {:.2} m/s",
            session.distance_m / 1000.0,
            session.elapsed_s,
            session.ascent_m,
            session.descent_m,
            session.avg_speed_mps,
            session.max_speed_mps
        );
    }
    if report.records_matched == 0 {
        warn!("No device record matched a simulator timestamp; output has no records");
    }
    if report.degenerate_intervals > 0 {
        warn!(
            "{} lap/session intervals had no elapsed time (average speed written as 0)",
            report.degenerate_intervals
        );
    }
}

fn write_laps_csv(laps: &[LapSummary], path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    write_lap_rows(laps, &mut csv::Writer::from_writer(file))
}

fn write_lap_rows<W: Write>(laps: &[LapSummary], writer: &mut csv::Writer<W>) -> Result<()> {
    for lap in laps {
        writer.serialize(lap)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Default)]
struct StreamSummary {
    source: Option<String>,
    kinds: BTreeMap<String, usize>,
    records: usize,
    complete_samples: usize,
    first_time: Option<i64>,
    last_time: Option<i64>,
}

fn summarize(events: &[StreamEvent]) -> StreamSummary {
    let mut summary = StreamSummary::default();
    for msg in events.iter().filter_map(StreamEvent::as_message) {
        *summary.kinds.entry(msg.kind.label()).or_insert(0) += 1;
        match msg.kind {
            MessageKind::FileId => {
                if summary.source.is_none() {
                    summary.source = msg.field("manufacturer").and_then(|v| v.as_tag());
                }
            }
            MessageKind::Record => {
                summary.records += 1;
                if Sample::from_record(msg).is_some() {
                    summary.complete_samples += 1;
                }
                if let Some(t) = msg.timestamp() {
                    summary.first_time.get_or_insert(t);
                    summary.last_time = Some(t);
                }
            }
            _ => {}
        }
    }
    summary
}

fn render_summary(path: &Path, summary: &StreamSummary, report: &mut String) {
    report.push_str(&format!("FILE: {}\n", path.display()));
    report.push_str(&format!(
        "  source: {}\n",
        summary.source.as_deref().unwrap_or("n/a")
    ));
    report.push_str(&format!(
        "  records: {} ({} with all sample fields)\n",
        summary.records, summary.complete_samples
    ));
    if let (Some(start), Some(end)) = (summary.first_time, summary.last_time) {
        report.push_str(&format!("  timespan_s: {}\n", end - start));
    }
    if !summary.kinds.is_empty() {
        report.push_str("  messages:\n");
        let mut entries: Vec<_> = summary.kinds.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1));
        for (name, count) in entries {
            report.push_str(&format!("    - {}: {}\n", name, count));
        }
    }
    report.push('\n');
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let mut report = String::new();
    for path in &args.inputs {
        let events = load_stream(path, false)?;
        render_summary(path, &summarize(&events), &mut report);
    }

    if args.output.as_os_str() == "-" {
        io::stdout().lock().write_all(report.as_bytes())?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Inspection report written: {}", args.output.display());
    }
    Ok(())
}
