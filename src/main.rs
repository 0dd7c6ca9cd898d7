//! Command-line interface for the clip sampler
//!
//! Resolves sources, samples one segment per event duration and prints the
//! result, optionally with the ffmpeg commands that extract each clip.

use std::env;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use anyhow::Context;
use rust_clipsampler::{
    build_sampler, init_tracing, ClipSource, FfmpegClips, FfprobeProbe, MediaProbe, SamplerConfig,
    Segment, SkippedSource, SourceSpec,
};
use tracing::{debug, info};

/// Command-line arguments structure
#[derive(Debug)]
struct Args {
    sources: Vec<String>,
    spec_file: Option<PathBuf>,
    config_file: Option<PathBuf>,
    durations: Option<Vec<f64>>,
    events: Option<Vec<f64>>,
    filters: Option<Vec<String>>,
    seed: Option<u64>,
    preprocess: bool,
    sequential: bool,
    session: Option<PathBuf>,
    probe: ProbeKind,
    verbose: bool,
    output_format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OutputFormat {
    Simple,   // One line per segment
    Detailed, // Timecodes plus extraction commands
    Json,     // JSON format for integration
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ProbeKind {
    Ffprobe,
    #[cfg(feature = "opencv")]
    OpenCv,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            spec_file: None,
            config_file: None,
            durations: None,
            events: None,
            filters: None,
            seed: None,
            preprocess: false,
            sequential: false,
            session: None,
            probe: ProbeKind::Ffprobe,
            verbose: false,
            output_format: OutputFormat::Simple,
        }
    }
}

const USAGE: &str = "Usage: rust-clipsampler <source>... [OPTIONS]\n\n\
    Sources may be files, directories or glob patterns.\n\n\
    Options:\n\
    --durations <list>     Segment durations in seconds, comma separated\n\
    --events <list>        Event durations to sample, in order (default: one per duration)\n\
    --filters <list>       Filter names in order (default: every available default filter)\n\
    --spec <file>          JSON source specification (nested lists and weights)\n\
    --config <file>        JSON sampler configuration\n\
    --seed <n>             Random seed for reproducible output\n\
    --session <file>       Resume from and save to a session file\n\
    --preprocess           Evaluate every filter before sampling\n\
    --sequential           Disable parallel preprocessing\n\
    --probe <kind>         Duration probe: ffprobe|opencv (default: ffprobe)\n\
    --format <fmt>         Output format: simple|detailed|json (default: simple)\n\
    --verbose              Enable debug logging\n\
    --help                 Show this help message\n\n\
    Examples:\n\
    rust-clipsampler clips/ --durations 0.5,1 --events 0.5,0.5,1\n\
    rust-clipsampler 'footage/*.mp4' --durations 2 --filters not_is_repeat --format detailed";

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let argv: Vec<String> = env::args().collect();
    let args = parse_args(&argv[1..]).map_err(anyhow::Error::msg)?;

    let log_level = if args.verbose { "debug" } else { "warn" };
    init_tracing(log_level);

    info!("Clip Sampler CLI v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    let config = build_config(&args)?;
    let spec = source_spec(&args)?;
    let events = args.events.clone().unwrap_or_else(|| config.durations.clone());
    let probe = make_probe(args.probe);

    let start_time = Instant::now();
    let (mut sampler, skipped) = build_sampler(&spec, config.clone(), &*probe)
        .context("Failed to prepare sources")?;
    let segments = sampler
        .sample_events(&events)
        .context("Sampling failed")?;
    let sampling_time = start_time.elapsed();

    if let Some(path) = &config.session {
        sampler
            .save_session(path)
            .with_context(|| format!("Failed to save session to {}", path.display()))?;
    }

    output_results(
        &segments,
        &skipped,
        sampler.rejected_segments().len(),
        &config,
        &args,
        sampling_time,
    )?;
    Ok(())
}

fn parse_list<T: std::str::FromStr>(flag: &str, value: &str) -> Result<Vec<T>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse()
                .map_err(|_| format!("Invalid value '{}' for {}", item, flag))
        })
        .collect()
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    if args.is_empty() {
        return Err(USAGE.to_string());
    }

    let mut parsed_args = Args::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let takes_value = matches!(
            flag,
            "--durations"
                | "--events"
                | "--filters"
                | "--spec"
                | "--config"
                | "--seed"
                | "--session"
                | "--probe"
                | "--format"
        );
        if takes_value && i + 1 >= args.len() {
            return Err(format!("{} requires a value", flag));
        }

        match flag {
            "--durations" => parsed_args.durations = Some(parse_list(flag, &args[i + 1])?),
            "--events" => parsed_args.events = Some(parse_list(flag, &args[i + 1])?),
            "--filters" => parsed_args.filters = Some(parse_list(flag, &args[i + 1])?),
            "--spec" => parsed_args.spec_file = Some(PathBuf::from(&args[i + 1])),
            "--config" => parsed_args.config_file = Some(PathBuf::from(&args[i + 1])),
            "--session" => parsed_args.session = Some(PathBuf::from(&args[i + 1])),
            "--seed" => {
                parsed_args.seed = Some(args[i + 1].parse().map_err(|_| "Invalid seed value")?)
            }
            "--probe" => {
                parsed_args.probe = match args[i + 1].as_str() {
                    "ffprobe" => ProbeKind::Ffprobe,
                    #[cfg(feature = "opencv")]
                    "opencv" => ProbeKind::OpenCv,
                    other => return Err(format!("Unsupported probe '{}'", other)),
                }
            }
            "--format" => {
                parsed_args.output_format = match args[i + 1].as_str() {
                    "simple" => OutputFormat::Simple,
                    "detailed" => OutputFormat::Detailed,
                    "json" => OutputFormat::Json,
                    _ => return Err("Invalid format. Use 'simple', 'detailed', or 'json'".to_string()),
                }
            }
            "--preprocess" => parsed_args.preprocess = true,
            "--sequential" => parsed_args.sequential = true,
            "--verbose" => parsed_args.verbose = true,
            "--help" => return Err(USAGE.to_string()),
            _ if flag.starts_with("--") => return Err(format!("Unknown option: {}", flag)),
            _ => parsed_args.sources.push(flag.to_string()),
        }
        i += if takes_value { 2 } else { 1 };
    }

    if parsed_args.sources.is_empty() && parsed_args.spec_file.is_none() {
        return Err(format!("No sources given\n\n{}", USAGE));
    }
    Ok(parsed_args)
}

/// Merge the optional config file with command-line overrides
fn build_config(args: &Args) -> anyhow::Result<SamplerConfig> {
    let mut config = match &args.config_file {
        Some(path) => SamplerConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SamplerConfig::default(),
    };

    if let Some(durations) = &args.durations {
        config.durations = durations.clone();
    }
    if let Some(events) = &args.events {
        // Every event needs a bucket of its own duration
        for &event in events {
            if !config.durations.iter().any(|&d| d == event) {
                config.durations.push(event);
            }
        }
    }
    if args.filters.is_some() {
        config.filters = args.filters.clone();
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if args.session.is_some() {
        config.session = args.session.clone();
    }
    config.preprocess |= args.preprocess;
    if args.sequential {
        config.parallel = false;
    }

    config.validate()?;
    Ok(config)
}

fn source_spec(args: &Args) -> anyhow::Result<SourceSpec> {
    let mut specs: Vec<SourceSpec> = args.sources.iter().map(|s| SourceSpec::from(s.as_str())).collect();

    if let Some(path) = &args.spec_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read source spec {}", path.display()))?;
        let spec: SourceSpec = serde_json::from_str(&text)
            .with_context(|| format!("Invalid source spec {}", path.display()))?;
        specs.push(spec);
    }

    Ok(if specs.len() == 1 {
        specs.remove(0)
    } else {
        SourceSpec::List(specs)
    })
}

fn make_probe(kind: ProbeKind) -> Box<dyn MediaProbe> {
    match kind {
        ProbeKind::Ffprobe => Box::new(FfprobeProbe::default()),
        #[cfg(feature = "opencv")]
        ProbeKind::OpenCv => Box::new(rust_clipsampler::OpenCvProbe),
    }
}

fn output_results(
    segments: &[Segment],
    skipped: &[SkippedSource],
    rejected: usize,
    config: &SamplerConfig,
    args: &Args,
    sampling_time: std::time::Duration,
) -> anyhow::Result<()> {
    match args.output_format {
        OutputFormat::Simple => {
            for segment in segments {
                println!("{}", segment);
            }
        }
        OutputFormat::Detailed => {
            let clips = FfmpegClips::default();
            println!("Sampling Results:");
            println!("  Sampling time: {}ms", sampling_time.as_millis());
            println!("  Segments: {}", segments.len());
            println!("  Rejected segments: {}", rejected);

            if !skipped.is_empty() {
                println!("  Skipped sources:");
                for source in skipped {
                    println!("    {}: {}", source.path.display(), source.reason);
                }
            }

            for (i, segment) in segments.iter().enumerate() {
                let command = clips.open_clip(segment)?;
                println!(
                    "  Event {}: {} ({:.3}s)",
                    i + 1,
                    segment,
                    segment.duration()
                );
                println!("    {} clip_{:04}.mp4", command, i + 1);
            }
        }
        OutputFormat::Json => {
            let json_output = serde_json::json!({
                "sampling_time_ms": sampling_time.as_millis(),
                "segment_count": segments.len(),
                "segments": segments,
                "rejected_count": rejected,
                "skipped": skipped
                    .iter()
                    .map(|s| serde_json::json!({ "path": s.path, "reason": s.reason }))
                    .collect::<Vec<_>>(),
                "config": config,
            });

            println!(
                "{}",
                serde_json::to_string_pretty(&json_output).context("JSON serialization failed")?
            );
        }
    }

    info!(
        "Sampling completed in {}ms, {} segments",
        sampling_time.as_millis(),
        segments.len()
    );
    Ok(())
}
