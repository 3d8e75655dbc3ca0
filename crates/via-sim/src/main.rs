//! via-sim - replay synthetic series through via-core
//!
//! Usage:
//!   via-sim replay --days 21 --anomaly-at 490 --anomaly-scale 3
//!   via-sim decompose --days 14 --format pretty

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use via_core::{CalculatorConfig, DecompositionConfig};
use via_sim::{Anomaly, Detector, SeriesConfig, generate, replay};

#[derive(Parser)]
#[command(name = "via-sim")]
#[command(about = "Replay synthetic seasonal series through the anomaly calculator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score every bucket and print the anomalous ones
    Replay {
        #[command(flatten)]
        series: SeriesArgs,

        /// Bucket index to inject an anomaly at
        #[arg(long)]
        anomaly_at: Option<usize>,

        /// Factor to scale the anomalous bucket by
        #[arg(long, default_value = "3.0")]
        anomaly_scale: f64,

        /// Report buckets with probability below this
        #[arg(long, default_value = "0.01")]
        threshold: f64,

        /// Calculator settings as JSON
        #[arg(long)]
        calculator: Option<String>,

        #[arg(short, long, default_value = "json")]
        format: OutputFormat,
    },

    /// Print the learned baseline against the actual values
    Decompose {
        #[command(flatten)]
        series: SeriesArgs,

        /// Confidence of the baseline interval, in percent
        #[arg(long, default_value = "95.0")]
        confidence: f64,

        #[arg(short, long, default_value = "json")]
        format: OutputFormat,
    },
}

#[derive(Args)]
struct SeriesArgs {
    /// Number of days to generate
    #[arg(short, long, default_value = "21")]
    days: i64,

    /// Bucket length in seconds
    #[arg(short, long, default_value = "3600")]
    bucket: i64,

    #[arg(short, long, default_value = "0")]
    seed: u64,

    /// Number of hosts sharing each bucket's value
    #[arg(long, default_value = "4")]
    hosts: usize,

    /// RFC 3339 start time
    #[arg(long, default_value = "2024-01-01T00:00:00Z")]
    start: String,

    /// Decay rate per day
    #[arg(long, default_value = "0.01")]
    decay_rate: f64,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Replay { series, anomaly_at, anomaly_scale, threshold, calculator, format } => {
            let anomaly = anomaly_at.map(|bucket| Anomaly { bucket, scale: anomaly_scale });
            run_replay(series, anomaly, threshold, calculator, format)
        }
        Commands::Decompose { series, confidence, format } => run_decompose(series, confidence, format),
    };
    if let Err(message) = result {
        error!("{}", message);
        std::process::exit(1);
    }
}

fn configs(args: &SeriesArgs, anomaly: Option<Anomaly>) -> Result<(SeriesConfig, DecompositionConfig), String> {
    let start = DateTime::parse_from_rfc3339(&args.start).map_err(|e| format!("bad start time: {}", e))?;
    let decomposition = DecompositionConfig {
        decay_rate: args.decay_rate,
        bucket_length: args.bucket,
        ..DecompositionConfig::default()
    };
    decomposition.validate().map_err(|e| e.to_string())?;
    let series = SeriesConfig {
        start: start.timestamp(),
        days: args.days,
        bucket_length: args.bucket,
        seed: args.seed,
        hosts: args.hosts,
        anomaly,
        ..SeriesConfig::default()
    };
    Ok((series, decomposition))
}

fn display_time(time: i64) -> String {
    DateTime::<Utc>::from_timestamp(time, 0).map_or_else(|| time.to_string(), |t| t.to_rfc3339())
}

fn print<T: Serialize>(record: &T, format: OutputFormat, pretty: impl FnOnce() -> String) -> Result<(), String> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(record).map_err(|e| e.to_string())?),
        OutputFormat::Pretty => println!("{}", pretty()),
    }
    Ok(())
}

fn run_replay(
    args: SeriesArgs,
    anomaly: Option<Anomaly>,
    threshold: f64,
    calculator: Option<String>,
    format: OutputFormat,
) -> Result<(), String> {
    let (series, decomposition) = configs(&args, anomaly)?;
    let calculator = match calculator {
        Some(json) => CalculatorConfig::from_json(&json).map_err(|e| e.to_string())?,
        None => CalculatorConfig::default(),
    };
    info!(
        start = %display_time(series.start),
        days = series.days,
        bucket_length = series.bucket_length,
        seed = series.seed,
        "replaying"
    );

    let buckets = generate(&series);
    let mut detector = Detector::new(&decomposition, &calculator);
    let reports = replay(&buckets, &mut detector, threshold);
    for report in &reports {
        print(report, format, || {
            let influences: Vec<String> = report
                .influences
                .iter()
                .map(|(name, value, score)| format!("{}={} ({:.3})", name, value, score))
                .collect();
            format!(
                "{} #{:<5} value={:>9.2} baseline={:>9.2} p={:.3e}{} {}",
                display_time(report.time),
                report.index,
                report.value,
                report.baseline,
                report.probability,
                if report.anomalous { " [INJECTED]" } else { "" },
                influences.join(", ")
            )
        })?;
    }
    info!(buckets = buckets.len(), anomalies = reports.len(), "replay complete");
    Ok(())
}

fn run_decompose(args: SeriesArgs, confidence: f64, format: OutputFormat) -> Result<(), String> {
    let (series, decomposition) = configs(&args, None)?;
    let buckets = generate(&series);
    let mut detector = Detector::new(&decomposition, &CalculatorConfig::default());
    for bucket in &buckets {
        let point = detector.baseline(bucket, confidence);
        print(&point, format, || {
            format!(
                "{} value={:>9.2} baseline=[{:>9.2}, {:>9.2}]",
                display_time(point.time),
                point.value,
                point.lower,
                point.upper
            )
        })?;
        detector.observe(bucket);
    }
    info!(description = %detector.decomposition().describe(), "final decomposition");
    Ok(())
}
