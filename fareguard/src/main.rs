// fareguard/src/main.rs
//
// fareguard — streaming fraud scoring and live aggregates for taxi trips
//
// Subcommands:
//   run       — consumer loop: source → enrich → score → aggregate → store
//   score     — score a JSONL file offline, one ScoredTrip JSON per line
//   snapshot  — print the persisted aggregates for one date
//
// Usage:
//   fareguard run --source tail --path /var/spool/trips.jsonl --output /var/lib/fareguard
//   fareguard run --source replay --path sample.jsonl --store memory
//   fareguard run --source tail --path trips.jsonl --source-id trips-2024-09-03
//   fareguard run --source kafka --brokers kafka1:9092      # --features kafka
//   fareguard score --path sample.jsonl --explain
//   fareguard snapshot --date 2024-09-03 --top 5

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fareguard::engine::dispatcher::Dispatcher;
use fareguard::engine::{enrich, scorer};
use fareguard::events::{RiskTier, ScoredTrip, TripEvent};
use fareguard::pipeline::{stats_loop, Pipeline, PipelineConfig};
use fareguard::redis_state::{RedisConfig, RedisStore};
use fareguard::source::jsonl::JsonlSource;
use fareguard::source::EventSource;
use fareguard::state::memory::MemoryStore;
use fareguard::state::reader::StoreReader;
use fareguard::state::retry::RetryPolicy;
use fareguard::state::writer::WriterConfig;
use fareguard::state::{Keys, SharedStore};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "fareguard",
    about   = "Streaming fraud scoring and live aggregates for taxi trips",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, global = true, env = "FAREGUARD_LOG_JSON", help = "Log as JSON lines")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the consumer loop
    Run(RunArgs),
    /// Score a JSONL file of trips without touching the store
    Score {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, help = "Human-readable rule breakdown instead of JSON")]
        explain: bool,
    },
    /// Print persisted aggregates for one date
    Snapshot {
        #[arg(long, help = "YYYY-MM-DD, defaults to today (UTC)")]
        date: Option<NaiveDate>,
        #[arg(long, default_value = "10")]
        top: usize,
        #[command(flatten)]
        store: StoreArgs,
    },
}

#[derive(Args)]
struct StoreArgs {
    #[arg(long = "store", value_enum, default_value = "redis")]
    kind: StoreKind,

    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    #[arg(long, env = "FAREGUARD_KEY_PREFIX", default_value = "")]
    key_prefix: String,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, value_enum, default_value = "tail")]
    source: SourceKind,

    #[arg(long, env = "FAREGUARD_INPUT", default_value = "/tmp/fareguard_trips.jsonl",
          help = "JSONL path (tail/replay sources)")]
    path: PathBuf,

    #[arg(long, help = "Tail: without a checkpoint, skip what is already in the file")]
    from_end: bool,

    #[arg(long, env = "FAREGUARD_SOURCE_ID",
          help = "Scope for committed offsets; defaults to jsonl:{path} or kafka:{topic}/{group}")]
    source_id: Option<String>,

    #[command(flatten)]
    store: StoreArgs,

    #[arg(long, env = "KAFKA_BOOTSTRAP_SERVERS", default_value = "localhost:9092")]
    brokers: String,

    #[arg(long, env = "KAFKA_TOPIC", default_value = "nyc.taxi.trips.raw")]
    topic: String,

    #[arg(long, env = "KAFKA_GROUP_ID", default_value = "fareguard")]
    group_id: String,

    #[arg(long, env = "FAREGUARD_OUTPUT", help = "Directory for ops and fraud alert JSONL")]
    output: Option<PathBuf>,

    #[arg(long, env = "BATCH_INTERVAL_MS", default_value = "5000")]
    batch_interval_ms: u64,

    #[arg(long, env = "MAX_BATCH", default_value = "1000")]
    max_batch: usize,

    #[arg(long, env = "FRAUD_THRESHOLD", default_value = "50")]
    fraud_threshold: u8,

    #[arg(long, env = "RETENTION_DAYS", default_value = "7")]
    retention_days: u64,

    #[arg(long, env = "ALERT_LOG_CAP", default_value = "100")]
    alert_log_cap: usize,
}

#[derive(Clone, ValueEnum)]
enum SourceKind {
    Tail,    // follow a growing JSONL file
    Replay,  // read a JSONL file once, then exit
    Kafka,   // consumer group on the ingest topic
}

#[derive(Clone, ValueEnum)]
enum StoreKind {
    Redis,
    Memory,  // in-process, lost on exit
}

// ── Wiring ────────────────────────────────────────────────────────────────────

async fn open_store(args: &StoreArgs) -> Result<SharedStore> {
    Ok(match args.kind {
        StoreKind::Redis => {
            let config = RedisConfig { url: args.redis_url.clone(), ..RedisConfig::default() };
            Arc::new(RedisStore::connect(&config).await?)
        }
        StoreKind::Memory => Arc::new(MemoryStore::new()),
    })
}

async fn open_source(args: &RunArgs) -> Result<Box<dyn EventSource>> {
    Ok(match args.source {
        SourceKind::Tail   => Box::new(JsonlSource::tail(&args.path, args.from_end).await
            .with_context(|| format!("cannot tail {}", args.path.display()))?),
        SourceKind::Replay => Box::new(JsonlSource::replay(&args.path).await
            .with_context(|| format!("cannot replay {}", args.path.display()))?),
        SourceKind::Kafka  => open_kafka(args)?,
    })
}

#[cfg(feature = "kafka")]
fn open_kafka(args: &RunArgs) -> Result<Box<dyn EventSource>> {
    use fareguard::kafka_source::{KafkaConfig, KafkaSource};
    let config = KafkaConfig {
        brokers:  args.brokers.clone(),
        topic:    args.topic.clone(),
        group_id: args.group_id.clone(),
        ..KafkaConfig::default()
    };
    Ok(Box::new(KafkaSource::connect(config)?))
}

#[cfg(not(feature = "kafka"))]
fn open_kafka(args: &RunArgs) -> Result<Box<dyn EventSource>> {
    anyhow::bail!(
        "kafka source ({} / {} / group {}) requires a build with --features kafka",
        args.brokers, args.topic, args.group_id
    )
}

// ── Subcommands ───────────────────────────────────────────────────────────────

async fn run(args: RunArgs) -> Result<()> {
    print_banner();
    let store  = open_store(&args.store).await?;
    let source = open_source(&args).await?;

    let cfg = PipelineConfig {
        source_id:         args.source_id.clone(),
        batch_interval_ms: args.batch_interval_ms,
        max_batch:         args.max_batch,
        fraud_threshold:   args.fraud_threshold,
        ..PipelineConfig::default()
    };
    let writer_cfg = WriterConfig {
        key_prefix:     args.store.key_prefix.clone(),
        retention_days: args.retention_days,
        alert_log_cap:  args.alert_log_cap,
        retry:          RetryPolicy::default(),
        ..WriterConfig::default()
    };
    let dispatcher = Dispatcher::new(args.output.clone())?;
    if let Some(out) = &args.output {
        println!("  Output: \x1b[90m{}\x1b[0m", out.display());
    }

    let pipeline = Pipeline::new(source, store, writer_cfg, cfg.clone(), dispatcher);
    tokio::spawn(stats_loop(
        pipeline.stats(),
        Duration::from_secs(cfg.stats_interval_secs),
        Instant::now(),
    ));

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, finishing in-flight batch");
            tx.send(true).ok();
        }
    });

    println!("  Press Ctrl+C to stop.\n");
    let totals = pipeline.run(rx).await?;
    println!("\n{}", serde_json::to_string_pretty(&totals)?);
    Ok(())
}

async fn score(path: PathBuf, explain: bool) -> Result<()> {
    let content = tokio::fs::read_to_string(&path).await
        .with_context(|| format!("cannot read {}", path.display()))?;

    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() { continue; }
        let trip = match TripEvent::from_json(line.as_bytes()) {
            Ok(t) => t,
            Err(e) => { warn!("line {}: {}", n + 1, e); continue; }
        };
        if explain {
            print_explained(trip);
        } else {
            println!("{}", serde_json::to_string(&fareguard::score_trip(trip))?);
        }
    }
    Ok(())
}

async fn snapshot(date: Option<NaiveDate>, top: usize, args: StoreArgs) -> Result<()> {
    let store  = open_store(&args).await?;
    let reader = StoreReader::new(store, Keys::new(args.key_prefix.clone()));
    let date   = date.unwrap_or_else(|| Utc::now().date_naive());
    let snap   = reader.snapshot(date, top).await?;
    println!("{}", serde_json::to_string_pretty(&snap)?);
    Ok(())
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_banner() {
    println!("\n  \x1b[1mfareguard\x1b[0m \x1b[90mv{}\x1b[0m", env!("CARGO_PKG_VERSION"));
    println!("  \x1b[90mStreaming trip fraud scoring | Rust + Redis\x1b[0m\n");
}

fn print_explained(trip: TripEvent) {
    let enriched = enrich::enrich(trip);
    let rules    = scorer::explain(&enriched);
    let scored   = ScoredTrip { assessment: scorer::assess(&enriched), enriched };
    let tier     = scored.assessment.tier();
    let color = match tier {
        RiskTier::Critical => "\x1b[91;1m",
        RiskTier::High     => "\x1b[93;1m",
        RiskTier::Medium   => "\x1b[96m",
        RiskTier::Low      => "\x1b[92m",
    };
    let reset = "\x1b[0m";
    let e     = &scored.enriched;

    println!("{}{} {}{}  score={}", color, tier, e.trip.trip_id, reset, scored.assessment.score);
    println!("  {:.1} mi in {:.1} min ({:.1} mph)  fare=${:.2}  tip={:.0}%  {}→{}",
             e.trip.trip_distance, e.duration_min, e.speed_mph, e.trip.fare_amount,
             e.tip_pct, e.trip.pickup_zone, e.trip.dropoff_zone);
    for rule in rules {
        println!("    +{:<3} {}", rule.points, rule.name);
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("fareguard=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json)?;

    match cli.command {
        Command::Run(args)                    => run(args).await,
        Command::Score { path, explain }      => score(path, explain).await,
        Command::Snapshot { date, top, store } => snapshot(date, top, store).await,
    }
}
