use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use services::{
    Clock, ExperimentFactory, ExperimentFactoryError, HostHandle, JoinOutcome, LobbyConfig,
    PlacedGroup, PoolConfig, QuizConfig, ServerConfig, ServerError, SessionServer,
    SessionTracker, StatusMap,
};
use storage::repository::Storage;
use storage::sqlite::StoreOptions;
use tracing_subscriber::EnvFilter;
use turk_core::model::{AssignmentId, ExperimentId, HitId, HitWorkerGroup, SetId, WorkerId};

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidNumber { flag: &'static str, raw: String },
    InvalidDbUrl { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidNumber { flag, raw } => write!(f, "invalid {flag} value: {raw}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn parse_number<T: std::str::FromStr>(flag: &'static str, raw: String) -> Result<T, ArgsError> {
    raw.trim()
        .parse()
        .map_err(|_| ArgsError::InvalidNumber { flag, raw })
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- simulate [options]");
    eprintln!("  cargo run -p app -- summary  [--db <sqlite_url>] [--set-id <id>]");
    eprintln!("  cargo run -p app -- expire   [--db <sqlite_url>] [--set-id <id>]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --db <sqlite_url>     default sqlite:turk.sqlite3");
    eprintln!("  --set-id <id>         default \"default\"");
    eprintln!("  --group-size <n>      default 3");
    eprintln!("  --workers <n>         simulated arrivals, default 30");
    eprintln!("  --pass-rate <0..1>    enables the percentage quiz policy");
    eprintln!("  --max-fails <n>       failed quizzes allowed, default 1");
    eprintln!("  --rounds <n>          rounds per simulated experiment, default 2");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  TURK_DB_URL, TURK_SET_ID, TURK_GROUP_SIZE, TURK_WORKERS,");
    eprintln!("  TURK_PASS_RATE, TURK_MAX_FAILS, RUST_LOG");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Simulate,
    Summary,
    Expire,
}

impl Command {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "simulate" => Some(Self::Simulate),
            "summary" => Some(Self::Summary),
            "expire" => Some(Self::Expire),
            _ => None,
        }
    }
}

struct Args {
    db_url: String,
    set_id: SetId,
    group_size: usize,
    workers: usize,
    pass_rate: Option<f64>,
    max_fails: u32,
    rounds: u32,
}

impl Args {
    fn parse(args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut parsed = Self {
            db_url: normalize_sqlite_url(
                std::env::var("TURK_DB_URL").unwrap_or_else(|_| "sqlite:turk.sqlite3".into()),
            ),
            set_id: std::env::var("TURK_SET_ID")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map_or_else(|| SetId::new("default"), SetId::new),
            group_size: env_number("TURK_GROUP_SIZE").unwrap_or(3),
            workers: env_number("TURK_WORKERS").unwrap_or(30),
            pass_rate: env_number("TURK_PASS_RATE"),
            max_fails: env_number("TURK_MAX_FAILS").unwrap_or(1),
            rounds: 2,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    parsed.db_url = normalize_sqlite_url(value);
                }
                "--set-id" => parsed.set_id = SetId::new(require_value(args, "--set-id")?),
                "--group-size" => {
                    parsed.group_size =
                        parse_number("--group-size", require_value(args, "--group-size")?)?;
                }
                "--workers" => {
                    parsed.workers = parse_number("--workers", require_value(args, "--workers")?)?;
                }
                "--pass-rate" => {
                    parsed.pass_rate = Some(parse_number(
                        "--pass-rate",
                        require_value(args, "--pass-rate")?,
                    )?);
                }
                "--max-fails" => {
                    parsed.max_fails =
                        parse_number("--max-fails", require_value(args, "--max-fails")?)?;
                }
                "--rounds" => {
                    parsed.rounds = parse_number("--rounds", require_value(args, "--rounds")?)?;
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(parsed)
    }

    fn server_config(&self) -> ServerConfig {
        let quiz = self
            .pass_rate
            .map_or(QuizConfig::Disabled, |pass_rate| QuizConfig::Percentage {
                pass_rate,
                max_fails: self.max_fails,
            });
        ServerConfig::default()
            .with_set_id(self.set_id.clone())
            .with_lobby(LobbyConfig::default().with_group_size(self.group_size))
            .with_pool(PoolConfig::default().with_prewarm_interval(Duration::from_millis(200)))
            .with_quiz(quiz)
    }
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }
    Ok(())
}

//
// ─── SIMULATION ────────────────────────────────────────────────────────────────
//

/// A table of seats standing in for a real experiment.
struct Table {
    seats: Vec<WorkerId>,
}

struct SimulatedFactory {
    size: usize,
}

impl ExperimentFactory for SimulatedFactory {
    type Instance = Table;

    fn experiment_size(&self) -> usize {
        self.size
    }

    fn create(&self) -> Result<Table, ExperimentFactoryError> {
        Ok(Table {
            seats: Vec::with_capacity(self.size),
        })
    }

    fn bind(
        &self,
        instance: &mut Table,
        host: &HostHandle,
        group: &HitWorkerGroup,
        experiment_id: ExperimentId,
    ) -> Result<(), ExperimentFactoryError> {
        instance.seats = group.worker_ids().cloned().collect();
        tracing::debug!(
            host = host.name(),
            %experiment_id,
            seats = instance.seats.len(),
            "table bound"
        );
        Ok(())
    }
}

fn ready_status() -> StatusMap {
    StatusMap::from([("ready".to_string(), true.into())])
}

/// One simulated worker: connect, pass the quiz if asked, get ready.
async fn arrive(
    server: Arc<SessionServer<SimulatedFactory>>,
    n: usize,
) -> Result<Vec<PlacedGroup>, ServerError> {
    let pause = rand::rng().random_range(0..20);
    tokio::time::sleep(Duration::from_millis(pause)).await;

    let set = server.config().set_id.clone();
    let worker = server
        .connect(
            &HitId::new(format!("{set}-HIT-{n}")),
            &AssignmentId::new(format!("{set}-ASSIGNMENT-{n}")),
            &WorkerId::new(format!("{set}-WORKER-{n}")),
        )
        .await?;

    let mut placed = Vec::new();
    let mut event = server.enter_lobby(worker.connection(), None).await?;
    placed.append(&mut event.dispatch.placed);
    loop {
        match event.outcome {
            JoinOutcome::Admitted(_) | JoinOutcome::AlreadyGrouped => break,
            JoinOutcome::QuizRequired => {
                let correct = rand::rng().random_range(2..=5);
                event = server.submit_quiz(worker.connection(), correct, 5).await?;
                placed.append(&mut event.dispatch.placed);
            }
            JoinOutcome::LockedOut | JoinOutcome::Closed => {
                tracing::info!(hit_id = %worker.hit_id(), "worker turned away");
                server.disconnect(worker.connection())?;
                return Ok(placed);
            }
        }
    }

    let pause = rand::rng().random_range(0..20);
    tokio::time::sleep(Duration::from_millis(pause)).await;
    let mut update = server.update_status(worker.connection(), &ready_status()).await?;
    placed.append(&mut update.dispatch.placed);
    Ok(placed)
}

async fn run_experiment(
    server: &SessionServer<SimulatedFactory>,
    group: &PlacedGroup,
    rounds: u32,
) -> Result<(), ServerError> {
    for round in 1..=rounds {
        server.start_round(group.experiment_id, round).await?;
        server
            .round_input(group.experiment_id, round, &format!("{{\"round\":{round}}}"))
            .await?;
        server
            .end_round(group.experiment_id, round, "{\"status\":\"ok\"}")
            .await?;
    }
    let inactivity: Vec<(HitId, f64)> = group
        .hit_ids
        .iter()
        .map(|hit_id| (hit_id.clone(), rand::rng().random_range(0.0..0.3)))
        .collect();
    let report = server
        .experiment_finished(group.experiment_id, &inactivity, "{\"status\":\"finished\"}")
        .await?;
    for (hit_id, error) in &report.failed {
        tracing::warn!(hit_id = %hit_id, error = %error, "session not completed");
    }
    Ok(())
}

async fn simulate(args: &Args, storage: Storage) -> Result<(), Box<dyn std::error::Error>> {
    let factory = SimulatedFactory {
        size: args.group_size,
    };
    let server = Arc::new(SessionServer::new(
        args.server_config(),
        storage,
        factory,
        Clock::system(),
    )?);
    let prewarm = server.start().await?;

    let arrivals: Vec<_> = (1..=args.workers)
        .map(|n| tokio::spawn(arrive(Arc::clone(&server), n)))
        .collect();
    let mut groups = Vec::new();
    for arrival in arrivals {
        match arrival.await? {
            Ok(mut placed) => groups.append(&mut placed),
            Err(e) => tracing::warn!(error = %e, "simulated worker failed"),
        }
    }

    for group in &groups {
        run_experiment(&server, group, args.rounds).await?;
    }

    let waiting = server.shutdown();
    prewarm.await?;

    let summary = server.summary().await?;
    let stats = server.pool_stats();
    println!(
        "set {}: {} experiments, {} left waiting",
        summary.set_id,
        groups.len(),
        waiting.len()
    );
    println!(
        "sessions: created={} assigned={} completed={} submitted={}",
        summary.created, summary.assigned, summary.completed, summary.submitted
    );
    println!(
        "pool: created={} cache_hits={} cache_misses={} failures={}",
        stats.created, stats.cache_hits, stats.cache_misses, stats.failures
    );
    Ok(())
}

fn tracker(args: &Args, storage: &Storage) -> SessionTracker {
    SessionTracker::new(
        args.set_id.clone(),
        Clock::system(),
        Arc::clone(&storage.sessions),
        Arc::clone(&storage.quizzes),
    )
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut argv = std::env::args().skip(1);
    let cmd = match argv.next() {
        None => {
            print_usage();
            return Ok(());
        }
        Some(first) if first == "--help" || first == "-h" => {
            print_usage();
            return Ok(());
        }
        Some(first) => Command::from_arg(&first).ok_or_else(|| {
            print_usage();
            ArgsError::UnknownArg(first)
        })?,
    };

    let args = Args::parse(&mut argv).map_err(|e| {
        print_usage();
        e
    })?;

    prepare_sqlite_file(&args.db_url)?;
    let storage =
        Storage::sqlite_for_set(&args.db_url, &StoreOptions::default(), &args.set_id).await?;

    match cmd {
        Command::Simulate => simulate(&args, storage).await,
        Command::Summary => {
            let tracker = tracker(&args, &storage);
            let summary = tracker.summary().await?;
            println!(
                "set {}: created={} assigned={} completed={} submitted={}",
                summary.set_id,
                summary.created,
                summary.assigned,
                summary.completed,
                summary.submitted
            );
            for record in tracker.list_completed().await? {
                println!(
                    "  {} worker={} inactive={:.2}",
                    record.hit_id(),
                    record.worker_id().map_or("-", WorkerId::as_str),
                    record.inactive_percent().unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Expire => {
            let expired = tracker(&args, &storage).expire_unused().await?;
            println!("expired {} unused sessions in {}", expired.len(), args.set_id);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
