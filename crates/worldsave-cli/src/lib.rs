//! CLI commands for worldsave
//!
//! - `inspect` / `list`: read records back from a storage root
//! - `sweep`: remove temp files abandoned by crashed writers
//! - `storm`: hammer the agent store with mutations and report how many of
//!   them were coalesced into actual writes

#![forbid(unsafe_code)]

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use worldsave_core::{Config, RECORD_KINDS, validate_kind};
use worldsave_storage::{StorageError, World, WorldStats};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

pub type CliResult<T> = Result<T, CliError>;

/// How long `storm` waits for the final flush.
const STORM_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "worldsave", version, about = "worldsave storage CLI")]
pub struct Cli {
    /// Storage root; overrides `WORLDSAVE_STORAGE_ROOT`.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print one stored record as JSON.
    Inspect { kind: String, id: String },
    /// List the ids stored for a record kind.
    List {
        kind: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove temp files left behind by interrupted writes.
    Sweep,
    /// Drive a write storm through the agent store and print coalescing stats.
    Storm {
        #[arg(long, default_value_t = 8)]
        keys: usize,
        #[arg(long, default_value_t = 1000)]
        mutations: usize,
        #[arg(long, default_value_t = 4)]
        threads: usize,
    },
}

#[derive(Debug, Serialize)]
struct StormReport {
    keys: usize,
    mutations: usize,
    threads: usize,
    elapsed_ms: u64,
    flushed: bool,
    stats: WorldStats,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

pub fn run() -> i32 {
    init_tracing();
    let cli = Cli::parse();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match execute(cli, &mut out) {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            err_exit_code(&err)
        }
    }
}

const fn err_exit_code(err: &CliError) -> i32 {
    match err {
        CliError::InvalidArgument(_) => 2,
        _ => 1,
    }
}

fn emit_error(err: &CliError) {
    eprintln!("error: {err}");
}

fn config_for(cli: &Cli) -> Config {
    let mut config = Config::from_env();
    if let Some(root) = &cli.root {
        config.storage_root.clone_from(root);
    }
    config
}

fn checked_kind(kind: &str) -> CliResult<&'static str> {
    validate_kind(kind).map_err(|err| {
        CliError::InvalidArgument(format!(
            "{err} (expected one of: {})",
            RECORD_KINDS.join(", ")
        ))
    })
}

pub fn execute(cli: Cli, out: &mut impl Write) -> CliResult<()> {
    let config = config_for(&cli);
    match cli.command {
        Commands::Inspect { kind, id } => handle_inspect(&config, &kind, &id, out),
        Commands::List { kind, json } => handle_list(&config, &kind, json, out),
        Commands::Sweep => handle_sweep(&config, out),
        Commands::Storm {
            keys,
            mutations,
            threads,
        } => handle_storm(&config, keys, mutations, threads, out),
    }
}

fn handle_inspect(config: &Config, kind: &str, id: &str, out: &mut impl Write) -> CliResult<()> {
    let kind = checked_kind(kind)?;
    let world = World::open(config)?;
    let value = world
        .record_json(kind, id)?
        .ok_or_else(|| CliError::InvalidArgument(format!("unknown kind {kind:?}")))?;
    writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
    Ok(())
}

fn handle_list(config: &Config, kind: &str, json: bool, out: &mut impl Write) -> CliResult<()> {
    let kind = checked_kind(kind)?;
    let world = World::open(config)?;
    let ids = world.ids_of(kind).unwrap_or_default();
    if json {
        writeln!(out, "{}", serde_json::to_string(&ids)?)?;
    } else {
        for id in &ids {
            writeln!(out, "{id}")?;
        }
    }
    Ok(())
}

fn handle_sweep(config: &Config, out: &mut impl Write) -> CliResult<()> {
    let world = World::open(config)?;
    let removed = world.sweep_temp_files()?;
    tracing::info!(root = %world.root().display(), removed, "sweep complete");
    writeln!(out, "removed {removed} stale temp file(s)")?;
    Ok(())
}

fn handle_storm(
    config: &Config,
    keys: usize,
    mutations: usize,
    threads: usize,
    out: &mut impl Write,
) -> CliResult<()> {
    if keys == 0 || threads == 0 {
        return Err(CliError::InvalidArgument(
            "--keys and --threads must be at least 1".to_string(),
        ));
    }

    let world = Arc::new(World::open(config)?);
    let ids: Arc<Vec<String>> = Arc::new((0..keys).map(|i| format!("storm-{i}")).collect());
    for id in ids.iter() {
        world.agents.get_or_create(id)?;
    }

    tracing::info!(keys, mutations, threads, "starting write storm");
    let started = Instant::now();
    let handles = (0..threads)
        .map(|t| {
            let world = Arc::clone(&world);
            let ids = Arc::clone(&ids);
            std::thread::Builder::new()
                .name(format!("storm-{t}"))
                .spawn(move || -> Result<(), StorageError> {
                    for n in (t..mutations).step_by(threads) {
                        let id = &ids[n % ids.len()];
                        world
                            .agents
                            .update(id, |agent| agent.memories.push(format!("storm mutation {n}")))?;
                    }
                    Ok(())
                })
        })
        .collect::<io::Result<Vec<_>>>()?;

    for handle in handles {
        handle
            .join()
            .map_err(|_| CliError::Other("storm thread panicked".to_string()))??;
    }

    let flushed = world.flush_all(STORM_FLUSH_TIMEOUT);
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    if !flushed {
        tracing::warn!(elapsed_ms, "storm flush timed out");
    }

    let report = StormReport {
        keys,
        mutations,
        threads,
        elapsed_ms,
        flushed,
        stats: world.stats(),
    };
    writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
    if flushed {
        Ok(())
    } else {
        Err(CliError::Other("timed out flushing pending saves".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("valid arguments")
    }

    fn run_in(root: &std::path::Path, args: &[&str]) -> (CliResult<()>, String) {
        let mut argv = vec!["worldsave", "--root", root.to_str().unwrap()];
        argv.extend_from_slice(args);
        let mut out = Vec::new();
        let result = execute(parse(&argv), &mut out);
        (result, String::from_utf8(out).unwrap())
    }

    #[test]
    fn parses_storm_defaults_and_overrides() {
        let cli = parse(&["worldsave", "storm"]);
        assert!(matches!(
            cli.command,
            Commands::Storm {
                keys: 8,
                mutations: 1000,
                threads: 4
            }
        ));

        let cli = parse(&["worldsave", "storm", "--keys", "2", "--mutations", "50"]);
        assert!(matches!(
            cli.command,
            Commands::Storm {
                keys: 2,
                mutations: 50,
                ..
            }
        ));
    }

    #[test]
    fn root_flag_is_global() {
        let cli = parse(&["worldsave", "list", "agents", "--root", "/tmp/w"]);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/w")));
        assert_eq!(config_for(&cli).storage_root, PathBuf::from("/tmp/w"));
    }

    #[test]
    fn inspect_requires_kind_and_id() {
        assert!(Cli::try_parse_from(["worldsave", "inspect", "agents"]).is_err());
    }

    #[test]
    fn unknown_kind_is_invalid_argument() {
        let tmp = TempDir::new().unwrap();
        let (result, _) = run_in(tmp.path(), &["list", "dragons"]);
        let err = result.unwrap_err();
        assert!(matches!(err, CliError::InvalidArgument(_)));
        assert_eq!(err_exit_code(&err), 2);
        // Rejected before any store directory is created.
        assert!(!tmp.path().join("agents").exists());
    }

    #[test]
    fn storm_then_list_and_inspect() {
        let tmp = TempDir::new().unwrap();
        let (result, out) = run_in(
            tmp.path(),
            &["storm", "--keys", "3", "--mutations", "60", "--threads", "2"],
        );
        result.unwrap();
        let report: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(report["flushed"], true);
        let agents = &report["stats"]["stores"]["agents"];
        // 3 creates + 60 updates.
        assert_eq!(agents["requests"], 63);
        assert!(agents["flushes"].as_u64().unwrap() <= 63);

        let (result, out) = run_in(tmp.path(), &["list", "agents"]);
        result.unwrap();
        assert_eq!(out, "storm-0\nstorm-1\nstorm-2\n");

        let (result, out) = run_in(tmp.path(), &["list", "agents", "--json"]);
        result.unwrap();
        assert_eq!(out.trim(), r#"["storm-0","storm-1","storm-2"]"#);

        let (result, out) = run_in(tmp.path(), &["inspect", "agents", "storm-1"]);
        result.unwrap();
        let agent: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(agent["id"], "storm-1");
        assert_eq!(agent["memories"].as_array().unwrap().len(), 20);
    }

    #[test]
    fn inspect_missing_record_is_a_storage_error() {
        let tmp = TempDir::new().unwrap();
        let (result, _) = run_in(tmp.path(), &["inspect", "users", "nobody"]);
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            CliError::Storage(StorageError::NotFound { .. })
        ));
        assert_eq!(err_exit_code(&err), 1);
    }

    #[test]
    fn sweep_reports_removed_count() {
        let tmp = TempDir::new().unwrap();
        let agents = tmp.path().join("agents");
        fs::create_dir_all(&agents).unwrap();
        let foreign = std::process::id().wrapping_add(1);
        fs::write(agents.join(format!("a.json.{foreign}.tmp")), "{").unwrap();

        let (result, out) = run_in(tmp.path(), &["sweep"]);
        result.unwrap();
        assert_eq!(out, "removed 1 stale temp file(s)\n");
    }

    #[test]
    fn storm_rejects_zero_keys() {
        let tmp = TempDir::new().unwrap();
        let (result, _) = run_in(tmp.path(), &["storm", "--keys", "0"]);
        assert!(matches!(result, Err(CliError::InvalidArgument(_))));
    }
}
