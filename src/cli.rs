use crate::config::types::{ExecutorConfig, GameConfig};
use crate::executor::AgentExecutor;
use crate::game::{run_game, GameManifest};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG still wins when set)
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Game configuration file (defaults to ./bidbox.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play one game from a manifest and print the result as JSON
    Run {
        /// Game manifest: teams, valuations and auction sequence
        #[arg(long)]
        manifest: PathBuf,
        /// Per-call timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Initial budget for every team
        #[arg(long)]
        budget: Option<f64>,
        /// Number of rounds to play
        #[arg(long)]
        rounds: Option<usize>,
        /// Write the result here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
        /// Append security audit events to this JSONL file
        #[arg(long)]
        audit_log: Option<PathBuf>,
    },
    /// Register every team in a manifest without playing
    Validate {
        #[arg(long)]
        manifest: PathBuf,
    },
}

extern "C" fn signal_handler(sig: i32) {
    // Only async-signal-safe calls here. Guests die with us via PDEATHSIG.
    let msg = b"bidbox: signal received, exiting\n";
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(128 + sig);
    }
}

fn setup_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as usize);
        libc::signal(libc::SIGINT, signal_handler as usize);
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

fn load_config(path: Option<&Path>) -> Result<GameConfig> {
    let config = match path {
        Some(path) => GameConfig::load_from_file(path)?,
        None => GameConfig::load_default()?,
    };
    Ok(config)
}

fn build_overridden_config(
    base: &GameConfig,
    timeout_ms: Option<u64>,
    budget: Option<f64>,
    rounds: Option<usize>,
) -> GameConfig {
    let mut config = base.clone();
    if let Some(timeout_ms) = timeout_ms {
        config.executor.call_timeout_ms = timeout_ms;
    }
    if let Some(budget) = budget {
        config.initial_budget = budget;
    }
    if let Some(rounds) = rounds {
        config.rounds = rounds;
    }
    config
}

pub fn run() -> Result<()> {
    setup_signal_handlers();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if !cfg!(target_os = "linux") {
        eprintln!("Error: bidbox requires Linux for its isolation controls");
        std::process::exit(1);
    }

    let base = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            manifest,
            timeout_ms,
            budget,
            rounds,
            output,
            audit_log,
        } => {
            if let Some(path) = audit_log {
                crate::observability::audit::init_security_logger(&path)?;
            }
            let config = build_overridden_config(&base, timeout_ms, budget, rounds);
            let manifest = GameManifest::load_from_file(&manifest)?;

            let result = match run_game(config, manifest) {
                Ok(result) => result,
                Err(e) => {
                    eprintln!("Game failed: {}", e);
                    std::process::exit(1);
                }
            };

            let json = serde_json::to_string_pretty(&result)?;
            match output {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("writing result to {}", path.display()))?,
                None => println!("{}", json),
            }
        }
        Commands::Validate { manifest } => {
            let manifest = GameManifest::load_from_file(&manifest)?;
            if !validate_manifest(base.executor, base.initial_budget, &manifest) {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Registration-only dry run. Returns true when every team passes.
fn validate_manifest(config: ExecutorConfig, budget: f64, manifest: &GameManifest) -> bool {
    let mut executor = AgentExecutor::new(config);
    let mut all_ok = true;
    for (team_id, code) in &manifest.teams {
        let valuations = manifest.valuations.get(team_id).cloned().unwrap_or_default();
        match executor.register(
            team_id,
            code,
            valuations,
            budget,
            manifest.opponents_of(team_id),
        ) {
            Ok(_) => println!("{:20} ok", team_id),
            Err(e) => {
                all_ok = false;
                println!("{:20} FAILED: {}", team_id, e);
            }
        }
    }
    all_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_only_given_values() {
        let base = GameConfig::default();
        let config = build_overridden_config(&base, Some(500), None, Some(3));
        assert_eq!(config.executor.call_timeout_ms, 500);
        assert_eq!(config.initial_budget, 60.0);
        assert_eq!(config.rounds, 3);
    }

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::try_parse_from([
            "bidbox",
            "run",
            "--manifest",
            "game.json",
            "--timeout-ms",
            "250",
            "--verbose",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                manifest,
                timeout_ms,
                ..
            } => {
                assert_eq!(manifest, PathBuf::from("game.json"));
                assert_eq!(timeout_ms, Some(250));
            }
            Commands::Validate { .. } => panic!("parsed the wrong subcommand"),
        }
    }

    #[test]
    fn run_requires_manifest() {
        assert!(Cli::try_parse_from(["bidbox", "run"]).is_err());
    }
}
