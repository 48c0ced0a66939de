//! `ttt`: terminal front end for the tic-tac-toe AI backend.
//!
//! Host binaries should go through [`run_cli`]; [`run_history`] and
//! [`run_game`] execute single commands against an already opened ledger and
//! return the rendered output.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tictactoe_game_client::{
    GameBackend, GameSession, GameState, HttpGameBackend, OutcomeSource, PredictionPayload,
    SessionConfig,
};
use tictactoe_ledger_core::{
    format_confidence, LedgerConfig, LedgerSnapshot, LedgerStore, MemoryStore, PredictionLedger,
    Statistics, DEFAULT_CAPACITY, DEFAULT_STORAGE_KEY,
};
use tictactoe_ledger_store_sqlite::SqliteLedgerStore;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ttt")]
#[command(about = "Tic-tac-toe client with a persistent AI prediction ledger")]
pub struct Cli {
    #[arg(long, default_value = "./tictactoe_ledger.sqlite3")]
    db: PathBuf,

    /// Keep the ledger in memory only.
    #[arg(long)]
    no_persist: bool,

    #[arg(long, default_value = DEFAULT_STORAGE_KEY)]
    storage_key: String,

    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,

    #[arg(long, default_value = "http://127.0.0.1:5000")]
    server: String,

    #[arg(long, default_value_t = 5_000)]
    timeout_ms: u64,

    /// Do not record predictions made while the game is still running.
    #[arg(long)]
    skip_unresolved: bool,

    #[arg(long, value_enum, default_value_t = OutcomeSourceArg::Winner)]
    outcome_source: OutcomeSourceArg,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    Game {
        /// Print the raw game state as JSON.
        #[arg(long)]
        json: bool,
        #[command(subcommand)]
        command: GameCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    Show {
        #[arg(long)]
        json: bool,
    },
    Stats {
        #[arg(long)]
        json: bool,
    },
    Clear {
        /// Confirm wiping the prediction history.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum GameCommand {
    State,
    Move(MoveArgs),
    AiMove,
    Reset,
}

#[derive(Debug, Args)]
pub struct MoveArgs {
    /// Board cell, 0..=8 row by row.
    #[arg(long)]
    position: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum OutcomeSourceArg {
    Winner,
    GroundTruth,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Cli {
    /// Installs the tracing subscriber described by `-v`, `--log-format` and
    /// `--log-file`.
    ///
    /// # Errors
    /// Returns an error when the log file cannot be opened or a global
    /// subscriber is already installed.
    pub fn init_logging(&self) -> Result<()> {
        init_logging(self.verbose, self.log_file.as_deref(), self.log_format)
    }

    fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            capacity: self.capacity,
            storage_key: self.storage_key.clone(),
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            server_url: self.server.clone(),
            timeout_ms: self.timeout_ms,
            record_unresolved: !self.skip_unresolved,
            outcome_source: match self.outcome_source {
                OutcomeSourceArg::Winner => OutcomeSource::Winner,
                OutcomeSourceArg::GroundTruth => OutcomeSource::GroundTruth,
            },
        }
    }
}

/// Installs a global `tracing` subscriber. `RUST_LOG` overrides `verbosity`.
///
/// # Errors
/// Returns an error when the log file cannot be opened or a subscriber is
/// already installed.
pub fn init_logging(verbosity: u8, log_file: Option<&Path>, format: LogFormat) -> Result<()> {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tictactoe_ledger_core={level},tictactoe_ledger_store_sqlite={level},tictactoe_game_client={level},tictactoe_ledger_cli={level}"
        ))
    });

    let installed = match (log_file, format) {
        (None, LogFormat::Text) => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(verbosity >= 2)
                    .with_line_number(verbosity >= 2),
            )
            .try_init(),
        (None, LogFormat::Json) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        (Some(path), format) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            match format {
                LogFormat::Text => tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        fmt::layer()
                            .with_writer(Mutex::new(file))
                            .with_ansi(false)
                            .with_target(true),
                    )
                    .try_init(),
                LogFormat::Json => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json().with_writer(Mutex::new(file)))
                    .try_init(),
            }
        }
    };

    installed.map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}

/// Executes a parsed command line and prints its output.
///
/// # Errors
/// Returns an error when the ledger cannot be opened or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let ledger_config = cli.ledger_config();
    let session_config = cli.session_config();

    let output = if cli.no_persist {
        let mut ledger = PredictionLedger::open(MemoryStore::new(), ledger_config)?;
        execute(cli.command, &mut ledger, &session_config)?
    } else {
        let store = SqliteLedgerStore::open(&cli.db)?;
        store.migrate()?;
        let mut ledger = PredictionLedger::open(store, ledger_config)?;
        execute(cli.command, &mut ledger, &session_config)?
    };

    print!("{output}");
    Ok(())
}

fn execute<S: LedgerStore>(
    command: Command,
    ledger: &mut PredictionLedger<S>,
    session_config: &SessionConfig,
) -> Result<String> {
    match command {
        Command::History { command } => run_history(command, ledger),
        Command::Game { json, command } => {
            let backend = HttpGameBackend::new(session_config)?;
            let mut session = GameSession::new(backend, session_config.clone());
            run_game(command, json, &mut session, ledger)
        }
    }
}

/// # Errors
/// Returns an error when `clear` is not confirmed or output cannot be
/// serialized.
pub fn run_history<S: LedgerStore>(
    command: HistoryCommand,
    ledger: &mut PredictionLedger<S>,
) -> Result<String> {
    match command {
        HistoryCommand::Show { json } => {
            let snapshot = ledger.snapshot();
            if json {
                return Ok(format!("{}\n", serde_json::to_string_pretty(&snapshot)?));
            }
            Ok(render_history(&snapshot)?)
        }
        HistoryCommand::Stats { json } => {
            let stats = ledger.stats();
            if json {
                let payload = json!({
                    "gamesPlayed": stats.games_played,
                    "predictionsTotal": stats.predictions_total,
                    "predictionsCorrect": stats.predictions_correct,
                    "accuracy": stats.accuracy(),
                    "accuracyPercent": stats.accuracy_percent(),
                });
                return Ok(format!("{}\n", serde_json::to_string_pretty(&payload)?));
            }
            Ok(render_stats(&stats))
        }
        HistoryCommand::Clear { yes } => {
            if !yes {
                return Err(anyhow!(
                    "refusing to clear prediction history without --yes"
                ));
            }
            ledger.clear();
            tracing::info!("prediction history cleared");
            Ok(format!(
                "Prediction history cleared ({} games played kept)\n",
                ledger.stats().games_played
            ))
        }
    }
}

/// # Errors
/// Returns an error when the backend call fails, a local move precondition
/// is violated, or a prediction cannot be recorded.
pub fn run_game<B: GameBackend, S: LedgerStore>(
    command: GameCommand,
    json: bool,
    session: &mut GameSession<B>,
    ledger: &mut PredictionLedger<S>,
) -> Result<String> {
    let state = match command {
        GameCommand::State => session.refresh()?.clone(),
        GameCommand::Move(args) => {
            session.refresh()?;
            session.play_move(args.position, ledger)?.clone()
        }
        GameCommand::AiMove => {
            session.refresh()?;
            session.play_ai_move(ledger)?.clone()
        }
        GameCommand::Reset => session.reset(ledger)?.clone(),
    };

    if json {
        return Ok(format!("{}\n", serde_json::to_string_pretty(&state)?));
    }
    Ok(render_game(&state, &ledger.stats())?)
}

/// Board with empty cells numbered and the winning line bracketed.
///
/// # Errors
/// Returns an error when writing to the output buffer fails.
pub fn render_board(state: &GameState) -> Result<String, std::fmt::Error> {
    let winning = state.winning_cells();
    let mut out = String::new();
    for row in 0..3 {
        let cells: Vec<String> = (0..3)
            .map(|col| {
                let position = row * 3 + col;
                let mark = state.cell(position);
                if mark.is_empty() {
                    format!(" {position} ")
                } else if winning.is_some_and(|line| line.contains(&position)) {
                    format!("[{mark}]")
                } else {
                    format!(" {mark} ")
                }
            })
            .collect();
        writeln!(out, "{}", cells.join("|"))?;
        if row < 2 {
            writeln!(out, "---+---+---")?;
        }
    }
    Ok(out)
}

/// # Errors
/// Returns an error when writing to the output buffer fails.
pub fn render_prediction(prediction: &PredictionPayload) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    writeln!(
        out,
        "AI prediction: {} ({}, {})",
        prediction.prediction.as_deref().unwrap_or("-"),
        format_confidence(prediction.confidence),
        prediction.model.as_deref().unwrap_or("unknown model"),
    )?;
    if let Some(ground_truth) = &prediction.ground_truth {
        writeln!(out, "  ground truth: {ground_truth}")?;
    }
    for (model, label) in &prediction.all_predictions {
        writeln!(out, "  {model}: {label}")?;
    }
    Ok(out)
}

fn render_game(state: &GameState, stats: &Statistics) -> Result<String, std::fmt::Error> {
    let mut out = render_board(state)?;
    writeln!(out)?;
    writeln!(out, "{}", state.status_line())?;
    writeln!(out, "{}", state.player_line())?;
    if let Some(prediction) = &state.prediction {
        out.push_str(&render_prediction(prediction)?);
    }
    writeln!(
        out,
        "Predictions: {}  Correct: {}  Accuracy: {}",
        stats.predictions_total,
        stats.predictions_correct,
        stats.accuracy_percent()
    )?;
    Ok(out)
}

#[must_use]
pub fn render_stats(stats: &Statistics) -> String {
    format!(
        "games played: {}\npredictions:  {}\ncorrect:      {}\naccuracy:     {}\n",
        stats.games_played,
        stats.predictions_total,
        stats.predictions_correct,
        stats.accuracy_percent()
    )
}

/// # Errors
/// Returns an error when writing to the output buffer fails.
pub fn render_history(snapshot: &LedgerSnapshot) -> Result<String, std::fmt::Error> {
    if snapshot.is_empty() {
        return Ok("No predictions yet. Play some games to see AI prediction history!\n".to_string());
    }

    let mut out = String::new();
    writeln!(
        out,
        "{:<5} {:<20} {:<22} {:<22} {:<10} confidence",
        "#", "game state", "predicted", "actual", "result"
    )?;
    writeln!(out, "{}", "-".repeat(92))?;
    for row in snapshot.history_rows() {
        writeln!(
            out,
            "{:<5} {:<20} {:<22} {:<22} {:<10} {}",
            row.rank,
            row.game_state,
            row.predicted_outcome,
            row.actual_outcome,
            row.badge(),
            row.confidence_percent
        )?;
    }
    Ok(out)
}
