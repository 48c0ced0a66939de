//! Prediction ledger for the tic-tac-toe AI client.
//!
//! The ledger keeps a bounded, newest-first record of the predictions the
//! server-side model made during play, together with running accuracy
//! counters, and flushes both to a [`LedgerStore`] after every mutation.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

pub const DEFAULT_CAPACITY: usize = 50;
pub const DEFAULT_STORAGE_KEY: &str = "tic-tac-toe-history";
pub const UNKNOWN_OUTCOME: &str = "Unknown";
pub const DRAW_OUTCOME: &str = "Draw";

/// Index triples of the eight winning lines (rows, columns, diagonals).
pub const WINNING_LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Client-local key-value storage the ledger persists into.
pub trait LedgerStore {
    /// Reads the blob stored under `key`, if any.
    ///
    /// # Errors
    /// Returns [`LedgerError::Persistence`] when the backing storage cannot be read.
    fn load(&self, key: &str) -> Result<Option<String>, LedgerError>;

    /// Replaces the blob stored under `key`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Persistence`] when the backing storage rejects the write.
    fn save(&mut self, key: &str, blob: &str) -> Result<(), LedgerError>;
}

/// In-process store, used by tests and when persistence is disabled.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, blob: &str) {
        self.entries.insert(key.to_string(), blob.to_string());
    }
}

impl LedgerStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>, LedgerError> {
        Ok(self.entries.get(key).cloned())
    }

    fn save(&mut self, key: &str, blob: &str) -> Result<(), LedgerError> {
        self.insert(key, blob);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    pub capacity: usize,
    pub storage_key: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

impl LedgerConfig {
    /// Validates capacity and storage key.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when capacity is zero or the
    /// storage key is blank.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.capacity == 0 {
            return Err(LedgerError::Configuration(
                "capacity MUST be >= 1".to_string(),
            ));
        }

        if self.storage_key.trim().is_empty() {
            return Err(LedgerError::Configuration(
                "storage_key MUST be provided".to_string(),
            ));
        }

        Ok(())
    }
}

/// Prediction observed in a server response, before it enters the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionEvent {
    pub game_state: String,
    pub predicted_outcome: Option<String>,
    pub confidence: f64,
    pub model_name: String,
    pub actual_outcome: Option<String>,
}

impl PredictionEvent {
    /// Checks the event against the `record` contract.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidRecord`] when the predicted or actual
    /// outcome is missing or the confidence is outside `[0.0, 1.0]`.
    pub fn validate(&self) -> Result<(), LedgerError> {
        match self.predicted_outcome.as_deref() {
            Some(label) if !label.trim().is_empty() => {}
            _ => {
                return Err(LedgerError::InvalidRecord(
                    "predicted_outcome MUST be provided".to_string(),
                ))
            }
        }

        match self.actual_outcome.as_deref() {
            Some(label) if !label.trim().is_empty() => {}
            _ => {
                return Err(LedgerError::InvalidRecord(
                    "actual_outcome MUST be provided (use \"Unknown\" for unresolved games)"
                        .to_string(),
                ))
            }
        }

        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(LedgerError::InvalidRecord(
                "confidence MUST be in [0.0, 1.0]".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "gameState", default = "unknown_label")]
    pub game_state: String,
    #[serde(rename = "prediction")]
    pub predicted_outcome: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(rename = "model", default)]
    pub model_name: String,
    #[serde(rename = "actualResult", default = "unknown_label")]
    pub actual_outcome: String,
    #[serde(rename = "isCorrect", default)]
    pub is_correct: bool,
}

fn unknown_label() -> String {
    UNKNOWN_OUTCOME.to_string()
}

impl PredictionRecord {
    /// Decodes one persisted history entry field by field.
    ///
    /// Returns `None` only when `value` is not an object or carries no
    /// `prediction` string; any other malformed field falls back to its
    /// default (timestamp to the Unix epoch).
    fn from_json(value: &Value) -> Option<Self> {
        let entry = value.as_object()?;
        let predicted_outcome = entry.get("prediction").and_then(Value::as_str)?.to_string();
        let text = |name: &str| entry.get(name).and_then(Value::as_str).map(str::to_string);

        Some(Self {
            timestamp: entry
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            game_state: text("gameState").unwrap_or_else(unknown_label),
            predicted_outcome,
            confidence: entry
                .get("confidence")
                .and_then(Value::as_f64)
                .filter(|confidence| (0.0..=1.0).contains(confidence))
                .unwrap_or(0.0),
            model_name: text("model").unwrap_or_default(),
            actual_outcome: text("actualResult").unwrap_or_else(unknown_label),
            is_correct: entry
                .get("isCorrect")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub games_played: u64,
    pub predictions_total: u64,
    pub predictions_correct: u64,
}

impl Statistics {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn accuracy(&self) -> f64 {
        if self.predictions_total == 0 {
            return 0.0;
        }
        self.predictions_correct as f64 / self.predictions_total as f64
    }

    /// Accuracy as a percentage with one decimal, e.g. `"66.7%"`.
    #[must_use]
    pub fn accuracy_percent(&self) -> String {
        format!("{:.1}%", self.accuracy() * 100.0)
    }

    fn from_json(value: &Value) -> Self {
        let field = |name: &str| value.get(name).and_then(Value::as_u64).unwrap_or(0);
        Self {
            games_played: field("gamesPlayed"),
            predictions_total: field("predictionsTotal"),
            predictions_correct: field("predictionsCorrect"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerSnapshot {
    pub records: Vec<PredictionRecord>,
    pub stats: Statistics,
}

/// One row of the history table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryRow {
    pub rank: u64,
    pub game_state: String,
    pub predicted_outcome: String,
    pub actual_outcome: String,
    pub is_correct: bool,
    pub confidence_percent: String,
}

impl HistoryRow {
    #[must_use]
    pub fn badge(&self) -> &'static str {
        if self.is_correct {
            "Correct"
        } else {
            "Incorrect"
        }
    }
}

impl LedgerSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows for the history table, ranked from `predictions_total` downward.
    #[must_use]
    pub fn history_rows(&self) -> Vec<HistoryRow> {
        self.records
            .iter()
            .enumerate()
            .map(|(index, record)| HistoryRow {
                rank: self
                    .stats
                    .predictions_total
                    .saturating_sub(u64::try_from(index).unwrap_or(u64::MAX)),
                game_state: format_game_state(&record.game_state),
                predicted_outcome: record.predicted_outcome.clone(),
                actual_outcome: record.actual_outcome.clone(),
                is_correct: record.is_correct,
                confidence_percent: format_confidence(record.confidence),
            })
            .collect()
    }
}

pub struct PredictionLedger<S: LedgerStore> {
    store: S,
    config: LedgerConfig,
    records: VecDeque<PredictionRecord>,
    stats: Statistics,
}

impl<S: LedgerStore> PredictionLedger<S> {
    /// Creates an empty ledger with the default configuration.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: LedgerConfig::default(),
            records: VecDeque::new(),
            stats: Statistics::default(),
        }
    }

    /// Creates an empty ledger with an explicit configuration.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when `config` is invalid.
    pub fn with_config(store: S, config: LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            records: VecDeque::new(),
            stats: Statistics::default(),
        })
    }

    /// Creates a ledger and restores any persisted state into it.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when `config` is invalid.
    /// Storage problems never fail this call.
    pub fn open(store: S, config: LedgerConfig) -> Result<Self, LedgerError> {
        let mut ledger = Self::with_config(store, config)?;
        ledger.restore();
        Ok(ledger)
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> Statistics {
        self.stats
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Records a prediction stamped with the current time.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidRecord`] when the event violates the
    /// record contract; the ledger is left untouched in that case.
    pub fn record(&mut self, event: PredictionEvent) -> Result<(), LedgerError> {
        self.record_at(event, now_utc())
    }

    /// Records a prediction with an explicit capture time.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidRecord`] when the event violates the
    /// record contract; the ledger is left untouched in that case.
    pub fn record_at(
        &mut self,
        event: PredictionEvent,
        timestamp: OffsetDateTime,
    ) -> Result<(), LedgerError> {
        event.validate()?;

        let PredictionEvent {
            game_state,
            predicted_outcome,
            confidence,
            model_name,
            actual_outcome,
        } = event;
        let predicted_outcome = predicted_outcome.unwrap_or_default();
        let actual_outcome = actual_outcome.unwrap_or_default();
        let is_correct = actual_outcome == predicted_outcome;

        tracing::debug!(
            game_state = %game_state,
            predicted = %predicted_outcome,
            actual = %actual_outcome,
            is_correct,
            "recording prediction"
        );

        self.records.push_front(PredictionRecord {
            timestamp: timestamp.to_offset(UtcOffset::UTC),
            game_state,
            predicted_outcome,
            confidence,
            model_name,
            actual_outcome,
            is_correct,
        });
        self.records.truncate(self.config.capacity);

        self.stats.predictions_total = self.stats.predictions_total.saturating_add(1);
        if is_correct {
            self.stats.predictions_correct = self.stats.predictions_correct.saturating_add(1);
        }

        self.persist();
        Ok(())
    }

    pub fn increment_games_played(&mut self) {
        self.stats.games_played = self.stats.games_played.saturating_add(1);
        self.persist();
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.stats.predictions_total = 0;
        self.stats.predictions_correct = 0;
        self.persist();
    }

    #[must_use]
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            records: self.records.iter().cloned().collect(),
            stats: self.stats,
        }
    }

    /// Loads persisted state, keeping the current (empty) state when the
    /// stored blob is missing or unreadable. Only [`PredictionLedger::open`]
    /// calls this.
    fn restore(&mut self) {
        let blob = match self.store.load(&self.config.storage_key) {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                tracing::debug!(key = %self.config.storage_key, "no persisted ledger found");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to load ledger from storage");
                return;
            }
        };

        let value: Value = match serde_json::from_str(&blob) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "persisted ledger is not valid JSON; starting empty");
                return;
            }
        };

        let (records, stats) = decode_persisted(&value, self.config.capacity);
        tracing::debug!(
            records = records.len(),
            predictions_total = stats.predictions_total,
            "restored ledger"
        );
        self.records = records;
        self.stats = stats;
    }

    fn persist(&mut self) {
        let blob = match encode_persisted(&self.records, &self.stats) {
            Ok(blob) => blob,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode ledger");
                return;
            }
        };

        if let Err(err) = self.store.save(&self.config.storage_key, &blob) {
            tracing::warn!(error = %err, "failed to save ledger to storage");
        }
    }
}

fn encode_persisted(
    records: &VecDeque<PredictionRecord>,
    stats: &Statistics,
) -> Result<String, LedgerError> {
    let payload = json!({
        "history": records,
        "stats": stats,
    });
    serde_json::to_string(&payload)
        .map_err(|err| LedgerError::Persistence(format!("failed to serialize ledger: {err}")))
}

fn decode_persisted(value: &Value, capacity: usize) -> (VecDeque<PredictionRecord>, Statistics) {
    let mut records = VecDeque::new();
    if let Some(entries) = value.get("history").and_then(Value::as_array) {
        for (index, entry) in entries.iter().enumerate() {
            match PredictionRecord::from_json(entry) {
                Some(record) => records.push_back(record),
                None => {
                    tracing::warn!(index, "dropping history entry without a prediction");
                }
            }
        }
    }
    records.truncate(capacity);

    let mut stats = value
        .get("stats")
        .map(Statistics::from_json)
        .unwrap_or_default();
    if stats.predictions_correct > stats.predictions_total {
        tracing::warn!(
            predictions_correct = stats.predictions_correct,
            predictions_total = stats.predictions_total,
            "persisted stats report more correct than total predictions; clamping"
        );
        stats.predictions_correct = stats.predictions_total;
    }

    (records, stats)
}

/// Display form of a server game-state label: `"x,_,o"` becomes `"X _ O"`.
#[must_use]
pub fn format_game_state(label: &str) -> String {
    if label.trim().is_empty() {
        return UNKNOWN_OUTCOME.to_string();
    }
    label.replace(',', " ").to_uppercase()
}

#[must_use]
pub fn format_confidence(confidence: f64) -> String {
    format!("{:.1}%", confidence * 100.0)
}

/// Finds the line `winner` completed on a nine-cell board, for highlighting.
#[must_use]
pub fn winning_line<T: AsRef<str>>(board: &[T], winner: &str) -> Option<[usize; 3]> {
    if winner.is_empty() || winner == DRAW_OUTCOME || board.len() < 9 {
        return None;
    }

    WINNING_LINES
        .iter()
        .find(|line| line.iter().all(|&index| board[index].as_ref() == winner))
        .copied()
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
