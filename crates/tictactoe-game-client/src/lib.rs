#![forbid(unsafe_code)]

//! HTTP client for the tic-tac-toe AI backend and the session wiring that
//! feeds its predictions into a [`PredictionLedger`].

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tictactoe_ledger_core::{
    winning_line, LedgerStore, PredictionEvent, PredictionLedger, DRAW_OUTCOME, UNKNOWN_OUTCOME,
};

pub const BOARD_CELLS: usize = 9;
pub const HUMAN_PLAYER: &str = "X";
pub const AI_PLAYER: &str = "O";

/// The four calls the backend exposes.
pub trait GameBackend {
    fn backend_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn fetch_state(&mut self) -> Result<GameState>;

    #[allow(clippy::missing_errors_doc)]
    fn submit_move(&mut self, position: usize) -> Result<GameState>;

    #[allow(clippy::missing_errors_doc)]
    fn request_ai_move(&mut self) -> Result<GameState>;

    #[allow(clippy::missing_errors_doc)]
    fn reset(&mut self) -> Result<GameState>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSource {
    /// The `winner` field once the game is over.
    #[default]
    Winner,
    /// The `ground_truth` label the multi-model backend attaches to each prediction.
    GroundTruth,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    pub server_url: String,
    pub timeout_ms: u64,
    pub record_unresolved: bool,
    pub outcome_source: OutcomeSource,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".to_string(),
            timeout_ms: 5_000,
            record_unresolved: true,
            outcome_source: OutcomeSource::Winner,
        }
    }
}

impl SessionConfig {
    /// # Errors
    /// Returns an error when the server URL is not an http(s) URL or the
    /// timeout is zero.
    pub fn validate(&self) -> Result<()> {
        let url = self.server_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(anyhow!(
                "server_url must start with http:// or https://, got '{}'",
                self.server_url
            ));
        }
        if self.timeout_ms == 0 {
            return Err(anyhow!("timeout_ms must be >= 1"));
        }
        Ok(())
    }
}

/// Prediction attached to a backend response.
///
/// Accepts both the multi-model shape (`best_prediction`, `best_model`,
/// `all_predictions`, `ground_truth`) and the single-model shape
/// (`prediction`, `model`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PredictionPayload {
    #[serde(rename = "gameState", default)]
    pub game_state: Option<String>,
    #[serde(alias = "best_prediction", default)]
    pub prediction: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(alias = "best_model", default)]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub all_predictions: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_truth: Option<String>,
}

impl PredictionPayload {
    #[must_use]
    pub fn to_event(&self, actual_outcome: Option<String>) -> PredictionEvent {
        PredictionEvent {
            game_state: self
                .game_state
                .clone()
                .unwrap_or_else(|| UNKNOWN_OUTCOME.to_string()),
            predicted_outcome: self.prediction.clone(),
            confidence: self.confidence,
            model_name: self.model.clone().unwrap_or_default(),
            actual_outcome,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    #[serde(default = "empty_board")]
    pub board: Vec<String>,
    #[serde(default = "first_player")]
    pub current_player: String,
    #[serde(default)]
    pub game_over: bool,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub prediction: Option<PredictionPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_moves: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_predictions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

fn empty_board() -> Vec<String> {
    vec![String::new(); BOARD_CELLS]
}

fn first_player() -> String {
    HUMAN_PLAYER.to_string()
}

impl Default for GameState {
    fn default() -> Self {
        Self {
            board: empty_board(),
            current_player: first_player(),
            game_over: false,
            winner: None,
            prediction: None,
            total_moves: None,
            correct_predictions: None,
            accuracy: None,
        }
    }
}

impl GameState {
    #[must_use]
    pub fn cell(&self, position: usize) -> &str {
        self.board.get(position).map_or("", String::as_str)
    }

    #[must_use]
    pub fn is_cell_empty(&self, position: usize) -> bool {
        position < BOARD_CELLS && self.cell(position).is_empty()
    }

    #[must_use]
    pub fn is_ai_turn(&self) -> bool {
        !self.game_over && self.current_player == AI_PLAYER
    }

    /// Cells of the completed line, when the game ended with a winner.
    #[must_use]
    pub fn winning_cells(&self) -> Option<[usize; 3]> {
        if !self.game_over {
            return None;
        }
        let winner = self.winner.as_deref()?;
        winning_line(&self.board, winner)
    }

    #[must_use]
    pub fn status_line(&self) -> String {
        if !self.game_over {
            return "Game in progress...".to_string();
        }
        match self.winner.as_deref() {
            Some(DRAW_OUTCOME) => "It's a draw!".to_string(),
            Some(winner) => format!("{winner} wins!"),
            None => "Game over".to_string(),
        }
    }

    #[must_use]
    pub fn player_line(&self) -> String {
        if self.game_over {
            "Game Over".to_string()
        } else {
            format!("Current Player: {}", self.current_player)
        }
    }
}

/// Scripted backend for tests and offline demos.
#[derive(Debug, Default)]
pub struct MockGameBackend {
    responses: VecDeque<Result<GameState, String>>,
    calls: Vec<String>,
}

impl MockGameBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_responses(responses: Vec<Result<GameState, String>>) -> Self {
        Self {
            responses: responses.into(),
            calls: Vec::new(),
        }
    }

    pub fn push_response(&mut self, response: Result<GameState, String>) {
        self.responses.push_back(response);
    }

    #[must_use]
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    fn next(&mut self, call: String) -> Result<GameState> {
        self.calls.push(call.clone());
        match self.responses.pop_front() {
            Some(Ok(state)) => Ok(state),
            Some(Err(message)) => Err(anyhow!("{call} rejected by server: {message}")),
            None => Err(anyhow!("mock backend has no scripted response for {call}")),
        }
    }
}

impl GameBackend for MockGameBackend {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn fetch_state(&mut self) -> Result<GameState> {
        self.next("game_state".to_string())
    }

    fn submit_move(&mut self, position: usize) -> Result<GameState> {
        self.next(format!("move:{position}"))
    }

    fn request_ai_move(&mut self) -> Result<GameState> {
        self.next("ai_move".to_string())
    }

    fn reset(&mut self) -> Result<GameState> {
        self.next("reset".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct HttpGameBackend {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpGameBackend {
    /// # Errors
    /// Returns an error when `config` fails validation.
    pub fn new(config: &SessionConfig) -> Result<Self> {
        config.validate()?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build();
        Ok(Self {
            agent,
            base_url: config.server_url.trim().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn post(&self, path: &str, body: &Value) -> Result<GameState> {
        let result = self
            .agent
            .post(&self.url(path))
            .set("content-type", "application/json")
            .send_json(body);
        decode_response(path, result)
    }
}

impl GameBackend for HttpGameBackend {
    fn backend_name(&self) -> &'static str {
        "http"
    }

    fn fetch_state(&mut self) -> Result<GameState> {
        let result = self.agent.get(&self.url("game_state")).call();
        decode_response("game_state", result)
    }

    fn submit_move(&mut self, position: usize) -> Result<GameState> {
        self.post("move", &json!({ "position": position }))
    }

    fn request_ai_move(&mut self) -> Result<GameState> {
        self.post("ai_move", &json!({}))
    }

    fn reset(&mut self) -> Result<GameState> {
        self.post("reset", &json!({}))
    }
}

fn decode_response(
    action: &str,
    result: std::result::Result<ureq::Response, ureq::Error>,
) -> Result<GameState> {
    match result {
        Ok(response) => {
            let body: Value = response
                .into_json()
                .with_context(|| format!("{action} response is not valid JSON"))?;
            parse_state_body(action, body)
        }
        Err(ureq::Error::Status(code, response)) => {
            let message = response
                .into_json::<Value>()
                .ok()
                .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| format!("http status {code}"));
            Err(anyhow!("{action} rejected by server (http {code}): {message}"))
        }
        Err(ureq::Error::Transport(err)) => {
            Err(anyhow!("http transport failure during {action}: {err}"))
        }
    }
}

/// Decodes a backend response body, surfacing `{"error": ...}` payloads.
///
/// # Errors
/// Returns an error for error payloads and bodies that are not a game state.
pub fn parse_state_body(action: &str, body: Value) -> Result<GameState> {
    if let Some(message) = body.get("error").and_then(Value::as_str) {
        return Err(anyhow!("{action} rejected by server: {message}"));
    }
    serde_json::from_value(body).with_context(|| format!("{action} returned an unexpected payload"))
}

/// Client-side game controller: applies backend responses and keeps the
/// prediction ledger in step with them.
pub struct GameSession<B: GameBackend> {
    backend: B,
    config: SessionConfig,
    state: Option<GameState>,
}

impl<B: GameBackend> GameSession<B> {
    #[must_use]
    pub fn new(backend: B, config: SessionConfig) -> Self {
        Self {
            backend,
            config,
            state: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> Option<&GameState> {
        self.state.as_ref()
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Fetches the current game state. Predictions carried by a plain state
    /// fetch are shown but not recorded.
    ///
    /// # Errors
    /// Returns an error when the backend call fails.
    pub fn refresh(&mut self) -> Result<&GameState> {
        let state = self.backend.fetch_state()?;
        tracing::debug!(backend = self.backend.backend_name(), "fetched game state");
        Ok(&*self.state.insert(state))
    }

    /// Plays the human move at `position` (0..=8).
    ///
    /// # Errors
    /// Returns an error when the move is not playable, the backend rejects
    /// it, or the prediction in the response cannot be recorded.
    pub fn play_move<S: LedgerStore>(
        &mut self,
        position: usize,
        ledger: &mut PredictionLedger<S>,
    ) -> Result<&GameState> {
        if position >= BOARD_CELLS {
            return Err(anyhow!("position must be in 0..=8, got {position}"));
        }
        if let Some(state) = &self.state {
            if state.game_over {
                return Err(anyhow!("game is over; reset to play again"));
            }
            if !state.is_cell_empty(position) {
                return Err(anyhow!("cell {position} is already taken"));
            }
        }

        let state = self.backend.submit_move(position)?;
        self.apply(state, ledger)
    }

    /// Asks the backend to play the AI's move.
    ///
    /// # Errors
    /// Returns an error when it is not the AI's turn, the backend rejects the
    /// request, or the prediction in the response cannot be recorded.
    pub fn play_ai_move<S: LedgerStore>(
        &mut self,
        ledger: &mut PredictionLedger<S>,
    ) -> Result<&GameState> {
        if let Some(state) = &self.state {
            if !state.is_ai_turn() {
                return Err(anyhow!(
                    "AI can only move while the game is running and it is {AI_PLAYER}'s turn"
                ));
            }
        }

        let state = self.backend.request_ai_move()?;
        self.apply(state, ledger)
    }

    /// Starts a new game and counts it in the ledger.
    ///
    /// # Errors
    /// Returns an error when the backend call fails; the games-played counter
    /// is untouched in that case.
    pub fn reset<S: LedgerStore>(&mut self, ledger: &mut PredictionLedger<S>) -> Result<&GameState> {
        let state = self.backend.reset()?;
        ledger.increment_games_played();
        Ok(&*self.state.insert(state))
    }

    fn apply<S: LedgerStore>(
        &mut self,
        state: GameState,
        ledger: &mut PredictionLedger<S>,
    ) -> Result<&GameState> {
        let state = &*self.state.insert(state);
        let Some(prediction) = &state.prediction else {
            return Ok(state);
        };

        let ground_truth = match self.config.outcome_source {
            OutcomeSource::GroundTruth => {
                if prediction.ground_truth.is_none() {
                    tracing::warn!("prediction carries no ground_truth; using the game outcome");
                }
                prediction.ground_truth.clone()
            }
            OutcomeSource::Winner => None,
        };

        let actual = if let Some(label) = ground_truth {
            label
        } else if state.game_over {
            state
                .winner
                .clone()
                .unwrap_or_else(|| UNKNOWN_OUTCOME.to_string())
        } else if self.config.record_unresolved {
            UNKNOWN_OUTCOME.to_string()
        } else {
            tracing::debug!("skipping prediction for unfinished game");
            return Ok(state);
        };

        ledger
            .record(prediction.to_event(Some(actual)))
            .context("failed to record prediction")?;
        Ok(state)
    }
}
