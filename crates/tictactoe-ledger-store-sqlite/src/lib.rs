#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tictactoe_ledger_core::{now_utc, LedgerError, LedgerStore};
use time::format_description::well_known::Rfc3339;

const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS ledger_kv (
  key TEXT PRIMARY KEY CHECK (length(trim(key)) > 0),
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// Key-value ledger storage backed by a local `SQLite` file.
pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Opens an in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply ledger schema")?;

        let now = timestamp_now()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .context("failed to register ledger schema migration")?;

        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM ledger_kv WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read ledger key {key}"))
    }

    pub fn put_value(&self, key: &str, value: &str) -> Result<()> {
        let now = timestamp_now()?;
        self.conn
            .execute(
                "INSERT INTO ledger_kv(key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .with_context(|| format!("failed to write ledger key {key}"))?;
        Ok(())
    }

    pub fn remove_value(&self, key: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM ledger_kv WHERE key = ?1", params![key])
            .with_context(|| format!("failed to delete ledger key {key}"))?;
        Ok(removed > 0)
    }

    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn load(&self, key: &str) -> Result<Option<String>, LedgerError> {
        self.get_value(key)
            .map_err(|err| LedgerError::Persistence(format!("{err:#}")))
    }

    fn save(&mut self, key: &str, blob: &str) -> Result<(), LedgerError> {
        tracing::trace!(key, bytes = blob.len(), "writing ledger blob");
        self.put_value(key, blob)
            .map_err(|err| LedgerError::Persistence(format!("{err:#}")))
    }
}

fn timestamp_now() -> Result<String> {
    now_utc()
        .format(&Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;
    use tictactoe_ledger_core::{
        LedgerConfig, PredictionEvent, PredictionLedger, DEFAULT_STORAGE_KEY,
    };
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_ledger<T>(result: Result<T, LedgerError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("ledger failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteLedgerStore {
        let store = must(SqliteLedgerStore::open_in_memory());
        must(store.migrate());
        store
    }

    fn temp_db_path(prefix: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}.sqlite3", Ulid::new()))
    }

    fn fixture_event(predicted: &str, actual: &str) -> PredictionEvent {
        PredictionEvent {
            game_state: "X,_,_,_,O,_,_,_,_".to_string(),
            predicted_outcome: Some(predicted.to_string()),
            confidence: 0.87,
            model_name: "MLPClassifier".to_string(),
            actual_outcome: Some(actual.to_string()),
        }
    }

    #[test]
    fn put_then_get_overwrites_single_key() {
        let store = fixture_store();
        must(store.put_value("k", "one"));
        must(store.put_value("k", "two"));
        assert_eq!(must(store.get_value("k")).as_deref(), Some("two"));
        assert_eq!(must(store.get_value("missing")), None);

        let rows = match store
            .connection()
            .query_row("SELECT COUNT(*) FROM ledger_kv", [], |row| row.get::<_, i64>(0))
        {
            Ok(value) => value,
            Err(err) => panic!("failed to count rows: {err}"),
        };
        assert_eq!(rows, 1);
    }

    #[test]
    fn remove_value_reports_whether_key_existed() {
        let store = fixture_store();
        must(store.put_value("k", "v"));
        assert!(must(store.remove_value("k")));
        assert!(!must(store.remove_value("k")));
    }

    #[test]
    fn blank_key_is_rejected_by_schema() {
        let store = fixture_store();
        assert!(store.put_value("  ", "v").is_err());
    }

    #[test]
    fn unmigrated_store_surfaces_persistence_error() {
        let store = must(SqliteLedgerStore::open_in_memory());
        let err = match store.load(DEFAULT_STORAGE_KEY) {
            Ok(_) => panic!("expected load failure without schema"),
            Err(err) => err,
        };
        assert!(matches!(err, LedgerError::Persistence(_)));
    }

    #[test]
    fn ledger_over_unmigrated_store_still_records() {
        let store = must(SqliteLedgerStore::open_in_memory());
        let mut ledger = must_ledger(PredictionLedger::open(store, LedgerConfig::default()));
        must_ledger(ledger.record(fixture_event("X", "X")));
        assert_eq!(ledger.stats().predictions_total, 1);
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let store = fixture_store();
        must(store.put_value(DEFAULT_STORAGE_KEY, "{}"));
        must(store.migrate());
        assert_eq!(
            must(store.get_value(DEFAULT_STORAGE_KEY)).as_deref(),
            Some("{}")
        );

        let migrations = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to count migrations: {err}"),
        };
        assert_eq!(migrations, 1);
    }

    #[test]
    fn ledger_survives_reopen_of_database_file() {
        let db_path = temp_db_path("ledger-reopen");

        let before = {
            let store = must(SqliteLedgerStore::open(&db_path));
            must(store.migrate());
            let mut ledger = must_ledger(PredictionLedger::open(store, LedgerConfig::default()));
            ledger.increment_games_played();
            must_ledger(ledger.record(fixture_event("X", "X")));
            must_ledger(ledger.record(fixture_event("O", "Draw")));
            ledger.snapshot()
        };

        let store = must(SqliteLedgerStore::open(&db_path));
        must(store.migrate());
        let ledger = must_ledger(PredictionLedger::open(store, LedgerConfig::default()));
        assert_eq!(ledger.snapshot(), before);
        assert_eq!(ledger.stats().games_played, 1);
        assert_eq!(ledger.stats().predictions_correct, 1);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn stored_blob_is_readable_json_under_named_key() {
        let mut ledger = must_ledger(PredictionLedger::open(
            fixture_store(),
            LedgerConfig::default(),
        ));
        must_ledger(ledger.record(fixture_event("X", "O")));

        let store = ledger.into_store();
        let raw = match must(store.get_value(DEFAULT_STORAGE_KEY)) {
            Some(value) => value,
            None => panic!("ledger blob missing"),
        };
        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => panic!("stored blob is not JSON: {err}"),
        };
        assert_eq!(value["stats"]["predictionsTotal"], 1);
        assert_eq!(value["stats"]["predictionsCorrect"], 0);
        assert_eq!(value["history"][0]["actualResult"], "O");
        assert_eq!(value["history"][0]["isCorrect"], false);
    }

    #[test]
    fn corrupt_blob_restores_to_empty_ledger() {
        let store = fixture_store();
        must(store.put_value(DEFAULT_STORAGE_KEY, "][ definitely not json"));
        let ledger = must_ledger(PredictionLedger::open(store, LedgerConfig::default()));
        assert!(ledger.is_empty());
        assert_eq!(ledger.stats().predictions_total, 0);
    }

    #[test]
    fn custom_storage_key_isolates_ledgers() {
        let store = fixture_store();
        let config = LedgerConfig {
            storage_key: "ttt-experiment".to_string(),
            ..LedgerConfig::default()
        };
        let mut ledger = must_ledger(PredictionLedger::open(store, config));
        must_ledger(ledger.record(fixture_event("X", "X")));

        let store = ledger.into_store();
        assert!(must(store.get_value("ttt-experiment")).is_some());
        assert!(must(store.get_value(DEFAULT_STORAGE_KEY)).is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_sqlite_round_trip_reproduces_snapshot(stream in prop::collection::vec((any::<bool>(), 0u8..4, 0.0f64..=1.0), 0..70)) {
            let mut ledger = must_ledger(PredictionLedger::open(fixture_store(), LedgerConfig::default()));
            for (correct, op, confidence) in &stream {
                match op {
                    0 => ledger.increment_games_played(),
                    _ => {
                        let actual = if *correct { "X" } else { "Draw" };
                        let event = PredictionEvent {
                            confidence: *confidence,
                            ..fixture_event("X", actual)
                        };
                        prop_assert!(ledger.record(event).is_ok());
                    }
                }
            }

            let before = ledger.snapshot();
            let restored = must_ledger(PredictionLedger::open(ledger.into_store(), LedgerConfig::default()));
            prop_assert_eq!(restored.snapshot(), before);
        }
    }
}
