use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

pub mod models;
pub mod repository;

use crate::error::SchemaError;
use models::*;
pub use repository::{ContestHistory, FeatureRepository, PredictionSink};

/// Columns the contest history must expose. `neutral_site` is optional and
/// defaults to false when absent.
const REQUIRED_CONTEST_COLUMNS: [&str; 8] = [
    "id",
    "contest_date",
    "period",
    "home_team",
    "away_team",
    "home_score",
    "away_score",
    "status",
];

/// Thread-safe SQLite connection pool (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        if path != ":memory:" {
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        }
        Self::from_connection(conn)
    }

    /// Wrap an existing connection and run migrations on it
    pub fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database mutex poisoned"))
    }

    // ── Contests ──────────────────────────────────────────────────────────────

    /// Insert or replace a contest record. Rejects rows whose scores do not
    /// match their status.
    pub fn upsert_contest(&self, contest: &Contest) -> Result<()> {
        contest.check_status()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO contests (id, contest_date, period, home_team, away_team,
                                   home_score, away_score, status, neutral_site)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(id) DO UPDATE SET
                contest_date=excluded.contest_date,
                period=excluded.period,
                home_team=excluded.home_team,
                away_team=excluded.away_team,
                home_score=excluded.home_score,
                away_score=excluded.away_score,
                status=excluded.status,
                neutral_site=excluded.neutral_site",
            params![
                contest.id,
                contest.contest_date,
                contest.period,
                contest.home_team,
                contest.away_team,
                contest.home_score,
                contest.away_score,
                contest.status.as_str(),
                contest.neutral_site,
            ],
        )?;
        Ok(())
    }

    /// Check the contests table exposes every required column.
    /// Returns whether the optional `neutral_site` column exists.
    fn check_contest_columns(conn: &Connection) -> Result<bool> {
        let mut stmt = conn.prepare("PRAGMA table_info(contests)")?;
        let present = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        let missing: Vec<String> = REQUIRED_CONTEST_COLUMNS
            .iter()
            .filter(|c| !present.contains(**c))
            .map(|c| c.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(SchemaError::MissingColumns {
                table: "contests".into(),
                columns: missing,
            }
            .into());
        }
        Ok(present.contains("neutral_site"))
    }

    fn contests_with_status(&self, status: ContestStatus) -> Result<Vec<Contest>> {
        let conn = self.conn()?;
        let has_neutral = Self::check_contest_columns(&conn)?;
        let neutral_expr = if has_neutral { "neutral_site" } else { "0" };
        let sql = format!(
            "SELECT id, contest_date, period, home_team, away_team,
                    home_score, away_score, status, {neutral_expr}
             FROM contests WHERE status=?1 ORDER BY contest_date, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let contests = stmt
            .query_map(params![status.as_str()], map_contest)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(contests)
    }

    // ── Model runs ────────────────────────────────────────────────────────────

    /// Persist a fitted model's calibration state
    pub fn record_model_run(&self, run: &ModelRun) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO model_runs (training_rows, calibration_state, trained_at)
             VALUES (?1, ?2, ?3)",
            params![run.training_rows, run.calibration_state, run.trained_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent model run, if any
    pub fn latest_model_run(&self) -> Result<Option<ModelRun>> {
        let conn = self.conn()?;
        let run = conn
            .query_row(
                "SELECT id, training_rows, calibration_state, trained_at
                 FROM model_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(ModelRun {
                        id: row.get(0)?,
                        training_rows: row.get(1)?,
                        calibration_state: row.get(2)?,
                        trained_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(run)
    }

    // ── Predictions ───────────────────────────────────────────────────────────

    /// List stored predictions (newest first)
    pub fn list_predictions(&self, limit: i64) -> Result<Vec<Prediction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT contest_id, home_team, away_team, home_win_prob, away_win_prob,
                    predicted_winner, confidence, explanation, predicted_at
             FROM predictions ORDER BY predicted_at DESC, contest_id LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], map_prediction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// List logged low-data exclusions for one contest
    pub fn list_exclusions(&self, contest_id: &str) -> Result<Vec<LowDataExclusion>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT contest_id, home_team, away_team, home_games, away_games,
                    threshold, threshold_source, reason
             FROM low_data_exclusions WHERE contest_id=?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![contest_id], map_exclusion)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl ContestHistory for Database {
    fn completed_contests(&self) -> Result<Vec<Contest>> {
        self.contests_with_status(ContestStatus::Final)
    }

    fn upcoming_contests(&self) -> Result<Vec<Contest>> {
        self.contests_with_status(ContestStatus::Scheduled)
    }
}

impl FeatureRepository for Database {
    fn get_features(&self, entity_id: &str, period: &str) -> Result<Option<EntityPeriodFeatures>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("{FEATURE_SELECT} WHERE entity_id=?1 AND period=?2"),
                params![entity_id, period],
                map_features,
            )
            .optional()?;
        Ok(row)
    }

    fn features_for_period(&self, period: &str) -> Result<Vec<EntityPeriodFeatures>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{FEATURE_SELECT} WHERE period=?1 ORDER BY entity_id"
        ))?;
        let rows = stmt
            .query_map(params![period], map_features)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn all_features(&self) -> Result<Vec<EntityPeriodFeatures>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{FEATURE_SELECT} ORDER BY period, entity_id"))?;
        let rows = stmt
            .query_map([], map_features)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn upsert_features(&self, rows: &[EntityPeriodFeatures]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO entity_period_features (
                    entity_id, period, games_played,
                    win_rate_short, win_rate_long, point_diff_short, point_diff_long,
                    win_rate_delta, point_diff_delta, recent_strength_index, updated_at
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                 ON CONFLICT(entity_id, period) DO UPDATE SET
                    games_played=excluded.games_played,
                    win_rate_short=excluded.win_rate_short,
                    win_rate_long=excluded.win_rate_long,
                    point_diff_short=excluded.point_diff_short,
                    point_diff_long=excluded.point_diff_long,
                    win_rate_delta=excluded.win_rate_delta,
                    point_diff_delta=excluded.point_diff_delta,
                    recent_strength_index=excluded.recent_strength_index,
                    updated_at=excluded.updated_at",
            )?;
            for r in rows {
                stmt.execute(params![
                    r.entity_id,
                    r.period,
                    r.games_played,
                    nan_to_null(r.win_rate_short),
                    nan_to_null(r.win_rate_long),
                    nan_to_null(r.point_diff_short),
                    nan_to_null(r.point_diff_long),
                    nan_to_null(r.win_rate_delta),
                    nan_to_null(r.point_diff_delta),
                    nan_to_null(r.recent_strength_index),
                    r.updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }
}

impl PredictionSink for Database {
    fn upsert_prediction(&self, p: &Prediction) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO predictions (contest_id, home_team, away_team, home_win_prob,
                                      away_win_prob, predicted_winner, confidence,
                                      explanation, predicted_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(contest_id) DO UPDATE SET
                home_win_prob=excluded.home_win_prob,
                away_win_prob=excluded.away_win_prob,
                predicted_winner=excluded.predicted_winner,
                confidence=excluded.confidence,
                explanation=excluded.explanation,
                predicted_at=excluded.predicted_at",
            params![
                p.contest_id,
                p.home_team,
                p.away_team,
                p.home_win_prob,
                p.away_win_prob,
                p.predicted_winner,
                p.confidence,
                p.explanation,
                p.predicted_at,
            ],
        )?;
        Ok(())
    }

    fn append_exclusion(&self, e: &LowDataExclusion) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO low_data_exclusions (contest_id, home_team, away_team, home_games,
                                              away_games, threshold, threshold_source,
                                              reason, logged_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                e.contest_id,
                e.home_team,
                e.away_team,
                e.home_games,
                e.away_games,
                e.threshold,
                e.threshold_source.as_str(),
                e.reason,
                Utc::now(),
            ],
        )?;
        Ok(())
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

const FEATURE_SELECT: &str = "SELECT entity_id, period, games_played,
        win_rate_short, win_rate_long, point_diff_short, point_diff_long,
        win_rate_delta, point_diff_delta, recent_strength_index, updated_at
     FROM entity_period_features";

/// SQLite stores NaN as NULL; keep that explicit in both directions.
fn nan_to_null(v: f64) -> Option<f64> {
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}

fn null_to_nan(v: Option<f64>) -> f64 {
    v.unwrap_or(f64::NAN)
}

fn map_contest(row: &rusqlite::Row) -> rusqlite::Result<Contest> {
    let status: String = row.get(7)?;
    let status = ContestStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            format!("unknown contest status '{status}'").into(),
        )
    })?;
    Ok(Contest {
        id: row.get(0)?,
        contest_date: row.get(1)?,
        period: row.get(2)?,
        home_team: row.get(3)?,
        away_team: row.get(4)?,
        home_score: row.get(5)?,
        away_score: row.get(6)?,
        status,
        neutral_site: row.get(8)?,
    })
}

fn map_features(row: &rusqlite::Row) -> rusqlite::Result<EntityPeriodFeatures> {
    Ok(EntityPeriodFeatures {
        entity_id: row.get(0)?,
        period: row.get(1)?,
        games_played: row.get(2)?,
        win_rate_short: null_to_nan(row.get(3)?),
        win_rate_long: null_to_nan(row.get(4)?),
        point_diff_short: null_to_nan(row.get(5)?),
        point_diff_long: null_to_nan(row.get(6)?),
        win_rate_delta: null_to_nan(row.get(7)?),
        point_diff_delta: null_to_nan(row.get(8)?),
        recent_strength_index: null_to_nan(row.get(9)?),
        updated_at: row.get(10)?,
    })
}

fn map_prediction(row: &rusqlite::Row) -> rusqlite::Result<Prediction> {
    Ok(Prediction {
        contest_id: row.get(0)?,
        home_team: row.get(1)?,
        away_team: row.get(2)?,
        home_win_prob: row.get(3)?,
        away_win_prob: row.get(4)?,
        predicted_winner: row.get(5)?,
        confidence: row.get(6)?,
        explanation: row.get(7)?,
        predicted_at: row.get(8)?,
    })
}

fn map_exclusion(row: &rusqlite::Row) -> rusqlite::Result<LowDataExclusion> {
    let source: String = row.get(6)?;
    Ok(LowDataExclusion {
        contest_id: row.get(0)?,
        home_team: row.get(1)?,
        away_team: row.get(2)?,
        home_games: row.get(3)?,
        away_games: row.get(4)?,
        threshold: row.get(5)?,
        threshold_source: source.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, e.into())
        })?,
        reason: row.get(7)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS contests (
    id           TEXT    PRIMARY KEY,
    contest_date TEXT    NOT NULL,
    period       TEXT    NOT NULL,
    home_team    TEXT    NOT NULL,
    away_team    TEXT    NOT NULL,
    home_score   INTEGER,
    away_score   INTEGER,
    status       TEXT    NOT NULL DEFAULT 'scheduled',
    neutral_site INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS entity_period_features (
    entity_id             TEXT    NOT NULL,
    period                TEXT    NOT NULL,
    games_played          INTEGER NOT NULL,
    win_rate_short        REAL,
    win_rate_long         REAL,
    point_diff_short      REAL,
    point_diff_long       REAL,
    win_rate_delta        REAL,
    point_diff_delta      REAL,
    recent_strength_index REAL,
    updated_at            TEXT    NOT NULL,
    PRIMARY KEY (entity_id, period)
);

CREATE TABLE IF NOT EXISTS predictions (
    contest_id       TEXT    PRIMARY KEY,
    home_team        TEXT    NOT NULL,
    away_team        TEXT    NOT NULL,
    home_win_prob    REAL    NOT NULL,
    away_win_prob    REAL    NOT NULL,
    predicted_winner TEXT    NOT NULL,
    confidence       REAL    NOT NULL,
    explanation      TEXT,
    predicted_at     TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS low_data_exclusions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    contest_id       TEXT    NOT NULL,
    home_team        TEXT    NOT NULL,
    away_team        TEXT    NOT NULL,
    home_games       INTEGER NOT NULL,
    away_games       INTEGER NOT NULL,
    threshold        INTEGER NOT NULL,
    threshold_source TEXT    NOT NULL,
    reason           TEXT    NOT NULL,
    logged_at        TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS model_runs (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    training_rows     INTEGER NOT NULL,
    calibration_state TEXT    NOT NULL,
    trained_at        TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_features_period ON entity_period_features(period);
CREATE INDEX IF NOT EXISTS idx_exclusions_contest ON low_data_exclusions(contest_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::builder::FeatureStoreBuilder;
    use crate::predictor::threshold::ThresholdSource;
    use chrono::NaiveDate;

    fn contest(id: &str, day: u32, home: &str, away: &str, score: Option<(i32, i32)>) -> Contest {
        Contest {
            id: id.into(),
            contest_date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            period: "2024".into(),
            home_team: home.into(),
            away_team: away.into(),
            home_score: score.map(|s| s.0),
            away_score: score.map(|s| s.1),
            status: if score.is_some() {
                ContestStatus::Final
            } else {
                ContestStatus::Scheduled
            },
            neutral_site: false,
        }
    }

    #[test]
    fn contests_are_split_by_status() {
        let db = Database::open(":memory:").unwrap();
        db.upsert_contest(&contest("a", 1, "Hawks", "Owls", Some((3, 1)))).unwrap();
        db.upsert_contest(&contest("b", 2, "Owls", "Hawks", None)).unwrap();

        let done = db.completed_contests().unwrap();
        let todo = db.upcoming_contests().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].home_score, Some(3));
        assert_eq!(todo.len(), 1);
        assert_eq!(todo[0].id, "b");
        assert_eq!(todo[0].home_score, None);
    }

    #[test]
    fn scheduled_contest_with_scores_is_rejected() {
        let db = Database::open(":memory:").unwrap();
        let mut c = contest("x", 3, "Hawks", "Owls", Some((1, 0)));
        c.status = ContestStatus::Scheduled;

        let err = db.upsert_contest(&c).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchemaError>(),
            Some(SchemaError::ScoresStatusMismatch { .. })
        ));
        assert!(db.upcoming_contests().unwrap().is_empty());
        assert!(db.completed_contests().unwrap().is_empty());
    }

    #[test]
    fn missing_columns_surface_as_schema_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE contests (id TEXT PRIMARY KEY, contest_date TEXT, home_team TEXT,
                                    away_team TEXT, status TEXT);",
        )
        .unwrap();
        let db = Database::from_connection(conn).unwrap();

        let err = db.completed_contests().unwrap_err();
        let schema = err.downcast_ref::<SchemaError>().expect("schema error");
        match schema {
            SchemaError::MissingColumns { table, columns } => {
                assert_eq!(table, "contests");
                assert_eq!(columns, &["period", "home_score", "away_score"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn feature_store_round_trip_keeps_rows_and_keys() {
        let db = Database::open(":memory:").unwrap();
        let teams = ["Hawks", "Owls", "Bears", "Wolves"];
        let mut history = Vec::new();
        for day in 1..=24u32 {
            let h = teams[(day % 4) as usize];
            let a = teams[((day + 1) % 4) as usize];
            history.push(contest(&format!("g{day}"), day, h, a, Some((day as i32 % 7, 3))));
        }
        let built = FeatureStoreBuilder::default().build(&history).unwrap();
        db.upsert_features(&built).unwrap();

        let reloaded = db.all_features().unwrap();
        assert_eq!(reloaded.len(), built.len());
        let mut built_keys: Vec<_> = built.iter().map(|r| (r.period.clone(), r.entity_id.clone())).collect();
        let mut loaded_keys: Vec<_> = reloaded.iter().map(|r| (r.period.clone(), r.entity_id.clone())).collect();
        built_keys.sort();
        loaded_keys.sort();
        assert_eq!(built_keys, loaded_keys);
    }

    #[test]
    fn nan_aggregates_survive_storage() {
        let db = Database::open(":memory:").unwrap();
        let row = EntityPeriodFeatures {
            entity_id: "Hawks".into(),
            period: "2024".into(),
            games_played: 2,
            win_rate_short: f64::NAN,
            win_rate_long: f64::NAN,
            point_diff_short: f64::NAN,
            point_diff_long: f64::NAN,
            win_rate_delta: f64::NAN,
            point_diff_delta: f64::NAN,
            recent_strength_index: f64::NAN,
            updated_at: Utc::now(),
        };
        db.upsert_features(&[row]).unwrap();
        let got = db.get_features("Hawks", "2024").unwrap().unwrap();
        assert_eq!(got.games_played, 2);
        assert!(got.win_rate_short.is_nan());
        assert!(db.get_features("Hawks", "2023").unwrap().is_none());
    }

    #[test]
    fn prediction_upsert_supersedes_previous_run() {
        let db = Database::open(":memory:").unwrap();
        let mut p = Prediction {
            contest_id: "c1".into(),
            home_team: "Hawks".into(),
            away_team: "Owls".into(),
            home_win_prob: 0.6,
            away_win_prob: 0.4,
            predicted_winner: "Hawks".into(),
            confidence: 0.6,
            explanation: None,
            predicted_at: Utc::now(),
        };
        db.upsert_prediction(&p).unwrap();
        p.home_win_prob = 0.45;
        p.away_win_prob = 0.55;
        p.predicted_winner = "Owls".into();
        p.confidence = 0.55;
        db.upsert_prediction(&p).unwrap();

        let stored = db.list_predictions(10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].predicted_winner, "Owls");
    }

    #[test]
    fn exclusions_append_and_reload() {
        let db = Database::open(":memory:").unwrap();
        let e = LowDataExclusion {
            contest_id: "c9".into(),
            home_team: "Hawks".into(),
            away_team: "Owls".into(),
            home_games: 2,
            away_games: 14,
            threshold: 5,
            threshold_source: ThresholdSource::Fixed,
            reason: "Hawks has 2 games (< 5)".into(),
        };
        db.append_exclusion(&e).unwrap();
        db.append_exclusion(&e).unwrap();
        let rows = db.list_exclusions("c9").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].threshold_source, ThresholdSource::Fixed);
    }

    #[test]
    fn model_runs_keep_latest() {
        let db = Database::open(":memory:").unwrap();
        assert!(db.latest_model_run().unwrap().is_none());
        for rows in [10, 20] {
            db.record_model_run(&ModelRun {
                id: None,
                training_rows: rows,
                calibration_state: "{}".into(),
                trained_at: Utc::now(),
            })
            .unwrap();
        }
        assert_eq!(db.latest_model_run().unwrap().unwrap().training_rows, 20);
    }
}
