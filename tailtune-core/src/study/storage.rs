//! Study persistence.
//!
//! A study record holds every trial plus the sampler and pruner settings it
//! was created with. Two backends: one JSON file per study, or a SQLite
//! database holding any number of studies.

use crate::error::{Result, TuneError};
use crate::persistence;
use crate::study::pruner::PrunerConfig;
use crate::study::sampler::SamplerConfig;
use crate::study::trial::{Report, Trial, TrialState};
use crate::tracking::RunId;
use crate::training::metrics::Direction;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub name: String,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub pruner: PrunerConfig,
    /// Tracking run every trial's run is nested under.
    #[serde(default)]
    pub parent_run: Option<RunId>,
    #[serde(default)]
    pub trials: Vec<Trial>,
}

impl StudyRecord {
    pub fn new(name: &str, direction: Direction, sampler: SamplerConfig, pruner: PrunerConfig) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            direction,
            created_at: now,
            updated_at: now,
            sampler,
            pruner,
            parent_run: None,
            trials: Vec::new(),
        }
    }

    pub fn count(&self, state: TrialState) -> usize {
        self.trials.iter().filter(|t| t.state == state).count()
    }

    /// Trials in a terminal state.
    pub fn n_finished(&self) -> usize {
        self.trials.iter().filter(|t| t.state.is_finished()).count()
    }

    /// The completed trial with the best final value.
    pub fn best_trial(&self) -> Option<&Trial> {
        self.trials
            .iter()
            .filter(|t| t.state == TrialState::Complete)
            .filter_map(|t| t.final_value.map(|v| (t, v)))
            .fold(None, |best: Option<(&Trial, f64)>, (t, v)| match best {
                Some((_, b)) if !self.direction.is_better(v, b) => best,
                _ => Some((t, v)),
            })
            .map(|(t, _)| t)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Study names become file names and table keys.
pub fn validate_study_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(TuneError::invalid_input(format!(
            "invalid study name '{name}': use letters, digits, '-', '_' or '.'"
        )))
    }
}

pub trait StudyStorage: Send + Sync {
    fn load(&self, name: &str) -> Result<Option<StudyRecord>>;

    fn save(&self, study: &StudyRecord) -> Result<()>;

    /// Names of all stored studies, sorted.
    fn list(&self) -> Result<Vec<String>>;
}

/// One `<dir>/<name>.json` file per study, written atomically.
pub struct JsonStudyStorage {
    dir: PathBuf,
}

impl JsonStudyStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| TuneError::storage(format!("cannot create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl StudyStorage for JsonStudyStorage {
    fn load(&self, name: &str) -> Result<Option<StudyRecord>> {
        validate_study_name(name)?;
        let path = self.path_for(name);
        persistence::load_json(&path)
            .map_err(|e| TuneError::storage(format!("cannot read {}: {e}", path.display())))
    }

    fn save(&self, study: &StudyRecord) -> Result<()> {
        validate_study_name(&study.name)?;
        let path = self.path_for(&study.name);
        persistence::atomic_write_json(&path, study)
            .map_err(|e| TuneError::storage(format!("cannot write {}: {e}", path.display())))
    }

    fn list(&self) -> Result<Vec<String>> {
        let unreadable = |e: std::io::Error| TuneError::storage(format!("cannot list {}: {e}", self.dir.display()));
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(unreadable)? {
            let path = entry.map_err(unreadable)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Studies and trials in normalized SQLite tables.
pub struct SqliteStudyStorage {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS studies (
    name        TEXT PRIMARY KEY,
    direction   TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    sampler     TEXT NOT NULL,
    pruner      TEXT NOT NULL,
    parent_run  TEXT
);
CREATE TABLE IF NOT EXISTS trials (
    study        TEXT NOT NULL REFERENCES studies(name) ON DELETE CASCADE,
    number       INTEGER NOT NULL,
    state        TEXT NOT NULL,
    params       TEXT NOT NULL,
    reports      TEXT NOT NULL,
    final_value  REAL,
    error        TEXT,
    run_id       TEXT,
    output_dir   TEXT,
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    PRIMARY KEY (study, number)
);
";

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TuneError::storage(format!("invalid timestamp '{s}': {e}")))
}

impl SqliteStudyStorage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TuneError::storage(format!("cannot create {}: {e}", parent.display())))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TuneError::storage("study database lock poisoned"))
    }

    fn load_trials(conn: &Connection, name: &str) -> Result<Vec<Trial>> {
        let mut stmt = conn.prepare(
            "SELECT number, state, params, reports, final_value, error, run_id, output_dir,
                    started_at, finished_at
             FROM trials WHERE study = ?1 ORDER BY number",
        )?;
        let rows = stmt.query_map(params![name], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<f64>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, Option<String>>(9)?,
            ))
        })?;

        let mut trials = Vec::new();
        for row in rows {
            let (number, state, params, reports, final_value, error, run_id, output_dir, started_at, finished_at) =
                row?;
            let reports: Vec<Report> = serde_json::from_str(&reports)?;
            trials.push(Trial {
                number: number as usize,
                params: serde_json::from_str(&params)?,
                state: state.parse()?,
                intermediate_reports: reports,
                final_value,
                error,
                run_id: run_id.map(RunId),
                output_dir: output_dir.map(PathBuf::from),
                started_at: parse_time(&started_at)?,
                finished_at: finished_at.as_deref().map(parse_time).transpose()?,
            });
        }
        Ok(trials)
    }
}

impl StudyStorage for SqliteStudyStorage {
    fn load(&self, name: &str) -> Result<Option<StudyRecord>> {
        validate_study_name(name)?;
        let conn = self.conn()?;
        let header = conn
            .query_row(
                "SELECT direction, created_at, updated_at, sampler, pruner, parent_run
                 FROM studies WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((direction, created_at, updated_at, sampler, pruner, parent_run)) = header else {
            return Ok(None);
        };

        Ok(Some(StudyRecord {
            name: name.to_string(),
            direction: serde_json::from_value(serde_json::Value::String(direction))?,
            created_at: parse_time(&created_at)?,
            updated_at: parse_time(&updated_at)?,
            sampler: serde_json::from_str(&sampler)?,
            pruner: serde_json::from_str(&pruner)?,
            parent_run: parent_run.map(RunId),
            trials: Self::load_trials(&conn, name)?,
        }))
    }

    fn save(&self, study: &StudyRecord) -> Result<()> {
        validate_study_name(&study.name)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO studies (name, direction, created_at, updated_at, sampler, pruner, parent_run)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET
                direction = excluded.direction,
                updated_at = excluded.updated_at,
                sampler = excluded.sampler,
                pruner = excluded.pruner,
                parent_run = excluded.parent_run",
            params![
                study.name,
                study.direction.as_str(),
                study.created_at.to_rfc3339(),
                study.updated_at.to_rfc3339(),
                serde_json::to_string(&study.sampler)?,
                serde_json::to_string(&study.pruner)?,
                study.parent_run.as_ref().map(RunId::as_str),
            ],
        )?;
        tx.execute("DELETE FROM trials WHERE study = ?1", params![study.name])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO trials (study, number, state, params, reports, final_value, error,
                                     run_id, output_dir, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for trial in &study.trials {
                insert.execute(params![
                    study.name,
                    trial.number as i64,
                    trial.state.as_str(),
                    serde_json::to_string(&trial.params)?,
                    serde_json::to_string(&trial.intermediate_reports)?,
                    trial.final_value,
                    trial.error,
                    trial.run_id.as_ref().map(RunId::as_str),
                    trial.output_dir.as_ref().map(|p| p.to_string_lossy().into_owned()),
                    trial.started_at.to_rfc3339(),
                    trial.finished_at.map(|t| t.to_rfc3339()),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM studies ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

/// Storage backend selection. Relative paths resolve against the studies
/// directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    Json {
        #[serde(default)]
        dir: Option<PathBuf>,
    },
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("studies.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Json { dir: None }
    }
}

impl StorageConfig {
    pub fn open(&self, studies_dir: &Path) -> Result<Box<dyn StudyStorage>> {
        Ok(match self {
            StorageConfig::Json { dir } => {
                let dir = dir.as_ref().map_or_else(|| studies_dir.to_path_buf(), |d| studies_dir.join(d));
                Box::new(JsonStudyStorage::new(dir)?)
            }
            StorageConfig::Sqlite { path } => Box::new(SqliteStudyStorage::open(&studies_dir.join(path))?),
        })
    }
}
