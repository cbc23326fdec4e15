//! Studies interrupted mid-way pick up where they left off, counting the
//! trials already finished against the budget.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pretty_assertions::assert_eq;
use tailtune_core::study::{
    JsonStudyStorage, ParamSpec, Params, PrunerConfig, SamplerConfig, SearchSpace, SqliteStudyStorage,
    StudyStorage, TrialContext, TrialScheduler,
};
use tailtune_core::tracking::memory::MemorySink;
use tailtune_core::training::TrialReporter;
use tailtune_core::{Direction, Result, StudyRecord, TrialState, TuneError};
use tempfile::TempDir;

fn space() -> SearchSpace {
    SearchSpace::new()
        .with(
            "lr",
            ParamSpec::Float {
                low: 1e-4,
                high: 1e-1,
                log: true,
            },
        )
        .with(
            "batch_size",
            ParamSpec::Categorical {
                choices: vec![8.into(), 16.into(), 32.into()],
            },
        )
}

fn score(ctx: &mut TrialContext<'_>) -> Result<f64> {
    Ok(ctx.params()["lr"].as_f64().unwrap_or(0.0))
}

/// Run the study once. When `cancel_after` is set, the cancel flag is raised
/// from inside the objective after that many calls, as a Ctrl-C would.
fn run_once(
    storage: &dyn StudyStorage,
    sink: &MemorySink,
    dir: &TempDir,
    n_trials: usize,
    cancel_after: Option<usize>,
) -> (StudyRecord, usize) {
    let cancel = Arc::new(AtomicBool::new(false));
    let mut calls = 0;
    let flag = cancel.clone();
    let mut scheduler = TrialScheduler::new("resume-me", storage, sink, dir.path().join("resume-me"))
        .unwrap()
        .with_sampler(SamplerConfig::Random { seed: 7 })
        .with_pruner(PrunerConfig::Nop)
        .unwrap()
        .with_cancel_flag(cancel);
    let study = scheduler
        .run(
            &space(),
            &Params::new(),
            n_trials,
            |ctx| {
                calls += 1;
                if cancel_after == Some(calls) {
                    flag.store(true, Ordering::SeqCst);
                }
                score(ctx)
            },
            Direction::Maximize,
        )
        .unwrap();
    (study, calls)
}

fn assert_unique_numbers(study: &StudyRecord) {
    let numbers: BTreeSet<usize> = study.trials.iter().map(|t| t.number).collect();
    assert_eq!(numbers.len(), study.trials.len());
}

#[test]
fn cancelled_study_finishes_its_budget_on_restart() {
    let dir = TempDir::new().unwrap();
    let storage = JsonStudyStorage::new(dir.path().join("studies")).unwrap();
    let sink = MemorySink::new();

    let (first, calls) = run_once(&storage, &sink, &dir, 10, Some(4));
    assert_eq!(calls, 4);
    assert_eq!(first.trials.len(), 4);
    assert_eq!(first.count(TrialState::Complete), 4);

    let (second, calls) = run_once(&storage, &sink, &dir, 10, None);
    assert_eq!(calls, 6);
    assert_eq!(second.trials.len(), 10);
    assert_eq!(second.count(TrialState::Complete), 10);
    assert_unique_numbers(&second);

    let (third, calls) = run_once(&storage, &sink, &dir, 10, None);
    assert_eq!(calls, 0);
    assert_eq!(third.trials.len(), 10);

    let best = third.best_trial().unwrap();
    let max = third
        .trials
        .iter()
        .filter_map(|t| t.final_value)
        .fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(best.final_value, Some(max));
}

#[test]
fn sqlite_study_survives_reopening() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("studies.db");
    let sink = MemorySink::new();

    {
        let storage = SqliteStudyStorage::open(&db).unwrap();
        let (first, calls) = run_once(&storage, &sink, &dir, 6, Some(2));
        assert_eq!(calls, 2);
        assert_eq!(first.n_finished(), 2);
    }

    let storage = SqliteStudyStorage::open(&db).unwrap();
    let reloaded = storage.load("resume-me").unwrap().unwrap();
    assert_eq!(reloaded.trials.len(), 2);
    assert_eq!(reloaded.sampler, SamplerConfig::Random { seed: 7 });

    let (second, calls) = run_once(&storage, &sink, &dir, 6, None);
    assert_eq!(calls, 4);
    assert_eq!(second.n_finished(), 6);
    assert_unique_numbers(&second);
    assert_eq!(storage.list().unwrap(), vec!["resume-me".to_string()]);
}

/// Trial 1 diverges at its first report and asks the pruner whether to stop.
/// Every other trial reports its score and completes.
fn run_diverging(storage: &dyn StudyStorage, sink: &MemorySink, dir: &TempDir, n_trials: usize) -> StudyRecord {
    let mut scheduler = TrialScheduler::new("diverge", storage, sink, dir.path().join("diverge"))
        .unwrap()
        .with_sampler(SamplerConfig::Random { seed: 3 })
        .with_pruner(PrunerConfig::Median {
            n_startup_trials: 0,
            n_warmup_steps: 0,
        })
        .unwrap();
    scheduler
        .run(
            &space(),
            &Params::new(),
            n_trials,
            |ctx| {
                let value = if ctx.number() == 1 { f64::NAN } else { score(ctx)? };
                ctx.report(1, value)?;
                if value.is_nan() && ctx.should_prune()? {
                    return Err(TuneError::Pruned { step: 1, value });
                }
                Ok(value)
            },
            Direction::Maximize,
        )
        .unwrap()
}

fn diverged_trial_reloads(storage: &dyn StudyStorage, dir: &TempDir) {
    let sink = MemorySink::new();
    let first = run_diverging(storage, &sink, dir, 3);
    assert_eq!(first.trials.len(), 3);

    let reloaded = storage.load("diverge").unwrap().unwrap();
    let diverged = reloaded.trials.iter().find(|t| t.number == 1).unwrap();
    assert_eq!(diverged.state, TrialState::Pruned);
    assert!(diverged.report_at(1).unwrap().is_nan());

    let second = run_diverging(storage, &sink, dir, 5);
    assert_eq!(second.trials.len(), 5);
    assert_eq!(second.count(TrialState::Pruned), 1);
    assert_unique_numbers(&second);
}

#[test]
fn json_study_with_nan_report_resumes() {
    let dir = TempDir::new().unwrap();
    let storage = JsonStudyStorage::new(dir.path().join("studies")).unwrap();
    diverged_trial_reloads(&storage, &dir);
}

#[test]
fn sqlite_study_with_nan_report_resumes() {
    let dir = TempDir::new().unwrap();
    let storage = SqliteStudyStorage::open(&dir.path().join("studies.db")).unwrap();
    diverged_trial_reloads(&storage, &dir);
}

#[test]
fn random_search_over_unbounded_int_range() {
    let dir = TempDir::new().unwrap();
    let storage = JsonStudyStorage::new(dir.path().join("studies")).unwrap();
    let sink = MemorySink::new();
    let space = SearchSpace::new()
        .with("seed", ParamSpec::Int { low: 1, high: i64::MAX, log: false })
        .with("width", ParamSpec::Int { low: 1, high: i64::MAX, log: true })
        .with("lr", ParamSpec::Float { low: 1e-4, high: 1e-1, log: true });
    let mut scheduler = TrialScheduler::new("wide", &storage, &sink, dir.path().join("wide"))
        .unwrap()
        .with_sampler(SamplerConfig::Random { seed: 1 })
        .with_pruner(PrunerConfig::Nop)
        .unwrap();
    let study = scheduler
        .run(&space, &Params::new(), 4, score, Direction::Maximize)
        .unwrap();
    assert_eq!(study.count(TrialState::Complete), 4);
    for trial in &study.trials {
        for (name, spec) in space.iter() {
            assert!(spec.contains(&trial.params[name]), "{name} = {}", trial.params[name]);
        }
    }
}
