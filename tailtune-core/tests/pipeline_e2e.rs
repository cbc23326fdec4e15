//! Manifest to study: split a synthetic camera-trap manifest without group
//! leakage, then grid-search the probe head over it with full tracking.

use std::collections::BTreeMap;

use pretty_assertions::assert_eq;
use serde_json::json;
use tailtune_core::config::TrainingConfig;
use tailtune_core::data::{FeatureDataset, GroupAwareSplitter, ManifestRecord, SplitRatios, read_manifest, write_manifest};
use tailtune_core::registry::ComponentRegistry;
use tailtune_core::study::{
    JsonStudyStorage, ParamSpec, Params, PrunerConfig, SamplerConfig, SearchSpace, StudyStorage, export_best_params,
};
use tailtune_core::tracking::FileSink;
use tailtune_core::training::checkpoint::LAST_FILE;
use tailtune_core::{Direction, StudyRecord, TrialScheduler, TrialState, run_trial};
use tempfile::TempDir;

/// 100 samples over 10 cameras: 60 `deer`, 25 `fox`, 15 `lynx`. Each class
/// sits near its own axis so a probe can separate them within a few epochs.
fn synthetic_manifest() -> Vec<ManifestRecord> {
    let mut records = Vec::with_capacity(100);
    for n in 0..100usize {
        let (label, axis) = match n {
            0..=59 => ("deer", 0),
            60..=84 => ("fox", 1),
            _ => ("lynx", 2),
        };
        let mut features = vec![0.1 * ((n % 3) as f32 - 1.0); 3];
        features[axis] += 1.0;
        records.push(
            ManifestRecord::new(format!("cam{:02}_{n:04}.jpg", n % 10), label)
                .with_meta("camera_id", format!("cam{:02}", n % 10))
                .with_features(features),
        );
    }
    records
}

fn prepare(dir: &TempDir, ratios: SplitRatios) -> FeatureDataset {
    let path = dir.path().join("manifest.jsonl");
    write_manifest(&path, &synthetic_manifest()).unwrap();
    let records = read_manifest(&path).unwrap();
    assert_eq!(records.len(), 100);

    let outcome = GroupAwareSplitter::new(ratios, Some("camera_id".into()), 42)
        .unwrap()
        .split(&records)
        .unwrap();
    outcome.assignment.verify_no_leakage(&outcome.group_keys).unwrap();
    assert_eq!(outcome.degraded_keys, 0);
    assert_eq!(outcome.groups_per_partition.values().sum::<usize>(), 10);

    FeatureDataset::from_manifest(&records, &outcome.assignment, Some("camera_id")).unwrap()
}

fn fixed() -> Params {
    let mut fixed = Params::new();
    fixed.insert("epochs".into(), json!(4));
    fixed.insert("batch_size".into(), json!(8));
    fixed.insert("optimizer".into(), json!("sgd"));
    fixed.insert("hidden_dim".into(), json!(8));
    fixed
}

fn grid() -> SearchSpace {
    SearchSpace::new()
        .with(
            "model",
            ParamSpec::Categorical {
                choices: vec![json!("linear_probe"), json!("mlp_probe")],
            },
        )
        .with(
            "lr",
            ParamSpec::Categorical {
                choices: vec![json!(0.05), json!(0.2)],
            },
        )
}

fn optimize(dir: &TempDir, data: &FeatureDataset, sink: &FileSink) -> StudyRecord {
    let storage = JsonStudyStorage::new(dir.path().join("studies")).unwrap();
    let registry = ComponentRegistry::default();
    let base = TrainingConfig::default();
    let mut scheduler = TrialScheduler::new("probe-grid", &storage, sink, dir.path().join("probe-grid"))
        .unwrap()
        .with_sampler(SamplerConfig::Grid)
        .with_pruner(PrunerConfig::Nop)
        .unwrap();
    let study = scheduler
        .run(
            &grid(),
            &fixed(),
            10,
            |ctx| run_trial(ctx, &registry, &base, data),
            Direction::Maximize,
        )
        .unwrap();
    let stored = storage.load("probe-grid").unwrap().unwrap();
    assert_eq!(stored.trials.len(), study.trials.len());
    assert_eq!(stored.parent_run, study.parent_run);
    study
}

#[test]
fn grid_study_over_probe_heads() {
    let dir = TempDir::new().unwrap();
    let data = prepare(&dir, SplitRatios::new(0.6, 0.2, 0.2).unwrap());
    assert_eq!(data.num_classes(), 3);
    assert_eq!(data.input_dim(), 3);

    let sink = FileSink::new(dir.path().join("tracking")).unwrap();
    let study = optimize(&dir, &data, &sink);

    // Four grid points, then the grid is exhausted.
    assert_eq!(study.trials.len(), 4);
    assert_eq!(study.count(TrialState::Complete), 4, "{:#?}", study.trials);
    let combos: BTreeMap<(String, String), usize> = study
        .trials
        .iter()
        .map(|t| ((t.params["model"].to_string(), t.params["lr"].to_string()), t.number))
        .collect();
    assert_eq!(combos.len(), 4);

    for trial in &study.trials {
        assert_eq!(trial.params["epochs"], json!(4));
        let out = trial.output_dir.as_ref().unwrap();
        assert!(out.join(LAST_FILE).exists(), "missing checkpoint in {}", out.display());
        let value = trial.final_value.unwrap();
        assert!((0.0..=1.0).contains(&value));
    }

    let parent = study.parent_run.clone().unwrap();
    assert_eq!(sink.children(&parent).unwrap().len(), 4);

    let exported = export_best_params(&study).unwrap();
    let parsed: toml::Table = toml::from_str(&exported).unwrap();
    assert!(parsed.contains_key("model"));
    assert!(parsed.contains_key("lr"));
}

#[test]
fn trial_without_validation_data_fails_instead_of_scoring() {
    let dir = TempDir::new().unwrap();
    let data = prepare(&dir, SplitRatios::new(0.8, 0.0, 0.2).unwrap());
    assert!(data.val.is_empty());

    let sink = FileSink::new(dir.path().join("tracking")).unwrap();
    let study = optimize(&dir, &data, &sink);

    assert_eq!(study.count(TrialState::Complete), 0);
    assert_eq!(study.count(TrialState::Failed), 4);
    assert!(study.trials.iter().all(|t| t.final_value.is_none()));
    assert!(study.best_trial().is_none());
    assert!(export_best_params(&study).is_err());
}
