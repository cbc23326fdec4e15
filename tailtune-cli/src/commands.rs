//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::StudyAction;
use anyhow::Context as _;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tailtune_core::config::{PathsConfig, WORKSPACE_CONFIG, user_config_path};
use tailtune_core::data::{
    ClassFrequencyTable, ClassVocabulary, FeatureDataset, GroupAwareSplitter, ManifestRecord, Partition,
    SplitOutcome, read_manifest, write_manifest,
};
use tailtune_core::study::storage::validate_study_name;
use tailtune_core::study::{Params, StudyRecord, StudySummary, best_by_param, export_best_params};
use tailtune_core::tracking::{ExperimentSink, FileSink, RunStatus};
use tailtune_core::training::{ModulationCurve, weight_vector};
use tailtune_core::{ComponentRegistry, TailtuneConfig, TrainingPlan, TrialScheduler, TrialState, run_trial};

/// Everything a handler needs, resolved once at startup.
pub struct Context {
    pub workspace: PathBuf,
    pub explicit_config: Option<PathBuf>,
    pub config: TailtuneConfig,
    pub paths: PathsConfig,
}

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, ctx: &Context) -> anyhow::Result<()> {
    match command {
        Commands::Split { output, dry_run } => handle_split(ctx, output, dry_run).await,
        Commands::Weights {
            epochs,
            tau,
            curve,
            rows,
        } => handle_weights(ctx, epochs, tau, curve, rows).await,
        Commands::Train { name, params } => handle_train(ctx, &name, &params).await,
        Commands::Optimize {
            name,
            n_trials,
            timeout,
        } => handle_optimize(ctx, name, n_trials, timeout).await,
        Commands::Study { action } => handle_study(ctx, action).await,
        Commands::Config { action } => handle_config(ctx, action).await,
    }
}

async fn handle_split(ctx: &Context, output: Option<PathBuf>, dry_run: bool) -> anyhow::Result<()> {
    let mut records = load_manifest(&ctx.paths)?;
    let outcome = split_records(ctx, &records)?;
    print_split_summary(&records, &outcome);

    if dry_run {
        return Ok(());
    }
    outcome.assignment.apply(&mut records);
    let target = output.unwrap_or_else(|| ctx.paths.manifest.clone());
    write_manifest(&target, &records)?;
    println!("\nWrote {} samples to {}", records.len(), target.display());
    Ok(())
}

async fn handle_weights(
    ctx: &Context,
    epochs: Option<usize>,
    tau: Option<f64>,
    curve: Option<String>,
    rows: usize,
) -> anyhow::Result<()> {
    let records = load_manifest(&ctx.paths)?;
    let outcome = split_records(ctx, &records)?;
    let vocabulary = ClassVocabulary::from_records(&records);
    let train_labels = records.iter().filter_map(|r| {
        (outcome.assignment.get(&r.id) == Some(Partition::Train))
            .then(|| vocabulary.index_of(&r.label))
            .flatten()
    });
    let counts = ClassFrequencyTable::from_labels(train_labels);

    let (config_tau, config_curve) = match &ctx.config.training.loss {
        tailtune_core::training::LossConfig::SmoothModulation { tau, curve, .. } => (*tau, *curve),
        tailtune_core::training::LossConfig::CrossEntropy { .. } => (0.5, ModulationCurve::default()),
    };
    let tau = tau.unwrap_or(config_tau);
    let curve: ModulationCurve = match curve {
        Some(name) => name.parse()?,
        None => config_curve,
    };
    let max_epoch = epochs.unwrap_or(ctx.config.training.epochs);

    println!("Class weights (tau = {tau}, curve = {curve}, {max_epoch} epochs)\n");
    print!("  {:<8}", "epoch");
    for (index, name) in vocabulary.names().iter().enumerate() {
        print!(" {:>12}", format!("{name}({})", counts.count(index)));
    }
    println!();

    let rows = rows.max(2);
    let mut epochs_shown: Vec<usize> = (0..rows).map(|i| i * max_epoch / (rows - 1)).collect();
    epochs_shown.dedup();
    for epoch in epochs_shown {
        let weights = weight_vector(&counts, epoch, max_epoch, tau, curve)?;
        print!("  {epoch:<8}");
        for index in 0..vocabulary.len() {
            print!(" {:>12.4}", weights.weight(index));
        }
        println!();
    }
    Ok(())
}

async fn handle_train(ctx: &Context, name: &str, overrides: &[String]) -> anyhow::Result<()> {
    validate_study_name(name)?;
    let registry = ComponentRegistry::default();
    ctx.config.split.ratios.validate()?;
    ctx.config.training.validate(&registry)?;

    let params = parse_params(overrides)?;
    let plan = TrainingPlan::from_params(&ctx.config.training, &params)?;
    plan.training.validate(&registry)?;
    let data = load_dataset(ctx)?;

    let sink = FileSink::new(ctx.paths.tracking_dir())?;
    let run = sink.start_run(name, None)?;
    sink.log_params(&run, &flatten_params(&plan)?)?;

    let checkpoint_dir = ctx.paths.checkpoints_dir().join(name);
    let tracking: &dyn ExperimentSink = &sink;
    match plan.train(&registry, &data, &checkpoint_dir, Some((tracking, run.clone()))) {
        Ok(result) => {
            sink.end_run(&run, RunStatus::Finished)?;
            println!("\nRun '{name}' ({run})");
            match result.last_epoch {
                Some(last) => println!("  epochs       {}..={last}", result.start_epoch),
                None => println!("  epochs       none (already at epoch {})", result.start_epoch - 1),
            }
            println!("  monitor      {}", result.monitor);
            match (result.best_metric, result.best_epoch) {
                (Some(value), Some(epoch)) => println!("  best         {value:.4} at epoch {epoch}"),
                _ => println!("  best         none (no monitored value was produced)"),
            }
            if result.stopped_early {
                println!("  stopped early");
            }
            println!("  checkpoints  {}", checkpoint_dir.display());
            Ok(())
        }
        Err(e) => {
            sink.set_tag(&run, "error", &e.to_string())?;
            sink.end_run(&run, RunStatus::Failed)?;
            Err(anyhow::Error::new(e).context(format!("run '{name}' failed")))
        }
    }
}

async fn handle_optimize(
    ctx: &Context,
    name: Option<String>,
    n_trials: Option<usize>,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let registry = ComponentRegistry::default();
    let mut config = ctx.config.clone();
    if let Some(name) = name {
        config.study.name = name;
    }
    if let Some(n) = n_trials {
        config.study.n_trials = n;
    }
    if timeout.is_some() {
        config.study.timeout_secs = timeout;
    }
    config.validate(&registry)?;
    let study_cfg = &config.study;

    let data = load_dataset(ctx)?;
    let storage = study_cfg.storage.open(&ctx.paths.studies_dir())?;
    let sink = FileSink::new(ctx.paths.tracking_dir())?;

    // Ctrl-C stops issuing new trials; the trial in flight finishes.
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing the current trial");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let mut scheduler = TrialScheduler::new(
        &study_cfg.name,
        storage.as_ref(),
        &sink,
        ctx.paths.runs_dir.join("trials").join(&study_cfg.name),
    )?
    .with_sampler(study_cfg.sampler.clone())
    .with_pruner(study_cfg.pruner.clone())?
    .with_cancel_flag(cancel);
    if let Some(limit) = study_cfg.timeout() {
        scheduler = scheduler.with_timeout(limit);
    }

    let study = scheduler.run(
        &study_cfg.search_space,
        &study_cfg.fixed,
        study_cfg.n_trials,
        |trial| run_trial(trial, &registry, &config.training, &data),
        study_cfg.direction,
    )?;

    print_study(&StudySummary::new(&study));
    Ok(())
}

async fn handle_study(ctx: &Context, action: StudyAction) -> anyhow::Result<()> {
    let storage = ctx.config.study.storage.open(&ctx.paths.studies_dir())?;
    match action {
        StudyAction::List => {
            let names = storage.list()?;
            if names.is_empty() {
                println!("No studies in {}", ctx.paths.studies_dir().display());
                return Ok(());
            }
            println!("Studies ({}):", names.len());
            for name in names {
                if let Some(study) = storage.load(&name)? {
                    println!(
                        "  {:<24} {:>4} trials  best {}",
                        name,
                        study.trials.len(),
                        format_value(study.best_trial().and_then(|t| t.final_value))
                    );
                }
            }
            Ok(())
        }
        StudyAction::Show { name, by, json } => {
            let study = load_study(storage.as_ref(), &name)?;
            let summary = StudySummary::new(&study);
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(());
            }
            print_study(&summary);
            if let Some(param) = by {
                println!("\nBest trial per '{param}':");
                for (value, trial) in best_by_param(&study, &param) {
                    println!(
                        "  {:<20} #{:<4} {}",
                        value,
                        trial.number,
                        format_value(trial.final_value)
                    );
                }
            }
            Ok(())
        }
        StudyAction::ExportBest { name, output } => {
            let study = load_study(storage.as_ref(), &name)?;
            let text = export_best_params(&study)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &text).with_context(|| format!("writing {}", path.display()))?;
                    println!("Wrote best parameters of '{name}' to {}", path.display());
                }
                None => print!("{text}"),
            }
            Ok(())
        }
    }
}

async fn handle_config(ctx: &Context, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(&ctx.config)?);
            Ok(())
        }
        ConfigAction::Path => {
            let describe = |path: &Path| {
                if path.exists() { "found" } else { "missing" }
            };
            if let Some(user) = user_config_path() {
                println!("user       {} ({})", user.display(), describe(&user));
            }
            let ws = ctx.workspace.join(WORKSPACE_CONFIG);
            println!("workspace  {} ({})", ws.display(), describe(&ws));
            if let Some(explicit) = &ctx.explicit_config {
                println!("explicit   {} ({})", explicit.display(), describe(explicit));
            }
            println!("env        TAILTUNE_<SECTION>__<KEY>");
            Ok(())
        }
    }
}

fn load_manifest(paths: &PathsConfig) -> anyhow::Result<Vec<ManifestRecord>> {
    let records = read_manifest(&paths.manifest)
        .with_context(|| format!("reading manifest {}", paths.manifest.display()))?;
    if records.is_empty() {
        anyhow::bail!("manifest {} has no samples", paths.manifest.display());
    }
    Ok(records)
}

fn split_records(ctx: &Context, records: &[ManifestRecord]) -> anyhow::Result<SplitOutcome> {
    let split = &ctx.config.split;
    let outcome = GroupAwareSplitter::new(split.ratios, split.group_by.clone(), split.seed)?.split(records)?;
    outcome.assignment.verify_no_leakage(&outcome.group_keys)?;
    Ok(outcome)
}

fn load_dataset(ctx: &Context) -> anyhow::Result<FeatureDataset> {
    let records = load_manifest(&ctx.paths)?;
    let outcome = split_records(ctx, &records)?;
    let data = FeatureDataset::from_manifest(&records, &outcome.assignment, ctx.config.split.group_by.as_deref())?;
    tracing::info!(
        train = data.train.len(),
        val = data.val.len(),
        test = data.test.len(),
        classes = data.num_classes(),
        input_dim = data.input_dim(),
        "dataset ready"
    );
    Ok(data)
}

fn load_study(storage: &dyn tailtune_core::study::StudyStorage, name: &str) -> anyhow::Result<StudyRecord> {
    storage
        .load(name)?
        .ok_or_else(|| anyhow::anyhow!("study '{name}' not found"))
}

/// Parse `key=value` overrides. Values are read as JSON where possible, so
/// `lr=0.01` is a number and `model=mlp_probe` a string.
fn parse_params(pairs: &[String]) -> anyhow::Result<Params> {
    let mut params = Params::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected key=value, got '{pair}'"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::from(raw));
        params.insert(key.trim().to_string(), value);
    }
    Ok(params)
}

fn flatten_params(plan: &TrainingPlan) -> anyhow::Result<BTreeMap<String, serde_json::Value>> {
    match serde_json::to_value(&plan.training)? {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        other => anyhow::bail!("unexpected training config shape: {other}"),
    }
}

fn print_split_summary(records: &[ManifestRecord], outcome: &SplitOutcome) {
    let counts = outcome.assignment.counts();
    println!("Split of {} samples:", records.len());
    for partition in Partition::ALL {
        println!(
            "  {:<6} {:>7} samples  {:>5} groups",
            partition,
            counts.get(&partition).copied().unwrap_or(0),
            outcome.groups_per_partition.get(&partition).copied().unwrap_or(0)
        );
    }
    if outcome.heuristic_keys > 0 {
        println!("  {} samples grouped by an id token", outcome.heuristic_keys);
    }
    if outcome.degraded_keys > 0 {
        println!("  {} samples had no group key and were split individually", outcome.degraded_keys);
    }
}

fn print_study(summary: &StudySummary) {
    println!("\nStudy '{}' ({})", summary.name, summary.direction);
    for state in TrialState::ALL {
        println!("  {:<9} {}", state, summary.count(state));
    }
    match &summary.best {
        Some(best) => {
            println!("\nBest trial #{} = {}", best.number, format_value(best.value));
            for (key, value) in &best.params {
                println!("  {key:<18} {value}");
            }
        }
        None => println!("\nNo completed trial yet."),
    }
    if !summary.trials.is_empty() {
        println!("\n  {:<6} {:<9} {:>10}", "trial", "state", "value");
        for row in &summary.trials {
            println!(
                "  {:<6} {:<9} {:>10}{}",
                row.number,
                row.state,
                format_value(row.value),
                row.error.as_deref().map(|e| format!("  ({e})")).unwrap_or_default()
            );
        }
    }
}

fn format_value(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.4}")).unwrap_or_else(|| "-".into())
}
