//! Hyperparameter studies: search spaces, samplers, pruners, persistent trial
//! history and the sequential scheduler.

pub mod pruner;
pub mod sampler;
pub mod scheduler;
pub mod space;
pub mod storage;
pub mod summary;
pub mod trial;

pub use pruner::{NopPruner, PercentilePruner, Pruner, PrunerConfig};
pub use sampler::{GridSampler, RandomSampler, Sampler, SamplerConfig};
pub use scheduler::TrialScheduler;
pub use space::{ParamSpec, Params, SearchSpace, merge_params};
pub use storage::{JsonStudyStorage, SqliteStudyStorage, StorageConfig, StudyRecord, StudyStorage};
pub use summary::{StudySummary, TrialRow, best_by_param, export_best_params};
pub use trial::{Report, Trial, TrialContext, TrialState};
