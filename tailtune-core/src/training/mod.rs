//! Training: modulated losses, probe heads, optimizers, checkpoints and the
//! resumable epoch loop.

pub mod callbacks;
pub mod checkpoint;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod modulation;
pub mod optim;
pub mod runner;

pub use callbacks::{EarlyStopMonitor, EarlyStopState};
pub use checkpoint::{Checkpoint, CheckpointStore, EpochState, fingerprint};
pub use loss::{ClassificationLoss, LossConfig, LossOutput, Reduction};
pub use metrics::{Direction, EpochMetrics, MonitoredMetric, TrainingHistory};
pub use model::{FeatureModel, LinearProbe, Logits, MlpProbe, Model, Parameter, StateDict, Tensor};
pub use modulation::{ClassWeights, ModulationCurve, ModulationSchedule, weight_vector};
pub use optim::{LrScheduler, Optimizer, OptimizerConfig, SchedulerConfig};
pub use runner::{RunConfig, RunResult, TrainingRun, TrialReporter};
