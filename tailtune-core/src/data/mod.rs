//! Sample manifests, leakage-free partitioning, and batch production.

pub mod dataset;
pub mod loader;
pub mod manifest;
pub mod split;

pub use dataset::{ClassFrequencyTable, FeatureDataset, Sample, SplitDataset};
pub use loader::{Batch, BatchSource, InMemoryLoader, SampleOrder};
pub use manifest::{ClassVocabulary, ManifestRecord, Partition, read_manifest, write_manifest};
pub use split::{
    GroupAwareSplitter, GroupKeySource, SplitAssignment, SplitOutcome, SplitRatios,
    extract_group_key, split,
};
