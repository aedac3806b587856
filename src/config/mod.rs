pub mod schema;

pub use schema::{
    CompactionConfig, ErrorThresholdConfig, ErrorThresholdMode, ExecutionConfig, ModelCost,
    RetrySettings, RlmConfig, SpawnConfig,
};
