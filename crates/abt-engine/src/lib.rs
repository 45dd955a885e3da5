//! Experiment lifecycle, visitor assignment and statistics for abtest.

mod assign;
mod config;
mod export;
mod machine;
mod service;
mod stats;

pub use assign::{AssignmentStrategy, ParticipantAssigner};
pub use config::{
    AssignmentConfig, AssignmentStrategyKind, EngineConfig, StatisticsConfig, StorageBackend,
    StorageConfig,
};
pub use export::{chart_data, export_csv, export_json};
pub use machine::{apply, next_status, Action, ActionKind, ExperimentStateMachine, TRANSITIONS};
pub use service::ExperimentService;
pub use stats::{
    estimate_completion, normal_cdf, time_series_from_logs, two_proportion_z_test,
    ProgressSummary, StatisticsEngine, TimeSeriesPoint, VariantStats, ZTest,
};
