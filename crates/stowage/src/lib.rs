pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod migrate;
pub mod pipeline;
pub mod util;

pub use classify::{
    Classifier, Dispatcher, FeatureExtractor, FeatureSet, MetadataExtractor, NoModel, Prediction,
    GENERAL_DOCUMENT,
};
pub use config::{Config, DisplacementPolicy, EngineConfig, SourceTree, SourceTreeProvider};
pub use db::{
    CanonicalState, Classification, ClassificationMethod, CorrectionStore, DuplicateLink,
    FileRecord, ManualCorrection, MoveLog, MoveOutcome, MoveRecord, Registry, RuleStore,
    SqliteRegistry,
};
pub use error::{Result, StowageError};
pub use index::{DuplicateResolver, ScanOptions, ScanStats};
pub use migrate::{
    ExecutionReport, ExecutorOptions, LocalTransfer, MigrationExecutor, MovePlan, PathTemplates,
    Planner, RollbackEngine, TemplateResolver, Transfer,
};
pub use pipeline::{CancellationToken, Pipeline, RunSummary};
