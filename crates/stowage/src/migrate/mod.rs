pub mod engine;
pub mod planner;
pub mod rollback;
pub mod space;
pub mod template;
pub mod transfer;

pub use engine::{ExecutionReport, ExecutorOptions, MigrationExecutor, MoveFailure};
pub use planner::{disambiguate, MovePlan, Planner};
pub use rollback::{RollbackEngine, RollbackReport};
pub use space::{get_free_space, space_demands, verify_sufficient_space, SpaceDemand, SpaceInfo};
pub use template::{PathTemplates, TemplateResolver};
pub use transfer::{LocalTransfer, Transfer};
