// Key-migration core: plan -> copy -> verify -> swap

pub mod budget;
pub mod checkpoint;
pub mod executor;
pub mod mover;
pub mod plan;
pub mod planner;
pub mod verification;

pub use budget::{BudgetGovernor, BudgetGovernorConfig, BudgetPermit};
pub use checkpoint::{
    CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, MigrationCheckpoint,
};
pub use executor::{
    MigrationExecutor, MigrationOptions, MigrationProgressEvent, MigrationProgressSink,
    MigrationSummary, NoopProgressSink,
};
pub use mover::{DataMover, EntityReader, InMemoryDataMover, MapStoreSwapper, MapSwapper, ShardEntity};
pub use plan::{KeyMove, KeyMoveState, MigrationPlan, TopologySnapshot};
pub use planner::{MigrationPlanner, DEFAULT_SEGMENT_SIZE};
pub use verification::{
    ChecksumProjection, ChecksumVerification, FullEqualityVerification, RowVersionVerification,
    VerificationStrategy,
};
