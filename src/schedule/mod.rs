//! Buffer scheduling: lifetimes, aliasing, grouping and placement.

pub mod alias;
pub mod buffer;
pub mod fixer;
pub mod lifetime;
pub mod physical;
pub mod scheduler;

pub use alias::{
    default_alias_rules, AliasAnalyzer, AliasRule, AliasStats, ConcatAliasRule, ReshapeAliasRule,
    RuleResult, SliceAliasRule,
};
pub use buffer::{
    BufferAlias, BufferId, Lifetime, LogicalBuffer, LogicalBufferStore, MemoryLocation, MemorySpan,
    PhysicalBuffer, PhysicalId,
};
pub use fixer::{FixStats, LifetimeFixer};
pub use lifetime::LifetimeRecorder;
pub use physical::PhysicalBufferBuilder;
pub use scheduler::{schedule_module, AllocationTable, BufferAllocation, ScheduleResult, Scheduler};
