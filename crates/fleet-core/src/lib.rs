//! Orchestration engine: readiness tracking, stage dispatch, synchronized sampling.
pub mod error;
pub use error::{DispatchError, PlanError, SamplerError, StageError};

mod context;
pub use context::{Assets, RunContext, StageTimeouts};

pub mod conditions;
pub use conditions::{ConditionReport, ConditionTracker, KubePodQuery, LineEvent, ReadinessQuery};

pub mod plan;
pub use plan::{PlanTable, PlanTemplate, PlannedStage, RunPlan};

mod stage;
pub use stage::{Stage, StageRouter};

pub mod pipeline;
pub use pipeline::{Dispatch, Dispatcher, NodeOutcome};

mod processes;
pub use processes::ProcessTable;

pub mod sampler;
pub use sampler::{NodeProbe, SampleLog, SampleSink, Sampler, SamplerConfig, SamplerStats};
