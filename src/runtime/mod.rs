/// Runtime: everything that moves workflow instances forward
///
/// - `engine`: trigger dispatch, the execution advancer, pause/resume
/// - `executor`: side effects of a single task through the collaborators
/// - `hitl`: approve/reject of approval gates
/// - `dispatcher`: fire-and-forget trigger queue with a worker pool
/// - `scheduler`: periodic tick over delayed executions and drip messages

pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod hitl;
pub mod scheduler;

pub use dispatcher::TriggerDispatcher;
pub use engine::{AdvanceOutcome, DispatchReport, WorkflowEngine};
pub use executor::TaskExecutor;
pub use hitl::{GateDecision, HitlGate};
pub use scheduler::{TickService, TickSummary};
