/// Workflow definition layer
///
/// Templates and their tasks, trigger condition matching, SQLite persistence for
/// templates/instances/executions, and the hot-reload trigger registry.

pub mod conditions;
pub mod registry;
pub mod storage;
pub mod types;

pub use conditions::TriggerConfig;
pub use registry::TriggerRegistry;
pub use storage::WorkflowStorage;
pub use types::{
    ExecutionStatus, InstanceStatus, TaskAction, TaskExecution, TriggerContext, TriggerType,
    WorkflowInstance, WorkflowTask, WorkflowTemplate,
};
