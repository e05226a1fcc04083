/// crmflow: workflow, approval-gate and drip-sequence engine for multi-tenant CRM automation
///
/// Templates bind CRM triggers to ordered task lists; each trigger starts one
/// instance per matching template, and the engine walks its tasks, parking at
/// human approval gates and waking delayed tasks on the periodic tick.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by services and HTTP handlers
pub mod error;

// SQLite pool and schema
pub mod db;

// In-memory engine event log
pub mod events;

// Idempotency cache and rate limiter for the approval gate
pub mod guard;

// Messaging and AI collaborators
pub mod integrations;

// Templates, instances, executions: types, storage and the trigger registry
pub mod workflow;

// Dispatch, advancement, approval gate and background tick
pub mod runtime;

// Drip sequences
pub mod drip;

// HTTP API layer
pub mod api;

// Server setup and initialization
pub mod server;

#[cfg(test)]
mod test_support;

pub use error::{AppError, AppResult};
pub use runtime::{HitlGate, WorkflowEngine};
pub use server::start_server;
pub use workflow::{TriggerType, WorkflowTemplate};
