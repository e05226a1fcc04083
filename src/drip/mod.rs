/// Drip sequences: multi-step delayed messages per enrolled contact

pub mod scheduler;
pub mod storage;
pub mod types;

pub use scheduler::DripScheduler;
pub use storage::DripStorage;
pub use types::{
    ContactDraft, DripSequence, DripStep, Enrollment, EnrollmentStatus, SequenceDraft, StepDraft,
    TickReport,
};
