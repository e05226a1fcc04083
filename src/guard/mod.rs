/// Request guards for the approval gate endpoints
///
/// Both components are plain owned values held by application state, so each test
/// or server instance gets its own and nothing leaks between them.

pub mod idempotency;
pub mod rate_limit;

pub use idempotency::{CachedResponse, IdempotencyCache, IdempotencyKey};
pub use rate_limit::SlidingWindowLimiter;
