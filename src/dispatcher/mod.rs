//! Load lifecycle subsystem.
//!
//! # State Transitions
//! ```text
//! NOT_LOADED → LOADING → LOADED | FAILED
//! LOADED → LOADED_AND_RELOADING → LOADED | LOADED (stale error kept)
//! FAILED → FAILED_AND_RELOADING → LOADED | FAILED
//! ```
//!
//! # Design Decisions
//! - One mutex guards all dispatcher state; factory calls and modification
//!   probes run with the lock released
//! - Every load attempt carries a strictly monotonic `loading_id`; a
//!   completion publishes its result only if the token still matches, which
//!   stands in for true task interruption
//! - Waiters park on a `Notify` bound to the mutex and recheck their
//!   predicate on every state change

pub mod engine;
pub mod status;

pub use engine::LoadingDispatcher;
pub use status::{LoadResult, Status};
