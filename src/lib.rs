//! Hot-reloading loader for named, long-lived domain objects.
//!
//! Object definitions live in configuration repositories; this crate keeps
//! their in-memory representations current as those definitions change.
//!
//! # Architecture Overview
//!
//! ```text
//!  repositories ──▶ ConfigReader ──snapshot──▶ LoadingDispatcher ──▶ callers
//!  (fs, memory,     (aggregate,                (diff, schedule      (query,
//!   embedder)        detect changes)            loads, waits)        await)
//!                          ▲                          ▲
//!                          └── PeriodicUpdater ───────┘
//!                              (tick every 5 s: rescan, reload outdated)
//! ```
//!
//! The caller supplies two capabilities: a [`LoadableFactory`] that builds
//! objects from their parsed definitions, and (optionally) custom
//! [`ConfigRepository`] implementations beyond the bundled filesystem and
//! in-memory ones. The [`Loader`] facade wires everything together.

// Core subsystems
pub mod config;
pub mod dispatcher;
pub mod loader;
pub mod updater;

// Cross-cutting concerns
pub mod error;
pub mod loadable;
pub mod resilience;

pub use config::{
    ConfigReader, ConfigRepository, FsRepository, MemoryRepository, ObjectConfig,
    ObjectConfigSettings, ObjectConfigs, UpdateSettings, INTERNAL_REPOSITORY_PREFIX,
};
pub use dispatcher::{LoadResult, LoadingDispatcher, Status};
pub use error::LoaderError;
pub use loadable::{Lifetime, Loadable, LoadableFactory};
pub use loader::Loader;
pub use updater::PeriodicUpdater;
