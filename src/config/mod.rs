//! Configuration aggregation subsystem.
//!
//! # Data Flow
//! ```text
//! repositories (filesystem, in-memory, embedder-provided)
//!     → reader.rs (mtime-gated rescan, per-file parse cache)
//!     → unified snapshot: Arc<HashMap<name, ObjectConfig>>
//!     → dispatcher (diffs snapshot against its object states)
//! ```
//!
//! # Design Decisions
//! - Snapshots are immutable once published; an unchanged rescan returns the
//!   same `Arc` so consumers can skip work by pointer identity
//! - First registered repository wins name collisions; collisions between
//!   two non-internal repositories are logged
//! - Parse and IO failures are isolated per file; the previous parse of a
//!   broken file stays in effect

pub mod fs;
pub mod memory;
pub mod reader;
pub mod repository;
pub mod settings;

pub use fs::FsRepository;
pub use memory::MemoryRepository;
pub use reader::ConfigReader;
pub use repository::{
    is_same_configuration, lookup_path, ConfigRepository, ObjectConfig, ObjectConfigs,
    INTERNAL_REPOSITORY_PREFIX,
};
pub use settings::{ObjectConfigSettings, UpdateSettings};
