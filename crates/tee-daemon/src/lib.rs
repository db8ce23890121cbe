//! tee-daemon library: native storage, file watching and the CLI surface.
//!
//! The `fs-tee` binary wires these into a [`tee_core::Syncer`]; they are
//! exposed here so integration tests can drive them directly.

pub mod config;
pub mod native_fs;
pub mod signal;
pub mod watcher;

pub use config::{Args, EXIT_INVALID_ARGUMENT, Profile};
pub use native_fs::NativeFs;
pub use watcher::FileWatcher;
