//! # rivulet-core
//!
//! Platform-agnostic leaves shared by the rivulet reactor crates.
//!
//! ## Modules
//!
//! - `error` - Error types
//! - `logging` - Kernel-style leveled print macros
//! - `timestamp` - Microsecond wall-clock value type
//! - `current_thread` - Cached kernel tid for loop-affinity checks
//! - `env` - Environment variable utilities

pub mod current_thread;
pub mod env;
pub mod error;
pub mod logging;
pub mod timestamp;

// Re-exports for convenience
pub use error::{NetError, NetResult};
pub use logging::LogLevel;
pub use timestamp::Timestamp;
