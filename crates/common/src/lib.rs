//! Shared building blocks for Warden
//!
//! - [`ids`]: hostname and storage-prefix newtypes
//! - [`errors`]: the error classification every component reports through
//! - [`exec`]: external command runner
//! - [`logging`]: per-invocation tracing setup

pub mod errors;
pub mod exec;
pub mod ids;
pub mod logging;

pub use errors::{Classify, ErrorKind, IdError};
pub use exec::{CommandOutput, CommandRunner, ExecError};
pub use ids::{Fqdn, StoragePrefix};
pub use logging::LogFormat;
