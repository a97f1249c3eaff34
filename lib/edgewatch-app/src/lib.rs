//! Process bootstrap helpers.
//!
//! Everything an `edgewatch` binary needs before the engine itself starts: logging setup and a way to bail out with a
//! readable message when bootstrapping fails.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration, LoggingGuard};
}
