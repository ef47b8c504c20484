//! BIM Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, environment parsing and logging for the BIM
//! (bulk import) workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`BimError`] and the [`Result`] alias
//! - **Environment**: typed readers for `BIM_*` variables ([`env`])
//! - **Logging**: [`logging::init_logging`] wires up `tracing-subscriber`
//!
//! # Example
//!
//! ```no_run
//! use bim_common::env;
//!
//! fn worker_count() -> bim_common::Result<usize> {
//!     env::parse_or("BIM_WORKERS", 4)
//! }
//! ```

pub mod env;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{BimError, Result};
