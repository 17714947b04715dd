//! CDP Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Utilities shared by the CDP workspace members:
//!
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//! - **Checksums**: SHA-256 content hashes for archived payloads
//! - **Errors**: the error type returned by the helpers above

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
