//! SQLite storage layer.
//!
//! Provides:
//! - Connection setup and pragmas shared by every connection
//! - Dedicated writer thread with group commit
//! - Sticky-error transaction handle given to write units
//! - Read-only connection pool for the direct read path

pub mod access;
pub mod batch;
pub mod db;
pub mod handle;
pub mod pragmas;
pub mod reader;
pub mod writer;
