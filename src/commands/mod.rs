//! Subcommand implementations.

pub mod bench;
pub mod fts;
pub mod kv;
