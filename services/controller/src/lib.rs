//! Shard controller.
//!
//! Executes queued cluster commands with the migration engine. The
//! controller supplies the Postgres-backed pieces the engine is generic
//! over: cluster metadata, the command queue and node sessions.

pub mod config;
pub mod db;
pub mod node;
