//! I/O helpers for planner commands.

pub mod cache;
pub mod config;
pub mod oplog;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod provider;
