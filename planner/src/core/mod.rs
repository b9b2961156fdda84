//! Deterministic, pure logic shared by the planner.
//!
//! Core modules are free of filesystem and process side effects. They
//! operate on in-memory data and return deterministic outputs suitable for
//! tests. The only shared mutable state lives in [`governor`] (atomic
//! counters) and [`registry`] (insert-if-absent maps).

pub mod commands;
pub mod context;
pub mod governor;
pub mod guards;
pub mod hash;
pub mod negotiation;
pub mod path;
pub mod provenance;
pub mod registry;
pub mod response;
pub mod sourcemap;
pub mod types;
