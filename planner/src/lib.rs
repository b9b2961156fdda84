//! Spec-tree planner: compiles a typed specification tree into a persisted
//! plan tree with the help of an oracle, then generates each leaf's files.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (context inheritance, hashing,
//!   guards, governors, negotiation, tolerant response parsing). No I/O,
//!   fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (plan store, cache lookups,
//!   process execution, the provider adapter, the operation log).
//!
//! Orchestration modules ([`compile`], [`build`]) coordinate core logic with
//! I/O to implement the CLI commands.

pub mod build;
pub mod compile;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod spec;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
