//! # containerv-core
//!
//! Low-level isolation primitives for the containerv runtime.
//!
//! This crate provides safe abstractions over:
//! - **Identity**: real vs. effective caller identity and uid/gid maps.
//! - **Namespaces**: a namespace-holder process per container and the
//!   handles that keep its namespaces alive.
//! - **Filesystem**: bind and `OverlayFS` mounts, `pivot_root`, and
//!   worklist-based tree operations.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod filesystem;
pub mod identity;
pub mod namespace;
