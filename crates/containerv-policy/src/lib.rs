//! # containerv-policy
//!
//! Per-container network and resource policy for the containerv runtime.
//!
//! - **Spec**: allowed destinations and traffic quota.
//! - **Maps**: the rule/quota key layout and an in-memory store.
//! - **Backends**: BPF map enforcement, or a no-op stub reporting
//!   `NotSupported` where the host cannot enforce anything.
//! - **Engine**: one process-wide engine whose status is fixed at startup.
//!
//! The `ebpf` feature enables the store over maps pinned in bpffs; the
//! host must have them pinned for enforcement to become available.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod engine;
pub mod maps;
#[cfg(all(target_os = "linux", feature = "ebpf"))]
pub mod pinned;
pub mod spec;

pub use backend::{PolicyBackend, PolicyStatus};
pub use engine::PolicyEngine;
pub use spec::PolicySpec;
