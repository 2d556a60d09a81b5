//! Container lifecycle for containerv.
//!
//! [`ContainerManager`] owns every container of the process. It picks one
//! isolation backend at startup (Linux namespaces over a composed rootfs,
//! or a VM booted from a disk chain), installs network policy through the
//! shared [`PolicyEngine`](containerv_policy::PolicyEngine), and tears
//! everything down in reverse on destroy.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod container;
pub mod manager;
pub mod spawn;

pub use container::{Container, ContainerInfo, ContainerSpec};
pub use manager::ContainerManager;
pub use spawn::{OutputLine, OutputStream, SpawnFlags, SpawnOutcome, SpawnRequest};
