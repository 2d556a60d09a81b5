//! Filesystem management for container isolation.
//!
//! Provides bind and `OverlayFS` mounts behind the [`mount::Mounter`] seam,
//! `pivot_root` for switching into a composed rootfs, and worklist-based
//! tree operations that stay flat on deeply nested layer trees.

pub mod mount;
pub mod overlayfs;
pub mod pivot_root;
pub mod tree;
