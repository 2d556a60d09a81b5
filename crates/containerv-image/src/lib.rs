//! # containerv-image
//!
//! Layer composition for the containerv runtime.
//!
//! Handles:
//! - **Layers**: ordered sources with a target path and a writable flag.
//! - **Packages**: opened archive handles, unpacked once per digest.
//! - **Sources**: `dir://`, `pkg://`, `files://`, and `image://` URIs.
//! - **Hashing**: SHA-256 content addressing.
//! - **Staging**: the on-disk layout of composed trees.
//! - **Composition**: overlay or copy merge of a layer list into a rootfs.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod compose;
pub mod hash;
pub mod layer;
pub mod package;
pub mod source;
pub mod storage;
