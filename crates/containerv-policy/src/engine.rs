//! The process-wide policy engine.
//!
//! The engine's status is decided once, when it is initialized, and never
//! changes afterwards. Daemons share one engine through
//! [`PolicyEngine::initialize`]; tests and embedders that want their own
//! build one with the explicit constructors.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use containerv_common::error::{ContainervError, Result};
use containerv_common::types::ContainerId;

use crate::backend::{
    ContainerMetrics, NoOpPolicyBackend, PolicyBackend, PolicyMetrics, PolicyStatus,
};
use crate::spec::PolicySpec;

static ENGINE: OnceLock<Arc<PolicyEngine>> = OnceLock::new();

#[derive(Debug)]
enum EngineState {
    NotSupported(NoOpPolicyBackend),
    Available(Box<dyn PolicyBackend>),
    Error(String),
}

/// Policy enforcement with a fixed status.
#[derive(Debug)]
pub struct PolicyEngine {
    state: EngineState,
}

impl PolicyEngine {
    /// Returns the shared engine, detecting it from `pin_dir` on first use.
    /// Later calls return the same engine whatever directory they pass.
    pub fn initialize(pin_dir: &Path) -> Arc<Self> {
        Arc::clone(ENGINE.get_or_init(|| Arc::new(Self::detect(pin_dir))))
    }

    /// Detects the enforcement mechanism without touching the shared engine.
    ///
    /// Without the `ebpf` feature, or when `pin_dir` does not exist, the
    /// engine is `NotSupported`. Pins that exist but cannot be opened make
    /// it `Error`.
    #[must_use]
    pub fn detect(pin_dir: &Path) -> Self {
        #[cfg(all(target_os = "linux", feature = "ebpf"))]
        {
            if pin_dir.is_dir() {
                return match crate::pinned::PinnedMapStore::open(pin_dir) {
                    Ok(store) => Self::with_backend(Box::new(
                        crate::backend::BpfPolicyBackend::new(store),
                    )),
                    Err(e) => Self::failed(e.to_string()),
                };
            }
        }
        tracing::info!(pin_dir = %pin_dir.display(), "policy enforcement not supported on this host");
        Self::unsupported()
    }

    /// An engine that enforces nothing.
    #[must_use]
    pub const fn unsupported() -> Self {
        Self {
            state: EngineState::NotSupported(NoOpPolicyBackend),
        }
    }

    /// An engine enforcing through `backend`.
    #[must_use]
    pub fn with_backend(backend: Box<dyn PolicyBackend>) -> Self {
        tracing::info!(status = %backend.status(), "policy backend ready");
        Self {
            state: EngineState::Available(backend),
        }
    }

    /// An engine whose mechanism failed to initialize with `reason`.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::warn!(%reason, "policy backend failed to initialize");
        Self {
            state: EngineState::Error(reason),
        }
    }

    /// Status fixed at construction.
    #[must_use]
    pub const fn status(&self) -> PolicyStatus {
        match self.state {
            EngineState::NotSupported(_) => PolicyStatus::NotSupported,
            EngineState::Available(_) => PolicyStatus::Available,
            EngineState::Error(_) => PolicyStatus::Error,
        }
    }

    fn backend(&self) -> Result<&dyn PolicyBackend> {
        match &self.state {
            EngineState::NotSupported(noop) => Ok(noop),
            EngineState::Available(backend) => Ok(backend.as_ref()),
            EngineState::Error(reason) => Err(ContainervError::internal(format!(
                "policy backend unavailable: {reason}"
            ))),
        }
    }

    /// See [`PolicyBackend::populate_policy`].
    ///
    /// # Errors
    ///
    /// `NotSupported` without enforcement, `Internal` in the error state.
    pub fn populate_policy(&self, id: &ContainerId, rootfs: &Path, spec: &PolicySpec) -> Result<()> {
        self.backend()?.populate_policy(id, rootfs, spec)
    }

    /// See [`PolicyBackend::cleanup_policy`].
    ///
    /// # Errors
    ///
    /// `Internal` in the error state.
    pub fn cleanup_policy(&self, id: &ContainerId) -> Result<()> {
        self.backend()?.cleanup_policy(id)
    }

    /// See [`PolicyBackend::get_metrics`].
    ///
    /// # Errors
    ///
    /// `NotSupported` without enforcement, `Internal` in the error state.
    pub fn get_metrics(&self) -> Result<PolicyMetrics> {
        self.backend()?.get_metrics()
    }

    /// See [`PolicyBackend::get_container_metrics`].
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `NotSupported` without enforcement,
    /// `Internal` in the error state.
    pub fn get_container_metrics(&self, id: &ContainerId) -> Result<ContainerMetrics> {
        self.backend()?.get_container_metrics(id)
    }

    /// See [`PolicyBackend::sanity_check_pins`].
    ///
    /// # Errors
    ///
    /// `Internal` in the error state or for a missing pin.
    pub fn sanity_check_pins(&self) -> Result<()> {
        self.backend()?.sanity_check_pins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BpfPolicyBackend;
    use crate::maps::MemoryMapStore;

    #[test]
    fn missing_pin_dir_is_not_supported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = PolicyEngine::detect(&dir.path().join("bpf"));
        assert_eq!(engine.status(), PolicyStatus::NotSupported);
        engine.sanity_check_pins().expect("stub sanity check");
        engine
            .cleanup_policy(&ContainerId::new("c1"))
            .expect("stub cleanup");
    }

    #[test]
    fn error_state_fails_every_call_with_internal() {
        let engine = PolicyEngine::failed("verifier rejected program");
        let id = ContainerId::new("c1");
        assert_eq!(engine.status(), PolicyStatus::Error);
        for result in [
            engine.populate_policy(&id, Path::new("/"), &PolicySpec::default()),
            engine.cleanup_policy(&id),
            engine.sanity_check_pins(),
        ] {
            assert!(matches!(result, Err(ContainervError::Internal { .. })));
        }
        assert!(matches!(
            engine.get_metrics(),
            Err(ContainervError::Internal { .. })
        ));
    }

    #[test]
    fn available_engine_delegates() {
        let engine = PolicyEngine::with_backend(Box::new(BpfPolicyBackend::new(
            MemoryMapStore::new(),
        )));
        let id = ContainerId::new("c1");
        assert_eq!(engine.status(), PolicyStatus::Available);
        engine
            .populate_policy(&id, Path::new("/"), &PolicySpec::default())
            .expect("populate");
        assert_eq!(engine.get_metrics().expect("metrics").containers, 1);
    }

    #[test]
    fn initialize_returns_one_shared_engine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = PolicyEngine::initialize(dir.path());
        let b = PolicyEngine::initialize(Path::new("/elsewhere"));
        assert!(Arc::ptr_eq(&a, &b));
    }
}
