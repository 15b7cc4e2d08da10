//! Maestro core types: resource identities, the parsed desired-state
//! resource, readiness evaluation, and the engine's error/config surface.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub mod readiness;
pub mod resource;

pub use resource::{Gvk, ManifestRef, Resource, SliceRef};

/// Identity of a downstream resource within one synthesis.
///
/// The API version is deliberately not part of the identity so a synthesis
/// can migrate a resource across versions without orphaning it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub group: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}/{}/{}", self.kind, self.group, ns, self.name),
            None => write!(f, "{}.{}/{}", self.kind, self.group, self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositionRef {
    pub name: String,
    pub namespace: String,
}

impl fmt::Display for CompositionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference to one synthesis of one composition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SynthesisRef {
    pub composition: CompositionRef,
    pub uuid: String,
}

/// Error classification for the reconcile loops.
///
/// Terminal errors abort only the current work item and are surfaced via
/// status; everything else is requeued with backoff.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("terminal: {0}")]
    Terminal(#[source] anyhow::Error),
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl ReconcileError {
    pub fn terminal(err: impl Into<anyhow::Error>) -> Self {
        ReconcileError::Terminal(err.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReconcileError::Terminal(_))
    }
}

/// Detect the client error returned by mutating requests that lack a
/// namespace. Happens when a CRD flips between cluster and namespace scope;
/// treating it as not-found lets the reconciler recover by recreating.
/// The apiserver only exposes this as a plain string.
pub fn is_missing_namespace_message(msg: &str) -> bool {
    msg.contains("an empty namespace may not be set")
}

/// Apply up to +/-10% of jitter to a requeue interval.
pub fn jitter(d: Duration) -> Duration {
    let factor = 0.9 + rand::random::<f64>() * 0.2;
    d.mul_f64(factor)
}

/// Engine process configuration. All durable state lives in the API server;
/// these knobs only shape the control loops.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Container image that wraps and executes synthesizers.
    pub wrapper_image: String,
    /// Per-synthesis attempt cap before the slot is marked failed.
    pub max_restarts: i32,
    /// Per-synthesis and per-reconcile wall clock bound.
    pub timeout: Duration,
    /// Global cap on concurrently active syntheses.
    pub concurrency_limit: usize,
    /// Inter-dispatch and inter-rollout spacing.
    pub cooldown: Duration,
    pub readiness_poll_interval: Duration,
    /// Rate limit for downstream OpenAPI schema fetches.
    pub discovery_rps: f64,
    /// Optional kubeconfig for the downstream cluster; defaults to the
    /// engine's own cluster when unset.
    pub downstream_kubeconfig: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wrapper_image: String::new(),
            max_restarts: 3,
            timeout: Duration::from_secs(300),
            concurrency_limit: 10,
            cooldown: Duration::from_secs(30),
            readiness_poll_interval: Duration::from_secs(5),
            discovery_rps: 2.0,
            downstream_kubeconfig: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_namespace_detection() {
        assert!(is_missing_namespace_message(
            "an empty namespace may not be set during creation"
        ));
        assert!(!is_missing_namespace_message("not found"));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(100);
        for _ in 0..50 {
            let j = jitter(base);
            assert!(j >= Duration::from_secs(90), "{j:?}");
            assert!(j <= Duration::from_secs(110), "{j:?}");
        }
    }
}
