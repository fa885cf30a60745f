//! Hybrid executor routing: picks the lane a task runs in.
//!
//! The decision is made once, at submission, from the caller's explicit
//! classification. A task never changes lane afterwards.

use crate::core::task::{Classification, Lane, TaskSpec};

#[derive(Debug, Clone, Copy, Default)]
pub struct HybridRouter;

impl HybridRouter {
    pub fn new() -> Self {
        Self
    }

    /// Lane for `spec`.
    ///
    /// `Auto` consults the declared workload hint first and falls back to the
    /// payload's shape: blocking closures go to the CPU lane, futures to I/O.
    pub fn route(&self, spec: &TaskSpec) -> Lane {
        match spec.classification {
            Classification::IoBound => Lane::Io,
            Classification::CpuBound => Lane::Cpu,
            Classification::Auto => spec
                .hint
                .map(|hint| hint.preferred_lane())
                .unwrap_or_else(|| spec.payload.natural_lane()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::payload::TaskPayload;
    use crate::core::task::WorkloadHint;
    use serde_json::json;

    fn blocking() -> TaskSpec {
        TaskSpec::new(TaskPayload::blocking(|| Ok(json!(1))))
    }

    fn future() -> TaskSpec {
        TaskSpec::new(TaskPayload::future(|_ctx| async { Ok(json!(1)) }))
    }

    #[test]
    fn test_explicit_classification_wins() {
        let router = HybridRouter::new();
        assert_eq!(
            router.route(&blocking().classification(Classification::IoBound)),
            Lane::Io
        );
        assert_eq!(
            router.route(
                &future()
                    .classification(Classification::CpuBound)
                    .hint(WorkloadHint::Network)
            ),
            Lane::Cpu
        );
    }

    #[test]
    fn test_auto_uses_hint() {
        let router = HybridRouter::new();
        assert_eq!(router.route(&blocking().hint(WorkloadHint::Database)), Lane::Io);
        assert_eq!(router.route(&future().hint(WorkloadHint::Encoding)), Lane::Cpu);
    }

    #[test]
    fn test_auto_without_hint_follows_payload_shape() {
        let router = HybridRouter::new();
        assert_eq!(router.route(&blocking()), Lane::Cpu);
        assert_eq!(router.route(&future()), Lane::Io);
    }
}
