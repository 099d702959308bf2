use serde::{Deserialize, Serialize};
use std::fmt;

/// Side-effect class of a pipeline operation.
/// Ordered by how much external state the operation can touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Effect {
    /// Computed from inputs only. Never reaches the tool gateway.
    Pure,
    /// Reads external state through the gateway (log search).
    Observe,
    /// Writes external state through the gateway (work items).
    Mutate,
}

impl Effect {
    /// What a stage does when an operation of this class fails.
    pub fn failure_policy(&self) -> FailurePolicy {
        match self {
            Effect::Pure | Effect::Observe => FailurePolicy::Degrade,
            Effect::Mutate => FailurePolicy::Surface,
        }
    }

    pub fn touches_gateway(&self) -> bool {
        !matches!(self, Effect::Pure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Pure => "pure",
            Effect::Observe => "observe",
            Effect::Mutate => "mutate",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure handling at a stage boundary, derived from [`Effect`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Fold the failure into a low-confidence record and keep the run going.
    Degrade,
    /// Fail the run. An incident believed ticketed must actually be ticketed.
    Surface,
}

/// Any operation that has a classified effect.
pub trait Effectful {
    fn effect(&self) -> Effect;

    fn failure_policy(&self) -> FailurePolicy {
        self.effect().failure_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_failures_degrade() {
        assert_eq!(Effect::Observe.failure_policy(), FailurePolicy::Degrade);
        assert!(Effect::Observe.touches_gateway());
    }

    #[test]
    fn mutate_failures_surface() {
        assert_eq!(Effect::Mutate.failure_policy(), FailurePolicy::Surface);
    }

    #[test]
    fn pure_never_touches_gateway() {
        assert!(!Effect::Pure.touches_gateway());
        assert!(Effect::Pure < Effect::Observe && Effect::Observe < Effect::Mutate);
    }

    #[test]
    fn serializes_as_variant_name() {
        let json = serde_json::to_string(&Effect::Mutate).unwrap();
        assert_eq!(json, "\"Mutate\"");
    }
}
