// Invariant Framework
//
// Invariants are pure rules that must hold for every frame a
// connection emits. Violations are detected *before* bytes reach
// the client.

use crate::log::{BuildEvent, BuildId, Seq};

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// What a connection has emitted so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitCursor {
    pub build_id: BuildId,
    pub last_emitted_seq: Seq,
}

/// Trait implemented by all invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, cursor: &EmitCursor, event: &BuildEvent) -> InvariantResult;
}

/// Emitted `seq` values must be strictly increasing.
pub struct MonotonicSeq;

impl Invariant for MonotonicSeq {
    fn name(&self) -> &'static str {
        "monotonic-seq"
    }

    fn validate(&self, cursor: &EmitCursor, event: &BuildEvent) -> InvariantResult {
        if event.seq <= cursor.last_emitted_seq {
            InvariantResult::Fail(format!(
                "seq {} does not advance past {}",
                event.seq, cursor.last_emitted_seq
            ))
        } else {
            InvariantResult::Pass
        }
    }
}

/// A connection only ever carries events of the build it was opened for.
pub struct SameBuild;

impl Invariant for SameBuild {
    fn name(&self) -> &'static str {
        "same-build"
    }

    fn validate(&self, cursor: &EmitCursor, event: &BuildEvent) -> InvariantResult {
        if event.build_id != cursor.build_id {
            InvariantResult::Fail(format!(
                "event of build {} on a stream for build {}",
                event.build_id, cursor.build_id
            ))
        } else {
            InvariantResult::Pass
        }
    }
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantEngine {
    /// Create an empty invariant engine.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// The checks every connection writer runs.
    pub fn for_stream() -> Self {
        let mut engine = Self::new();
        engine.register(SameBuild);
        engine.register(MonotonicSeq);
        engine
    }

    /// Register an invariant.
    pub fn register<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(&self, cursor: &EmitCursor, event: &BuildEvent) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(cursor, event) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invariant `{invariant}` violated: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub reason: String,
}
