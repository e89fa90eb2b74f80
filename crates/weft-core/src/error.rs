//! The engine error taxonomy.
//!
//! Every variant maps to a stable `code()` constant used in the API error
//! envelope, and to an HTTP status at the transport layer. Retryability is
//! a property of the variant, not of the call site: the retry operator and
//! the webhook/schedule planes all consult [`EngineError::is_retryable`].

use uuid::Uuid;

/// Errors produced by the engine and its planes.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed user input (bad graph, bad cron, bad config).
    #[error("{0}")]
    Validation(String),

    /// A referenced entity does not exist for this tenant.
    #[error("{0}")]
    NotFound(String),

    /// The caller failed authentication (webhook signature, api key).
    #[error("{0}")]
    Unauthorized(String),

    /// The caller is authenticated but not allowed (non-assignee completing
    /// a task).
    #[error("{0}")]
    Forbidden(String),

    /// A uniqueness or concurrent-edit conflict.
    #[error("{0}")]
    Conflict(String),

    /// The entity is not in a state that permits the operation (executing a
    /// non-active workflow, completing a non-pending task).
    #[error("{0}")]
    PreconditionFailed(String),

    /// Sub-workflow nesting exceeded the configured limit.
    #[error("sub-workflow depth limit exceeded (max {0})")]
    DepthLimitExceeded(i32),

    /// A node ran past its deadline.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// The execution (or node) was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A circuit breaker refused the call without running the child.
    #[error("circuit open for node {0}")]
    CircuitOpen(String),

    /// A loop source was larger than its configured iteration bound.
    #[error("loop source has {count} items, exceeding max_iterations {max}")]
    IterationLimitExceeded { count: usize, max: usize },

    /// A sub-workflow invocation would re-enter a workflow already on the
    /// parent chain.
    #[error("cyclic sub-workflow invocation of workflow {0}")]
    CyclicSubWorkflow(Uuid),

    /// A join node saw every inbound branch skipped.
    #[error("join node {0} has no completed inbound branch")]
    JoinUnsatisfied(String),

    /// An external dependency (HTTP endpoint, sub-workflow) failed.
    #[error("{0}")]
    Downstream(String),

    /// An expression failed to parse or evaluate.
    #[error("{0}")]
    Expression(String),

    /// Invariant violation; logged and surfaced as a 500.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code for the API envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::PreconditionFailed(_) => "PRECONDITION_FAILED",
            Self::DepthLimitExceeded(_) => "DEPTH_LIMIT_EXCEEDED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Cancelled(_) => "CANCELLED",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::IterationLimitExceeded { .. } => "ITERATION_LIMIT_EXCEEDED",
            Self::CyclicSubWorkflow(_) => "CYCLIC_SUB_WORKFLOW",
            Self::JoinUnsatisfied(_) => "JOIN_UNSATISFIED",
            Self::Downstream(_) => "DOWNSTREAM_ERROR",
            Self::Expression(_) => "EXPRESSION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the retry operator may re-run a child that failed with this
    /// error. A `CircuitOpen` fast-failure is deliberately not retryable:
    /// breaker state is back-pressure, not a transient fault.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Downstream(_) | Self::Timeout(_))
    }

    /// Wrap a storage-layer error.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}
