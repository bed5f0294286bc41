//! Route execution error taxonomy.
//!
//! `Display` renders the user-visible form: kind, route, stage, elapsed
//! time and a redacted parameter summary. The full cause chain is kept in
//! [`RouteError::detail`] for logs only.

use std::fmt;
use std::time::Duration;

use route_store::StoreError;

/// Classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    /// Missing or malformed parameter.
    Validation,
    /// Path or identifier escaped its allowed root or grammar.
    Guard,
    /// Dependency cycle.
    Recursion,
    /// Incompatible route, cache or dependency configuration.
    Configuration,
    /// Rows violated the declared ordering or shard box.
    Constraint,
    /// Timeout, storage exhaustion or other transient resource failure.
    Resource,
    /// Query engine failure.
    Engine,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Guard => "guard",
            Self::Recursion => "recursion",
            Self::Configuration => "configuration",
            Self::Constraint => "constraint",
            Self::Resource => "resource",
            Self::Engine => "engine",
        }
    }

    /// Only resource failures are worth retrying after backoff.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Resource)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution stage a failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Definition and registry checks.
    Validate,
    Bind,
    ResolveDependencies,
    CacheLookup,
    Execute,
    Sort,
    Persist,
    Slice,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Bind => "bind",
            Self::ResolveDependencies => "resolve_dependencies",
            Self::CacheLookup => "cache_lookup",
            Self::Execute => "execute",
            Self::Sort => "sort",
            Self::Persist => "persist",
            Self::Slice => "slice",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed route request.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} error in route `{route_id}` at {stage} after {elapsed:?} [{params}]: {message}")]
pub struct RouteError {
    kind: ErrorKind,
    route_id: String,
    stage: Stage,
    elapsed: Duration,
    params: String,
    message: String,
    detail: String,
}

impl RouteError {
    /// Error raised before any request exists (definition or registry checks).
    pub fn static_check(
        kind: ErrorKind,
        route_id: &str,
        stage: Stage,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            kind,
            route_id: route_id.to_string(),
            stage,
            elapsed: Duration::ZERO,
            params: String::new(),
            detail: message.clone(),
            message,
        }
    }

    pub(crate) fn from_failure(
        failure: StageFailure,
        route_id: &str,
        stage: Stage,
        elapsed: Duration,
        params: String,
    ) -> Self {
        Self {
            kind: failure.kind,
            route_id: route_id.to_string(),
            stage,
            elapsed,
            params,
            message: failure.message,
            detail: failure.detail,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// User-facing message without parameter values.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Full cause chain; may contain parameter values, so logs only.
    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Failure inside one stage, before route context is attached.
#[derive(Debug)]
pub(crate) struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: String,
}

impl StageFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            detail: message.clone(),
            message,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Engine failures keep the verbatim cause chain as detail.
    pub fn engine(context: &str, err: &anyhow::Error) -> Self {
        Self::new(ErrorKind::Engine, format!("{context}: {err}")).with_detail(format!("{err:#}"))
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Resource,
            format!("request timed out after {after:?}"),
        )
    }

    /// Classifies a storage failure.
    pub fn store(context: &str, err: &StoreError) -> Self {
        let kind = if err.is_row_constraint() {
            ErrorKind::Constraint
        } else {
            ErrorKind::Resource
        };
        let message = match kind {
            ErrorKind::Constraint => format!("{context}: {err}"),
            _ if err.is_storage_exhausted() => format!("{context}: cache storage exhausted"),
            _ => format!("{context}: cache storage failure"),
        };
        Self::new(kind, message).with_detail(format!("{context}: {err}"))
    }
}
