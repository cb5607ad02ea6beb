//! Structured errors for orchestration.
//!
//! Every failure is a [`Failure`] value plus an ordered chain of context
//! frames (outermost first). Callers branch on [`Error::kind`], never on the
//! rendered message.

use std::fmt;
use std::time::Duration;

use thiserror::Error as ThisError;

use crate::client::{ClientError, ClientErrorKind};
use crate::model::ResourceStatus;
use crate::stack::{StackEvent, StackStatus};
use crate::types::StackName;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Configuration is internally inconsistent. Raised before any remote call.
    Validation,
    NotFound,
    /// Create collision; needs operator action.
    AlreadyExists,
    Conflict,
    /// A wait deadline passed. The remote operation may still be progressing.
    Timeout,
    /// A stack ended in FAILED or ROLLED_BACK.
    StackOperation,
    /// Several independent tasks failed.
    Aggregate,
    /// Throttling or server errors that outlived the bounded retry.
    Transient,
    Cancelled,
    /// Unclassified remote failure.
    Remote,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::NotFound => "not-found",
            Self::AlreadyExists => "already-exists",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
            Self::StackOperation => "stack-operation",
            Self::Aggregate => "aggregate",
            Self::Transient => "transient",
            Self::Cancelled => "cancelled",
            Self::Remote => "remote",
        };
        f.write_str(s)
    }
}

/// What went wrong, without the context chain.
#[derive(Debug, Clone, ThisError)]
pub enum Failure {
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("{resource} already exists")]
    AlreadyExists { resource: String },

    #[error("conflicting operation on {resource}: {message}")]
    Conflict { resource: String, message: String },

    #[error(
        "timed out after {}s waiting for {resource} (last status: {last_status})",
        .elapsed.as_secs()
    )]
    Timeout {
        resource: String,
        last_status: String,
        elapsed: Duration,
    },

    #[error("stack {stack} ended in {status}{}", format_events(.events))]
    StackOperation {
        stack: StackName,
        status: StackStatus,
        events: Vec<StackEvent>,
    },

    #[error("{} of {total} tasks failed: {}", .failures.len(), format_failures(.failures))]
    Aggregate { failures: Vec<Error>, total: usize },

    #[error("polling {resource} failed after {attempts} attempts: {source}")]
    Poll {
        resource: String,
        attempts: u32,
        source: ClientError,
    },

    #[error("cancelled while waiting for {resource}")]
    Cancelled { resource: String },

    #[error(
        "interrupted: {} completed, {} failed [{}], {} in flight and unresolved [{}], {} skipped [{}]",
        .completed.len(),
        .failed.len(),
        .failed.join("; "),
        .unresolved.len(),
        .unresolved.join(", "),
        .skipped.len(),
        .skipped.join(", ")
    )]
    Interrupted {
        completed: Vec<String>,
        /// `"<leaf>: <error>"` for every leaf that failed before the interruption.
        failed: Vec<String>,
        unresolved: Vec<String>,
        skipped: Vec<String>,
    },

    #[error("{resource} entered {status}")]
    ResourceFailed {
        resource: String,
        status: ResourceStatus,
    },

    #[error("stack {stack} has no output {key}")]
    MissingOutput { stack: StackName, key: String },

    #[error("remote call failed: {0}")]
    Remote(ClientError),
}

fn format_events(events: &[StackEvent]) -> String {
    if events.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = events.iter().map(|e| e.to_string()).collect();
    format!(" ({})", rendered.join("; "))
}

fn format_failures(failures: &[Error]) -> String {
    let rendered: Vec<String> = failures.iter().map(|e| e.to_string()).collect();
    rendered.join("; ")
}

/// A failure plus the description chain of the tasks it passed through.
#[derive(Debug, Clone)]
pub struct Error {
    failure: Box<Failure>,
    context: Vec<String>,
}

impl Error {
    pub fn new(failure: Failure) -> Self {
        Self {
            failure: Box::new(failure),
            context: Vec::new(),
        }
    }

    pub fn validation(problems: Vec<String>) -> Self {
        Self::new(Failure::Validation(problems))
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(Failure::NotFound {
            resource: resource.into(),
        })
    }

    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::new(Failure::AlreadyExists {
            resource: resource.into(),
        })
    }

    pub fn cancelled(resource: impl Into<String>) -> Self {
        Self::new(Failure::Cancelled {
            resource: resource.into(),
        })
    }

    /// Combine child failures. `total` is the number of children that ran.
    pub fn aggregate(failures: Vec<Error>, total: usize) -> Self {
        Self::new(Failure::Aggregate { failures, total })
    }

    pub fn kind(&self) -> ErrorKind {
        match self.failure.as_ref() {
            Failure::Validation(_) => ErrorKind::Validation,
            Failure::NotFound { .. } | Failure::MissingOutput { .. } => ErrorKind::NotFound,
            Failure::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Failure::Conflict { .. } => ErrorKind::Conflict,
            Failure::Timeout { .. } => ErrorKind::Timeout,
            Failure::StackOperation { .. } => ErrorKind::StackOperation,
            Failure::Aggregate { .. } => ErrorKind::Aggregate,
            Failure::Poll { .. } => ErrorKind::Transient,
            Failure::Cancelled { .. } | Failure::Interrupted { .. } => ErrorKind::Cancelled,
            Failure::ResourceFailed { .. } => ErrorKind::Remote,
            Failure::Remote(err) => match err.kind {
                ClientErrorKind::NotFound => ErrorKind::NotFound,
                ClientErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                ClientErrorKind::Conflict => ErrorKind::Conflict,
                ClientErrorKind::Throttled | ClientErrorKind::ServerError => ErrorKind::Transient,
                ClientErrorKind::Unknown => ErrorKind::Remote,
            },
        }
    }

    pub fn failure(&self) -> &Failure {
        &self.failure
    }

    /// Context frames, outermost first.
    pub fn context(&self) -> &[String] {
        &self.context
    }

    /// Prepend a context frame. Frames are added while unwinding, so the
    /// newest frame is the outermost.
    pub fn with_context(mut self, frame: impl Into<String>) -> Self {
        self.context.insert(0, frame.into());
        self
    }

    /// Child failures of an aggregate; empty for any other kind.
    pub fn failures(&self) -> &[Error] {
        match self.failure.as_ref() {
            Failure::Aggregate { failures, .. } => failures,
            _ => &[],
        }
    }

    /// Split an aggregate into its children, each carrying the aggregate's
    /// context frames ahead of its own. Any other error yields itself.
    pub fn into_failures(self) -> Vec<Error> {
        let Error { failure, context } = self;
        match *failure {
            Failure::Aggregate { failures, .. } => failures
                .into_iter()
                .map(|mut child| {
                    let mut frames = context.clone();
                    frames.append(&mut child.context);
                    child.context = frames;
                    child
                })
                .collect(),
            other => vec![Error {
                failure: Box::new(other),
                context,
            }],
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.context {
            write!(f, "{}: ", frame)?;
        }
        write!(f, "{}", self.failure)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(self.failure.as_ref())
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        Self::new(failure)
    }
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        Self::new(Failure::Remote(err))
    }
}

/// Attach a context frame to the error side of a result.
pub trait ResultExt<T> {
    fn context(self, frame: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, frame: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_chain_reads_outermost_first() {
        let err = Error::not_found("nodegroup ng-1")
            .with_context("wait for nodegroup ng-1")
            .with_context("create nodegroups");

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.context(), &["create nodegroups", "wait for nodegroup ng-1"]);
        assert_eq!(
            err.to_string(),
            "create nodegroups: wait for nodegroup ng-1: nodegroup ng-1 not found"
        );
    }

    #[test]
    fn test_client_errors_are_classified() {
        let throttled: Error = ClientError::throttled("rate exceeded").into();
        assert_eq!(throttled.kind(), ErrorKind::Transient);

        let exists: Error = ClientError::already_exists("stack eko-a-network").into();
        assert_eq!(exists.kind(), ErrorKind::AlreadyExists);

        let unknown: Error = ClientError::new(ClientErrorKind::Unknown, "boom").into();
        assert_eq!(unknown.kind(), ErrorKind::Remote);
    }

    #[test]
    fn test_aggregate_lists_children() {
        let err = Error::aggregate(
            vec![
                Error::already_exists("stack a").with_context("create a"),
                Error::not_found("b").with_context("delete b"),
            ],
            3,
        );
        assert_eq!(err.kind(), ErrorKind::Aggregate);
        assert_eq!(err.failures().len(), 2);
        let rendered = err.to_string();
        assert!(rendered.starts_with("2 of 3 tasks failed"));
        assert!(rendered.contains("create a: stack a already exists"));
    }

    #[test]
    fn test_into_failures_keeps_paths() {
        let nested = Error::aggregate(vec![Error::not_found("ng-1").with_context("update ng-1")], 2)
            .with_context("nodegroups");
        let flat = nested.into_failures();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].context(), &["nodegroups", "update ng-1"]);

        let single = Error::not_found("x").with_context("a").into_failures();
        assert_eq!(single[0].context(), &["a"]);
    }

    #[test]
    fn test_result_ext_context() {
        let res: std::result::Result<(), ClientError> = Err(ClientError::not_found("x"));
        let err = res.context("describe x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.context(), &["describe x"]);
    }

    #[test]
    fn test_validation_message_joins_problems() {
        let err = Error::validation(vec!["a".into(), "b".into()]);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "invalid configuration: a; b");
    }
}
