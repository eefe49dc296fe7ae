//! Crate-wide error taxonomy.
//!
//! Identifiers here are stable: they are used both in `Display` output and as the
//! `tags` recorded against a request (e.g. `passthrough-error:ECONNRESET`). Callers
//! matching on tag strings should match on the `Display` output, not on variant
//! names, since variant names are free to change without breaking the wire contract.

use thiserror::Error;

/// A synthetic error signalling intentional connection termination.
///
/// Produced by the `CloseConnection`/`ResetConnection` steps and by callback/
/// `beforeResponse` handlers returning `"close"`/`"reset"`. The transport layer
/// MUST close or reset the downstream socket on seeing this and MUST NOT write an
/// error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    Close,
    Reset,
}

#[derive(Debug, Clone, Copy, Error)]
#[error("connection aborted intentionally ({kind:?})")]
pub struct AbortError {
    pub kind: AbortKind,
}

impl AbortError {
    pub fn close() -> Self {
        Self {
            kind: AbortKind::Close,
        }
    }

    pub fn reset() -> Self {
        Self {
            kind: AbortKind::Reset,
        }
    }
}

/// Stable error taxonomy for rule construction, step execution, and pass-through.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A rule was constructed with no matchers.
    #[error("no-matcher: a rule must have at least one matcher")]
    NoMatcher,

    /// A rule was constructed with no steps.
    #[error("no-step: a rule must have at least one step")]
    NoStep,

    /// A non-last step in a pipeline was marked final.
    #[error("final-step-not-last: step {index} ({kind}) is final but is not the last step")]
    FinalStepNotLast { index: usize, kind: &'static str },

    /// A step or matcher failed its own constructor-time validation.
    #[error("validation: {0}")]
    Validation(String),

    /// The rule or request referenced an id/index that does not exist.
    #[error("invalid-rule: {0}")]
    InvalidRule(String),

    /// Intentional termination, not a failure to report upstream.
    #[error(transparent)]
    Abort(#[from] AbortError),

    /// TLS alert encountered while talking to the upstream.
    #[error("upstream-tls-error:ssl-alert-{alert}")]
    UpstreamTlsError { alert: u8 },

    /// Upstream connection-level failure (ECONNRESET, ENOTFOUND, ...).
    #[error("upstream-error:{code}")]
    UpstreamError { code: String },

    /// A pass-through step would forward a request back into a socket this
    /// handler already has open upstream.
    #[error("loop-detected: request would forward back into an already-open upstream connection")]
    LoopDetected,

    /// A user callback (local closure or remote RPC) threw/returned an error.
    #[error("callback-threw: {0}")]
    CallbackThrew(String),

    /// A body could not be decoded into the shape the caller requested.
    #[error("decode-error: {0}")]
    DecodeError(String),

    /// A `Stream` step instance was invoked more than once.
    #[error("stream-reused: stream step instances can only be used for a single request")]
    StreamReused,

    /// Channel/RPC transport failure (framing, correlation, serialization).
    #[error("channel-error: {0}")]
    Channel(String),

    #[error("io-error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Hyper(#[from] hyper::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Stable tag string recorded against `RequestFingerprint::tags` / `res.tags`,
    /// per the error-handling design's `<kind>:<detail>` convention.
    pub fn tag(&self) -> String {
        self.to_string()
    }

    /// Whether this error should be surfaced as a `502` with the standard body,
    /// as opposed to an intentional abort (no body at all).
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamError { .. }
                | ProxyError::UpstreamTlsError { .. }
                | ProxyError::Hyper(_)
                | ProxyError::Io(_)
        )
    }
}
