//! Typed error kinds shared across the scheduler, worker, proxy pool, and admin crates.
//!
//! Mirrors the teacher's hand-rolled `Error` (an `anyhow::Error` wrapper with manual trait
//! impls) but adds a `kind()` so call sites can branch the way the error taxonomy requires:
//! a lock-contention error should retry immediately, a store-unavailable error should back off,
//! an upstream-hard-failure error should not be retried at all.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed configuration (env var, CLI flag).
    Configuration,
    /// C1/C2/C3 unreachable or returned a connection-level failure.
    StoreUnavailable,
    /// The item fetcher was rate limited by the marketplace.
    UpstreamRateLimited,
    /// The item fetcher failed in a way that is worth retrying (timeout, 5xx).
    UpstreamTransient,
    /// The item fetcher failed in a way that retrying cannot fix (4xx, malformed response).
    UpstreamHardFailure,
    /// A stored or received payload did not match its expected shape.
    ParsePayload,
    /// Referenced a monitoring task id that does not exist.
    TaskNotFound,
    /// Referenced a monitoring task that exists but is not active.
    TaskInactive,
    /// Another worker/scheduler holds the lock or lease this call needed.
    LockContention,
    /// A conditional update affected zero rows (lost a race on a fenced write).
    DbContention,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::UpstreamRateLimited => "upstream_rate_limited",
            ErrorKind::UpstreamTransient => "upstream_transient",
            ErrorKind::UpstreamHardFailure => "upstream_hard_failure",
            ErrorKind::ParsePayload => "parse_payload",
            ErrorKind::TaskNotFound => "task_not_found",
            ErrorKind::TaskInactive => "task_inactive",
            ErrorKind::LockContention => "lock_contention",
            ErrorKind::DbContention => "db_contention",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: anyhow::Error,
}

impl Error {
    pub fn new(kind: ErrorKind, inner: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            inner: inner.into(),
        }
    }

    pub fn msg(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            inner: anyhow::anyhow!(message.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.inner)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self {
            kind: ErrorKind::StoreUnavailable,
            inner: anyhow::Error::from(value),
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(value: redis::RedisError) -> Self {
        Self {
            kind: ErrorKind::StoreUnavailable,
            inner: anyhow::Error::from(value),
        }
    }
}

/// Attaches an [`ErrorKind`] to an [`anyhow::Result`], for call sites that want the ergonomics
/// of `.context(...)` while still producing a typed [`Error`].
pub trait ResultExt<T> {
    fn kind(self, kind: ErrorKind) -> Result<T>;
}

impl<T> ResultExt<T> for anyhow::Result<T> {
    fn kind(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|e| Error::new(kind, e))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn kind(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|e| Error::new(kind, anyhow::Error::from(e)))
    }
}
