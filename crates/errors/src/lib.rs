//! Generic error classification shared by every crate in the workspace.
//!
//! An [`ErrorMetadata`] can be attached to an `anyhow::Error` chain via
//! `.context(e /* ErrorMetadata */)`. It tags an error with a classification
//! that downstream layers (HTTP status mapping, metrics, structured logging)
//! can use without needing to match on a domain-specific error type.

use std::borrow::Cow;

use http::StatusCode;
use metrics::log_counter;

mod metrics_impl;

pub use metrics_impl::{
    BAD_REQUEST_ERROR_TOTAL,
    CONFLICT_ERROR_TOTAL,
    INTERNAL_ERROR_TOTAL,
    NOT_FOUND_ERROR_TOTAL,
};

pub const INTERNAL_SERVER_ERROR: &str = "InternalServerError";
pub const INTERNAL_SERVER_ERROR_MSG: &str =
    "Internal server error. Check the server logs for more details.";

/// Error classification used to map to HTTP statuses and to decide whether an
/// error is expected (user-caused) or a server bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed or semantically invalid request. Maps to 400.
    BadRequest,
    /// The named resource doesn't exist (never existed, expired, or was
    /// deleted). Maps to 404.
    NotFound,
    /// An optimistic-concurrency write lost a race. Maps to 409.
    Conflict,
    /// The caller is being throttled. Maps to 429.
    RateLimited,
    /// Anything else: a bug, or an unexpected failure in a dependency. Maps
    /// to 500.
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Tag attached to an `anyhow::Error` via `.context(...)`.
///
/// `short_msg` is a stable, ScreamingCamelCase tag usable in tests and
/// metrics (resilient to copy changes in `msg`). `msg` is the human-facing,
/// developer-readable description.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    pub short_msg: Cow<'static, str>,
    pub msg: Cow<'static, str>,
}

impl ErrorMetadata {
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn conflict(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Conflict,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn rate_limited(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::RateLimited,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Internal,
            short_msg: INTERNAL_SERVER_ERROR.into(),
            msg: msg.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.code == ErrorCode::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    fn bump_metric(&self) {
        let counter = match self.code {
            ErrorCode::BadRequest => &*BAD_REQUEST_ERROR_TOTAL,
            ErrorCode::NotFound => &*NOT_FOUND_ERROR_TOTAL,
            ErrorCode::Conflict => &*CONFLICT_ERROR_TOTAL,
            ErrorCode::RateLimited => return,
            ErrorCode::Internal => &*INTERNAL_ERROR_TOTAL,
        };
        log_counter(counter, 1);
    }
}

/// Extension trait mirroring the classification helpers call sites reach for
/// on `anyhow::Error` chains that may or may not carry an [`ErrorMetadata`].
pub trait ErrorMetadataAnyhowExt {
    fn error_metadata(&self) -> Option<&ErrorMetadata>;
    fn is_conflict(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_bad_request(&self) -> bool;
    fn http_status(&self) -> StatusCode;
    fn short_msg(&self) -> &str;
    /// Log the error (and bump its counter), returning it unchanged, the way
    /// a top-level call site reports an error without swallowing it.
    fn log_and_continue(self) -> Self;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn error_metadata(&self) -> Option<&ErrorMetadata> {
        self.downcast_ref::<ErrorMetadata>()
    }

    fn is_conflict(&self) -> bool {
        self.error_metadata().is_some_and(|e| e.is_conflict())
    }

    fn is_not_found(&self) -> bool {
        self.error_metadata().is_some_and(|e| e.is_not_found())
    }

    fn is_bad_request(&self) -> bool {
        self.error_metadata()
            .is_some_and(|e| e.code == ErrorCode::BadRequest)
    }

    fn http_status(&self) -> StatusCode {
        self.error_metadata()
            .map(|e| e.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn short_msg(&self) -> &str {
        self.error_metadata()
            .map(|e| e.short_msg.as_ref())
            .unwrap_or(INTERNAL_SERVER_ERROR)
    }

    fn log_and_continue(self) -> Self {
        match self.error_metadata() {
            Some(em) => {
                em.bump_metric();
                tracing::warn!("{}: {:#}", em.short_msg, self);
            },
            None => tracing::error!("unclassified error: {:#}", self),
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorCode::NotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::Conflict.http_status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::RateLimited.http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn downcast_through_anyhow_context() {
        let err = anyhow::anyhow!("boom").context(ErrorMetadata::not_found(
            "SessionNotFound",
            "session foo not found",
        ));
        assert!(err.is_not_found());
        assert_eq!(err.http_status(), StatusCode::NOT_FOUND);
    }
}
