//! Error types for the resource client.
//!
//! # Design
//! Status-derived failures get one variant per family the callers commonly
//! branch on (400, 401, 403, 404, other 4xx, 5xx), plus a catch-all for
//! statuses outside the error range (1xx, or 0 from a broken transport). Each carries an
//! `HttpFailure` with the status, the request URL and whatever the materializer
//! could make of the error body, so server-supplied error payloads stay
//! inspectable. Transport failures come from the `Connection` boundary and are
//! surfaced after the router's single reconnect attempt.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::client::CallResult;

/// Failures reported by a `Connection` implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("timed out getting {0}")]
    Timeout(String),

    #[error("unable to connect to {0}")]
    ConnectionFailed(String),
}

/// Details carried by every HTTP status error.
#[derive(Debug)]
pub struct HttpFailure {
    pub status: u16,
    pub url: String,
    /// Best-effort materialized error body; `None` when the body was empty.
    pub result: Option<CallResult>,
}

/// Errors returned by the request pipeline.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("timed out getting {url}")]
    Timeout { url: String },

    #[error("unable to connect to {url}")]
    ConnectionFailed { url: String },

    #[error("unable to parse response for {url} (status {status}): {message}")]
    ResponseParseFailed {
        status: u16,
        url: String,
        message: String,
    },

    #[error("invalid request method: {0}")]
    InvalidRequestMethod(String),

    #[error("validation failed: {errors:?}")]
    ValidationFailed { errors: BTreeMap<String, Vec<String>> },

    #[error("HTTP 400 bad request for {}", .0.url)]
    BadRequest(Box<HttpFailure>),

    #[error("HTTP 401 unauthorised for {}", .0.url)]
    Unauthorised(Box<HttpFailure>),

    #[error("HTTP 403 forbidden for {}", .0.url)]
    Forbidden(Box<HttpFailure>),

    #[error("HTTP 404 not found for {}", .0.url)]
    NotFound(Box<HttpFailure>),

    #[error("HTTP {} client error for {}", .0.status, .0.url)]
    ClientError(Box<HttpFailure>),

    #[error("HTTP {} server error for {}", .0.status, .0.url)]
    ServerError(Box<HttpFailure>),

    #[error("unexpected HTTP status {} for {}", .0.status, .0.url)]
    UnexpectedStatus(Box<HttpFailure>),

    #[error("invalid content for lazy association {name}: {reason}")]
    InvalidLazyAssociation { name: String, reason: String },

    #[error("missing attribute {0}")]
    MissingAttribute(String),

    #[error("unknown resource type {0}")]
    UnknownResource(String),

    #[error("{resource} has no mapped call named {call}")]
    UnknownCall { resource: String, call: String },

    #[error("{0} has no base URL configured")]
    NoBaseUrl(String),

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ApiError {
    /// Map a non-success status onto its error family.
    pub fn from_status(status: u16, url: String, result: Option<CallResult>) -> Self {
        let failure = Box::new(HttpFailure {
            status,
            url,
            result,
        });
        match status {
            400 => ApiError::BadRequest(failure),
            401 => ApiError::Unauthorised(failure),
            403 => ApiError::Forbidden(failure),
            404 => ApiError::NotFound(failure),
            402..=499 => ApiError::ClientError(failure),
            500..=u16::MAX => ApiError::ServerError(failure),
            _ => ApiError::UnexpectedStatus(failure),
        }
    }

    /// Status-error details, if this is one of the HTTP status families.
    pub fn http_failure(&self) -> Option<&HttpFailure> {
        match self {
            ApiError::BadRequest(f)
            | ApiError::Unauthorised(f)
            | ApiError::Forbidden(f)
            | ApiError::NotFound(f)
            | ApiError::ClientError(f)
            | ApiError::ServerError(f)
            | ApiError::UnexpectedStatus(f) => Some(f),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::ResponseParseFailed { status, .. } => Some(*status),
            other => other.http_failure().map(|f| f.status),
        }
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(url) => ApiError::Timeout { url },
            TransportError::ConnectionFailed(url) => ApiError::ConnectionFailed { url },
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Encoding(err.to_string())
    }
}

impl From<serde_urlencoded::ser::Error> for ApiError {
    fn from(err: serde_urlencoded::ser::Error) -> Self {
        ApiError::Encoding(err.to_string())
    }
}
