//! Access logging for the job API.
//!
//! Handlers on the job endpoints attach a [`JobTrace`] to the response
//! extensions; the middleware folds it into the access line so a submission
//! can be followed from HTTP request to queue outcome by fingerprint alone,
//! without correlating timestamps against worker logs.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

use crate::models::ErrorKind;

/// Job-level context a handler hangs on its response for the access log.
#[derive(Debug, Clone)]
pub struct JobTrace {
    /// Fingerprint of the job the response concerns, when one was computed.
    pub fingerprint: Option<String>,
    /// Failure classification carried by the response: a submit rejection,
    /// or the error kind of a failed job being polled.
    pub failure: Option<ErrorKind>,
}

impl JobTrace {
    /// An accepted submission (queued, attached, or served from cache).
    pub fn submitted(fingerprint: String) -> Self {
        Self {
            fingerprint: Some(fingerprint),
            failure: None,
        }
    }

    /// A submission refused before any work was enqueued.
    pub fn rejected(kind: ErrorKind) -> Self {
        Self {
            fingerprint: None,
            failure: Some(kind),
        }
    }

    /// A poll of an existing job record.
    pub fn polled(fingerprint: String, failure: Option<ErrorKind>) -> Self {
        Self {
            fingerprint: Some(fingerprint),
            failure,
        }
    }
}

/// Log each request with its latency and, where the handler provided one,
/// the job fingerprint and failure kind. Health probes stay out of the log.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path == "/health" {
        return next.run(request).await;
    }

    let started = Instant::now();
    let response = next.run(request).await;
    let latency_ms = started.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    let trace = response.extensions().get::<JobTrace>();
    let fingerprint = trace
        .and_then(|t| t.fingerprint.as_deref())
        .unwrap_or("");
    let failure = trace.and_then(|t| t.failure);

    if status >= 500 {
        warn!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            fingerprint,
            "request errored"
        );
    } else if let Some(kind) = failure {
        info!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            fingerprint,
            kind = kind.as_str(),
            "job request carried an error kind"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            fingerprint,
            "request served"
        );
    }

    response
}
