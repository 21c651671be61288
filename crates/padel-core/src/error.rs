use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Closed taxonomy of failures surfaced to the UI and to reporting sinks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppErrorCode {
    /// The device has no network connectivity.
    Offline,
    /// The request was cancelled, either by its timer or by the caller.
    Timeout,
    /// The session is no longer valid (HTTP 401).
    AuthExpired,
    /// The backend refused access to the resource (HTTP 403).
    Forbidden,
    /// The resource does not exist (HTTP 404).
    NotFound,
    /// The backend rejected the payload (HTTP 422).
    Validation,
    /// The backend failed (HTTP 5xx).
    ServerError,
    /// Anything that did not match a more specific rule.
    Unknown,
}

impl AppErrorCode {
    /// Stable machine-readable name, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Timeout => "timeout",
            Self::AuthExpired => "auth_expired",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::ServerError => "server_error",
            Self::Unknown => "unknown",
        }
    }

    fn default_message(self) -> &'static str {
        match self {
            Self::Offline => "you appear to be offline",
            Self::Timeout => "the request timed out",
            Self::AuthExpired => "your session has expired, please sign in again",
            Self::Forbidden => "you do not have permission to do that",
            Self::NotFound => "the requested resource was not found",
            Self::Validation => "the submitted data is invalid",
            Self::ServerError => "the server encountered an error",
            Self::Unknown => "an unexpected error occurred",
        }
    }
}

/// The single error currency of the data layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Error)]
#[error("{}: {message}", code.as_str())]
pub struct AppError {
    /// Taxonomy bucket.
    pub code: AppErrorCode,
    /// Human-readable message.
    pub message: String,
    /// HTTP status when the failure came from a response.
    pub status: Option<u16>,
    /// Raw response body for validation failures.
    pub details: Option<Value>,
}

impl AppError {
    /// Construct an error with an explicit message.
    pub fn new(code: AppErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            details: None,
        }
    }

    /// Construct an error carrying the default message for `code`.
    pub fn from_code(code: AppErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Shorthand for a timeout error.
    pub fn timeout() -> Self {
        Self::from_code(AppErrorCode::Timeout)
    }

    /// Shorthand for an unknown error with the underlying message.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(AppErrorCode::Unknown, message)
    }

    /// Attach the HTTP status the error was derived from.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether the UI should offer a retry affordance for this failure.
    pub fn is_retry_affordable(&self) -> bool {
        matches!(
            self.code,
            AppErrorCode::Offline | AppErrorCode::Timeout | AppErrorCode::ServerError
        )
    }

    /// Whether this failure must trigger the forced sign-out flow.
    pub fn requires_sign_out(&self) -> bool {
        self.code == AppErrorCode::AuthExpired
    }
}

/// Low-level failure observed by a transport before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFailure {
    /// Already classified upstream.
    App(AppError),
    /// The transport could not reach the network.
    Offline(String),
    /// The request was aborted by its timer or an external signal.
    Cancelled,
    /// The backend answered with a non-2xx status.
    Status {
        /// HTTP status code.
        status: u16,
        /// Best-effort parsed body.
        body: Option<Value>,
    },
    /// Any other failure, with its message.
    Other(String),
}

/// Map an HTTP status to a taxonomy code. `None` means the status is not
/// covered by a specific rule.
pub fn classify_http_status(status: u16) -> Option<AppErrorCode> {
    match status {
        401 => Some(AppErrorCode::AuthExpired),
        403 => Some(AppErrorCode::Forbidden),
        404 => Some(AppErrorCode::NotFound),
        422 => Some(AppErrorCode::Validation),
        500..=599 => Some(AppErrorCode::ServerError),
        _ => None,
    }
}

/// Classify a raw failure. Rules are applied in a fixed order and the first
/// match wins; `network_offline` is the connectivity probe's current view.
pub fn classify(failure: RawFailure, network_offline: bool) -> AppError {
    match failure {
        RawFailure::App(err) => err,
        _ if network_offline => AppError::from_code(AppErrorCode::Offline),
        RawFailure::Offline(_) => AppError::from_code(AppErrorCode::Offline),
        RawFailure::Cancelled => AppError::timeout(),
        RawFailure::Status { status, body } => classify_status(status, body),
        RawFailure::Other(message) => AppError::unknown(message),
    }
}

fn classify_status(status: u16, body: Option<Value>) -> AppError {
    match classify_http_status(status) {
        Some(AppErrorCode::Validation) => {
            let message = body_message(body.as_ref())
                .unwrap_or_else(|| AppErrorCode::Validation.default_message().to_owned());
            let err = AppError::new(AppErrorCode::Validation, message).with_status(status);
            match body {
                Some(body) => err.with_details(body),
                None => err,
            }
        }
        Some(code) => AppError::from_code(code).with_status(status),
        None => AppError::unknown(
            body_message(body.as_ref()).unwrap_or_else(|| format!("HTTP {status}")),
        )
        .with_status(status),
    }
}

/// Pull a human message out of a typical REST error body.
fn body_message(body: Option<&Value>) -> Option<String> {
    let body = body?;
    if let Some(text) = body.as_str() {
        return Some(text.to_owned()).filter(|t| !t.trim().is_empty());
    }
    ["message", "error_description", "msg", "error"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(ToOwned::to_owned)
}
