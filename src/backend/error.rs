use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Postgres error code for insufficient privilege (also raised by RLS)
const INSUFFICIENT_PRIVILEGE: &str = "42501";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("backend returned {status}: {message}")]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
        details: Option<String>,
        hint: Option<String>,
    },

    /// The exec-SQL function answered 200 but reported a failure in its body
    #[error("sql rejected: {0}")]
    SqlRejected(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Transport(err)
        }
    }
}

/// Error body shapes returned by the table, RPC and storage APIs
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    code: Option<Value>,
    message: Option<String>,
    details: Option<Value>,
    hint: Option<String>,
    error: Option<String>,
    #[serde(rename = "statusCode")]
    status_code: Option<Value>,
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

impl BackendError {
    /// Build an error from a non-success response
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();

        let message = parsed
            .message
            .clone()
            .or_else(|| parsed.error.clone())
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("unknown error")
                        .to_string()
                } else {
                    trimmed.chars().take(500).collect()
                }
            });

        // Storage errors carry their code in `error` and the real status in `statusCode`
        let code = parsed
            .code
            .and_then(value_to_string)
            .or_else(|| parsed.status_code.and_then(value_to_string))
            .or(parsed.error.filter(|e| Some(e) != parsed.message.as_ref()));

        BackendError::Http {
            status: status.as_u16(),
            code,
            message,
            details: parsed.details.and_then(value_to_string),
            hint: parsed.hint,
        }
    }

    /// Worth retrying: the same request may succeed later
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Transport(_) | BackendError::Timeout => true,
            BackendError::Http { status, .. } => {
                matches!(*status, 408 | 429) || (*status >= 500 && *status != 501)
            }
            BackendError::SqlRejected(_)
            | BackendError::Decode(_)
            | BackendError::InvalidRequest(_) => false,
        }
    }

    /// Rejected for lack of privilege, including row-level security
    pub fn is_auth(&self) -> bool {
        match self {
            BackendError::Http { status, code, .. } => {
                matches!(*status, 401 | 403) || code.as_deref() == Some(INSUFFICIENT_PRIVILEGE)
            }
            BackendError::SqlRejected(message) => message.contains("permission denied"),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Duplicate resource (HTTP 409, Postgres 23505 or storage "Duplicate")
    pub fn is_conflict(&self) -> bool {
        match self {
            BackendError::Http { status, code, .. } => {
                *status == 409 || matches!(code.as_deref(), Some("23505") | Some("409") | Some("Duplicate"))
            }
            _ => false,
        }
    }

    /// Short label used in structured log fields
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Transport(_) => "transport",
            BackendError::Timeout => "timeout",
            BackendError::Http { .. } if self.is_auth() => "auth",
            BackendError::Http { .. } if self.is_transient() => "server",
            BackendError::Http { .. } => "client",
            BackendError::SqlRejected(_) => "sql",
            BackendError::Decode(_) => "decode",
            BackendError::InvalidRequest(_) => "invalid_request",
        }
    }
}
