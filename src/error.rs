//! Crate-wide error taxonomy and the mapping from internal failures to the
//! JSON-RPC error codes clients observe.

use serde_json::Value;
use thiserror::Error;

/// Errors raised while applying or reading the backend registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate backend id: {0}")]
    DuplicateBackendId(String),
    #[error("tool index references unknown backend: {0}")]
    DanglingToolIndex(String),
    #[error("backend '{0}' has an invalid transport spec: {1}")]
    InvalidTransport(String, String),
    #[error("too many failures during update: {failed}/{probed} backends failed probing")]
    TooManyFailures { probed: usize, failed: usize },
    #[error("backend not found: {0}")]
    NotFound(String),
}

/// Errors raised by the request router while selecting and dispatching.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no routing key could be extracted for method '{0}'")]
    NoRoutingKey(String),
    #[error("no backend advertises tool '{0}'")]
    NoBackendForTool(String),
    #[error("all candidate backends are unhealthy or circuit-open")]
    AllBackendsUnavailable,
    #[error("admission refused: backend '{0}' is draining")]
    AdmissionRefused(String),
    #[error("retries exhausted against backend '{backend}': {source}")]
    RetriesExhausted {
        backend: String,
        #[source]
        source: TransportError,
    },
}

/// Errors raised by a transport while exchanging bytes with a backend.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("backend process exited unexpectedly")]
    BackendGone,
    #[error("i/o failure talking to backend: {0}")]
    Io(String),
    #[error("backend request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("backend returned a non-retryable error: {0}")]
    BackendError(Value),
    #[error("backend returned a retryable (5xx-equivalent) error: {0}")]
    Retryable(String),
    #[error("rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("connection pool exhausted")]
    PoolExhausted,
}

impl TransportError {
    /// Whether the router should retry this failure against a (possibly
    /// different) candidate backend, per the error taxonomy in §7.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_)
                | TransportError::Timeout { .. }
                | TransportError::Retryable(_)
                | TransportError::RateLimited { .. }
                | TransportError::PoolExhausted
        )
    }
}

/// A JSON-RPC 2.0 error object, ready to serialize into a response envelope.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn parse_error() -> Self {
        Self { code: -32700, message: "Parse error".into(), data: None }
    }

    pub fn invalid_request() -> Self {
        Self { code: -32600, message: "Invalid Request".into(), data: None }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    pub fn invalid_params(detail: &str) -> Self {
        Self {
            code: -32602,
            message: "Invalid params".into(),
            data: Some(Value::String(detail.to_string())),
        }
    }

    pub fn internal_error(detail: &str) -> Self {
        Self {
            code: -32603,
            message: "Internal error".into(),
            data: Some(Value::String(detail.to_string())),
        }
    }

    pub fn backend_timeout(backend_id: &str, timeout_ms: u64) -> Self {
        Self {
            code: -32001,
            message: format!("backend '{backend_id}' timed out"),
            data: Some(serde_json::json!({ "timeout_ms": timeout_ms, "backend_id": backend_id })),
        }
    }

    pub fn no_backend_available(tool: &str) -> Self {
        Self {
            code: -32002,
            message: "no backend available".into(),
            data: Some(serde_json::json!({ "tool": tool })),
        }
    }

    pub fn authentication_failed(reason: &str) -> Self {
        Self {
            code: -32003,
            message: "authentication failed".into(),
            data: Some(serde_json::json!({ "reason": reason })),
        }
    }

    pub fn rate_limited(retry_after_ms: Option<u64>) -> Self {
        Self {
            code: -32004,
            message: "rate limited".into(),
            data: Some(serde_json::json!({ "retry_after_ms": retry_after_ms })),
        }
    }

    pub fn tool_not_found(tool: &str) -> Self {
        Self {
            code: -32005,
            message: format!("tool not found: {tool}"),
            data: None,
        }
    }

    pub fn backend_error(backend_id: &str, attempts: u32, body: Value) -> Self {
        Self {
            code: -32006,
            message: format!("backend '{backend_id}' returned an error after {attempts} attempt(s)"),
            data: Some(body),
        }
    }
}

impl From<&RouterError> for JsonRpcError {
    fn from(err: &RouterError) -> Self {
        match err {
            RouterError::NoRoutingKey(_) => JsonRpcError::method_not_found("unknown"),
            RouterError::NoBackendForTool(tool) => JsonRpcError::tool_not_found(tool),
            RouterError::AllBackendsUnavailable => JsonRpcError::no_backend_available("*"),
            RouterError::AdmissionRefused(_) => JsonRpcError::rate_limited(None),
            RouterError::RetriesExhausted { backend, source } => match source {
                TransportError::BackendError(body) => {
                    JsonRpcError::backend_error(backend, 1, body.clone())
                }
                TransportError::RateLimited { retry_after_ms } => {
                    JsonRpcError::rate_limited(*retry_after_ms)
                }
                TransportError::Timeout { timeout_ms } => JsonRpcError::backend_timeout(backend, *timeout_ms),
                other => JsonRpcError::internal_error(&other.to_string()),
            },
        }
    }
}

/// Process exit codes, informational (§6).
pub mod exit_code {
    pub const CLEAN: i32 = 0;
    pub const FATAL_STARTUP: i32 = 1;
    pub const DRAIN_TIMEOUT: i32 = 2;
    pub const PANIC: i32 = 3;
}
