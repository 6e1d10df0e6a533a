//! Transport Layer (C4): the capability set every backend connection
//! exposes to the router, independent of wire protocol.
//!
//! Concrete implementations (`stdio`, `http`, `sse`, `legacy_sse`) are
//! adapters over a child process, a pooled HTTP client, or an SSE stream;
//! the router only ever depends on this trait.

pub mod http;
pub mod legacy_sse;
pub mod manager;
pub mod sse;
pub mod stdio;

use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{self, Stream, StreamExt};
use serde_json::Value;

use crate::error::TransportError;
use crate::registry::{BackendDescriptor, TransportSpec};
use crate::secrets::SecretResolver;

/// A sequence of response chunks yielded by a streaming backend call, in
/// arrival order. The stream ends when the backend's terminal chunk has been
/// delivered (or an error occurred, which itself is the final item).
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value, TransportError>> + Send>>;

/// One outstanding connection/session to a backend, capable of sending a
/// unary JSON-RPC request and tearing itself down.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` (a complete JSON-RPC request object) and await its
    /// matching response, subject to `timeout`.
    async fn call(&self, request: Value, timeout: Duration) -> Result<Value, TransportError>;

    /// Lightweight liveness probe used by the registry's acceptance gate and
    /// the periodic health monitor. Does not require a prior `call`.
    async fn probe(&self) -> bool;

    /// Best-effort close; called once by the drain coordinator once a
    /// backend's active connection count has reached zero.
    async fn close(&self);

    /// Whether [`Transport::open_stream`] yields more than one chunk for
    /// this backend (§4.4's streamable-HTTP event-stream mode). Drives the
    /// ingress's choice of `application/json` vs. `text/event-stream`
    /// framing (§4.1) without needing to await the first chunk first.
    fn is_streaming(&self) -> bool {
        false
    }

    /// Send `request` and yield its response as a sequence of chunks rather
    /// than a single materialized value (§4.3's "Response streaming").
    /// Transports with no native chunking (STDIO, unary HTTP, legacy SSE)
    /// get this for free: the default forwards to [`Transport::call`] and
    /// wraps the single result as a one-item stream.
    async fn open_stream(&self, request: Value, timeout: Duration) -> Result<ChunkStream, TransportError> {
        let result = self.call(request, timeout).await;
        Ok(Box::pin(stream::once(async move { result })))
    }
}

/// Constructs the right `Transport` adapter for a descriptor's wire
/// protocol. Each adapter owns its own connection lifecycle (child process,
/// pooled HTTP client, SSE session). `resolver` resolves the descriptor's
/// `auth_ref` (if any) into a bearer token, injected as an `Authorization`
/// header for HTTP/SSE backends or an `MCP_AUTH_TOKEN` env var for STDIO
/// backends; a descriptor with no `auth_ref` is unaffected.
pub async fn connect(
    descriptor: &BackendDescriptor,
    resolver: &SecretResolver,
) -> Result<Box<dyn Transport>, TransportError> {
    let token = crate::secrets::resolve_auth_ref(resolver, &descriptor.auth_ref)
        .map_err(|e| TransportError::Io(format!("resolving auth_ref: {e}")))?;

    match &descriptor.transport {
        TransportSpec::Stdio { command, args, env, cwd, resource_limits } => {
            let mut env = env.clone();
            if let Some(token) = &token {
                env.insert("MCP_AUTH_TOKEN".to_string(), token.clone());
            }
            let t =
                stdio::StdioTransport::spawn(command, args, &env, cwd.as_deref(), *resource_limits).await?;
            Ok(Box::new(t))
        }
        TransportSpec::Http { url, headers, event_stream } => {
            let mut headers = headers.clone();
            if let Some(token) = &token {
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            }
            let t = http::HttpTransport::new(url, &headers, *event_stream)?;
            Ok(Box::new(t))
        }
        TransportSpec::LegacySse { control_url, event_url } => {
            let t = legacy_sse::LegacySseTransport::new(control_url, event_url)?;
            Ok(Box::new(t))
        }
    }
}
