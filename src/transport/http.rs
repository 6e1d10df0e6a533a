//! Streamable-HTTP transport: a pooled `reqwest` client posting JSON-RPC
//! requests and classifying the response as a single JSON object or an
//! event-stream to be drained via [`crate::transport::sse`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};

use crate::error::TransportError;
use crate::transport::sse::{BackpressureGate, IncrementalParser};
use crate::transport::{ChunkStream, Transport};

/// Buffered-event thresholds for [`HttpTransport::open_stream`]'s
/// [`BackpressureGate`]: the backend-reading task pauses once this many
/// parsed events are waiting on the consumer, and resumes once the backlog
/// has drained back down to the low mark.
const STREAM_HIGH_WATERMARK: usize = 64;
const STREAM_LOW_WATERMARK: usize = 16;

/// Parks the producer task until the gate reports it's no longer paused.
/// Registers for the next [`Notify::notify_waiters`] *before* re-checking
/// the gate so a resume signalled between the check and the await is never
/// missed.
async fn wait_for_resume(gate: &Mutex<BackpressureGate>, resume: &Notify) {
    loop {
        let notified = resume.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !gate.lock().unwrap().is_paused() {
            return;
        }
        notified.await;
    }
}

pub struct HttpTransport {
    client: Client,
    url: String,
    headers: reqwest::header::HeaderMap,
    event_stream: bool,
}

impl HttpTransport {
    pub fn new(
        url: &str,
        headers: &HashMap<String, String>,
        event_stream: bool,
    ) -> Result<Self, TransportError> {
        url::Url::parse(url).map_err(|e| TransportError::Io(e.to_string()))?;
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let mut header_map = reqwest::header::HeaderMap::new();
        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                reqwest::header::HeaderValue::from_str(v),
            ) {
                header_map.insert(name, value);
            }
        }
        Ok(Self { client, url: url.to_string(), headers: header_map, event_stream })
    }

    fn classify_status(status: reqwest::StatusCode, headers: &reqwest::header::HeaderMap) -> Option<TransportError> {
        if status.is_success() {
            None
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Some(TransportError::RateLimited { retry_after_ms: parse_retry_after_ms(headers) })
        } else if status.is_server_error() {
            Some(TransportError::Retryable(format!("http {status}")))
        } else {
            Some(TransportError::BackendError(serde_json::json!({ "http_status": status.as_u16() })))
        }
    }
}

/// Parses a `Retry-After` header per RFC 9110 §10.2.3: either delta-seconds
/// (`"120"`) or an HTTP-date (`"Fri, 31 Dec 1999 23:59:59 GMT"`). Returns
/// `None` if the header is absent or neither form parses.
fn parse_retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(seconds * 1000);
    }
    let target = httpdate::parse_http_date(value.trim()).ok()?;
    let now = std::time::SystemTime::now();
    target.duration_since(now).ok().map(|d| d.as_millis() as u64)
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn call(&self, request: Value, timeout: Duration) -> Result<Value, TransportError> {
        let resp = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout { timeout_ms: timeout.as_millis() as u64 }
                } else if e.is_connect() {
                    TransportError::Retryable(e.to_string())
                } else {
                    TransportError::Io(e.to_string())
                }
            })?;

        if let Some(err) = Self::classify_status(resp.status(), resp.headers()) {
            return Err(err);
        }

        if self.event_stream
            || resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.starts_with("text/event-stream"))
                .unwrap_or(false)
        {
            let body = resp.text().await.map_err(|e| TransportError::Io(e.to_string()))?;
            crate::transport::sse::extract_final_json(&body)
                .ok_or_else(|| TransportError::Io("event-stream had no terminal JSON payload".into()))
        } else {
            resp.json::<Value>().await.map_err(|e| TransportError::Io(e.to_string()))
        }
    }

    async fn probe(&self) -> bool {
        self.client
            .get(&self.url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map(|r| r.status().as_u16() < 500)
            .unwrap_or(false)
    }

    async fn close(&self) {}

    fn is_streaming(&self) -> bool {
        self.event_stream
    }

    async fn open_stream(&self, request: Value, timeout: Duration) -> Result<ChunkStream, TransportError> {
        if !self.event_stream {
            let result = self.call(request, timeout).await;
            return Ok(Box::pin(futures_util::stream::once(async move { result })));
        }

        let resp = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout { timeout_ms: timeout.as_millis() as u64 }
                } else if e.is_connect() {
                    TransportError::Retryable(e.to_string())
                } else {
                    TransportError::Io(e.to_string())
                }
            })?;

        if let Some(err) = Self::classify_status(resp.status(), resp.headers()) {
            return Err(err);
        }

        let mut byte_stream = resp.bytes_stream();
        let gate = Arc::new(Mutex::new(BackpressureGate::new(STREAM_LOW_WATERMARK, STREAM_HIGH_WATERMARK)));
        let resume = Arc::new(Notify::new());
        let (tx, rx) = mpsc::unbounded_channel::<Result<Value, TransportError>>();

        // Reads the backend's byte stream on its own task so it can genuinely
        // pause between chunks: past the gate's high water mark it parks on
        // `resume` instead of handing the consumer's `unfold` a chunk it
        // hasn't asked for yet, per §4.4's "pausing reads from the backend
        // ... until the consumer drains below a low-water-mark".
        let producer_gate = Arc::clone(&gate);
        let producer_resume = Arc::clone(&resume);
        tokio::spawn(async move {
            let mut parser = IncrementalParser::new();
            loop {
                let chunk = match byte_stream.next().await {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(TransportError::Io(e.to_string())));
                        return;
                    }
                    None => return,
                };
                for event in parser.push(&chunk) {
                    let item = serde_json::from_str::<Value>(&event.data)
                        .map_err(|e| TransportError::Io(format!("malformed SSE chunk: {e}")));
                    let keep_going = producer_gate.lock().unwrap().on_enqueue();
                    if tx.send(item).is_err() {
                        return; // consumer (and its guard) dropped.
                    }
                    if !keep_going {
                        wait_for_resume(&producer_gate, &producer_resume).await;
                    }
                }
            }
        });

        let stream = futures_util::stream::unfold(rx, move |mut rx| {
            let gate = Arc::clone(&gate);
            let resume = Arc::clone(&resume);
            async move {
                let item = rx.recv().await?;
                if gate.lock().unwrap().on_drain() {
                    resume.notify_waiters();
                }
                Some((item, rx))
            }
        });
        Ok(Box::pin(stream))
    }
}
