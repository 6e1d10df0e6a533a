//! Legacy SSE transport (deprecated but supported): requests are delivered
//! out-of-band via POST to a control URL; responses arrive on a long-lived
//! GET stream and are correlated by JSON-RPC id rather than by HTTP
//! request/response pairing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::transport::Transport;
use crate::transport::sse::parse_events;

type PendingMap = Arc<DashMap<Value, oneshot::Sender<Value>>>;

/// A control-URL/event-URL pair plus the background task draining the event
/// stream and correlating replies by id.
pub struct LegacySseTransport {
    client: Client,
    control_url: String,
    pending: PendingMap,
    reader_task: tokio::task::JoinHandle<()>,
}

impl LegacySseTransport {
    pub fn new(control_url: &str, event_url: &str) -> Result<Self, TransportError> {
        url::Url::parse(control_url).map_err(|e| TransportError::Io(e.to_string()))?;
        url::Url::parse(event_url).map_err(|e| TransportError::Io(e.to_string()))?;
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let pending: PendingMap = Arc::new(DashMap::new());
        let reader_pending = pending.clone();
        let reader_client = client.clone();
        let event_url = event_url.to_string();
        let reader_task = tokio::spawn(async move {
            loop {
                match reader_client.get(&event_url).send().await {
                    Ok(resp) => match resp.text().await {
                        Ok(body) => {
                            for event in parse_events(&body) {
                                if let Ok(msg) = serde_json::from_str::<Value>(&event.data)
                                    && let Some(id) = msg.get("id").cloned()
                                    && let Some((_, tx)) = reader_pending.remove(&id)
                                {
                                    let _ = tx.send(msg);
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "legacy SSE event stream read failure");
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "legacy SSE event stream connect failure");
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        Ok(Self { client, control_url: control_url.to_string(), pending, reader_task })
    }
}

#[async_trait::async_trait]
impl Transport for LegacySseTransport {
    async fn call(&self, request: Value, timeout: Duration) -> Result<Value, TransportError> {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let post = self
            .client
            .post(&self.control_url)
            .json(&request)
            .timeout(timeout)
            .send()
            .await;
        if let Err(e) = post {
            self.pending.remove(&id);
            return Err(if e.is_timeout() {
                TransportError::Timeout { timeout_ms: timeout.as_millis() as u64 }
            } else {
                TransportError::Io(e.to_string())
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::BackendGone),
            Err(_) => {
                self.pending.remove(&id);
                Err(TransportError::Timeout { timeout_ms: timeout.as_millis() as u64 })
            }
        }
    }

    async fn probe(&self) -> bool {
        self.client
            .post(&self.control_url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map(|r| r.status().as_u16() < 500)
            .unwrap_or(false)
    }

    async fn close(&self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_urls() {
        assert!(LegacySseTransport::new("not a url", "http://localhost/events").is_err());
        assert!(LegacySseTransport::new("http://localhost/control", "not a url").is_err());
    }
}
