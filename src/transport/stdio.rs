//! STDIO transport: a supervised child process speaking line-delimited
//! JSON-RPC over its stdin/stdout. Stderr is left untouched for the child's
//! own diagnostics and never parsed as protocol traffic.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};

use crate::error::TransportError;
use crate::registry::ResourceLimits;
use crate::transport::Transport;

type PendingMap = Arc<DashMap<Value, oneshot::Sender<Value>>>;

/// A spawned child process plus the bookkeeping needed to correlate
/// responses with in-flight requests by JSON-RPC id.
pub struct StdioTransport {
    child: Mutex<Child>,
    stdin: Mutex<tokio::process::ChildStdin>,
    pending: PendingMap,
    reader_task: tokio::task::JoinHandle<()>,
    next_probe_id: AtomicU64,
    gone: Arc<std::sync::atomic::AtomicBool>,
}

/// Apply the descriptor's CPU-seconds and memory-bytes caps to the child
/// before exec, via `setrlimit` in a `pre_exec` hook (§3: "resource caps ...
/// applied before exec (on platforms that allow it)"). A descriptor with no
/// caps set leaves the child's limits untouched.
#[cfg(unix)]
fn apply_resource_limits(cmd: &mut Command, limits: ResourceLimits) {
    use std::os::unix::process::CommandExt;

    if limits.cpu_seconds.is_none() && limits.memory_bytes.is_none() {
        return;
    }

    unsafe {
        cmd.pre_exec(move || {
            if let Some(cpu_seconds) = limits.cpu_seconds {
                let cpu_seconds = cpu_seconds as libc::rlim_t;
                let rlim = libc::rlimit { rlim_cur: cpu_seconds, rlim_max: cpu_seconds };
                if libc::setrlimit(libc::RLIMIT_CPU, &rlim) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if let Some(memory_bytes) = limits.memory_bytes {
                let memory_bytes = memory_bytes as libc::rlim_t;
                let rlim = libc::rlimit { rlim_cur: memory_bytes, rlim_max: memory_bytes };
                if libc::setrlimit(libc::RLIMIT_AS, &rlim) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

/// Drains every outstanding correlation entry on child exit (§4.4
/// Supervision: "close all pending handles with BackendGone"). Dropping each
/// `oneshot::Sender` closes its receiver, which `call()`'s `Ok(Err(_))` arm
/// already maps to [`TransportError::BackendGone`] — no separate error
/// payload needs to travel through the channel.
fn fail_pending(pending: &PendingMap) {
    let ids: Vec<Value> = pending.iter().map(|e| e.key().clone()).collect();
    for id in ids {
        pending.remove(&id);
    }
}

impl StdioTransport {
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
        resource_limits: ResourceLimits,
    ) -> Result<Self, TransportError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        apply_resource_limits(&mut cmd, resource_limits);
        #[cfg(not(unix))]
        let _ = resource_limits;
        let mut child = cmd.spawn().map_err(|e| TransportError::Io(e.to_string()))?;
        let stdin = child.stdin.take().ok_or_else(|| TransportError::Io("no stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Io("no stdout".into()))?;

        let pending: PendingMap = Arc::new(DashMap::new());
        let gone = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader_pending = pending.clone();
        let reader_gone = gone.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(msg) => {
                                if let Some(id) = msg.get("id").cloned() {
                                    if let Some((_, tx)) = reader_pending.remove(&id) {
                                        let _ = tx.send(msg);
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "malformed line from stdio backend");
                            }
                        }
                    }
                    Ok(None) => {
                        reader_gone.store(true, Ordering::Release);
                        fail_pending(&reader_pending);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "stdio backend read failure");
                        reader_gone.store(true, Ordering::Release);
                        fail_pending(&reader_pending);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            reader_task,
            next_probe_id: AtomicU64::new(1),
            gone,
        })
    }

    async fn write_line(&self, request: &Value) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(request).map_err(|e| TransportError::Io(e.to_string()))?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&line).await.map_err(|e| TransportError::Io(e.to_string()))?;
        stdin.flush().await.map_err(|e| TransportError::Io(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    async fn call(&self, request: Value, timeout: Duration) -> Result<Value, TransportError> {
        if self.gone.load(Ordering::Acquire) {
            return Err(TransportError::BackendGone);
        }
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        if let Err(e) = self.write_line(&request).await {
            self.pending.remove(&id);
            return Err(e);
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
        if self.gone.load(Ordering::Acquire) {
            return false;
        }
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn close(&self) {
        self.reader_task.abort();
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawning_a_missing_executable_fails_cleanly() {
        let result = StdioTransport::spawn("/nonexistent/definitely-not-a-binary", &[], &HashMap::new(), None, ResourceLimits::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn echo_backend_round_trips_a_request() {
        // `cat` echoes whatever line-delimited JSON we write straight back,
        // which is enough to exercise correlation without a real MCP server.
        let transport = StdioTransport::spawn("cat", &[], &HashMap::new(), None, ResourceLimits::default()).await.unwrap();
        let request = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        let response = transport.call(request.clone(), Duration::from_secs(2)).await.unwrap();
        assert_eq!(response, request);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn generous_resource_limits_do_not_prevent_spawn() {
        let limits = ResourceLimits { cpu_seconds: Some(60), memory_bytes: Some(512 * 1024 * 1024) };
        let transport = StdioTransport::spawn("cat", &[], &HashMap::new(), None, limits).await.unwrap();
        let request = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        let response = transport.call(request.clone(), Duration::from_secs(2)).await.unwrap();
        assert_eq!(response, request);
    }
}
