//! STDIO ingress: Only1MCP itself exposed as a single MCP server over its
//! own stdin/stdout, for clients that launch it as a child process rather
//! than speaking HTTP. Line-delimited JSON-RPC in both directions, mirroring
//! the framing used against backends in [`crate::transport::stdio`]. Stderr
//! carries only diagnostics and is never written to by this loop.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Notify;

use super::Ingress;

/// Reads newline-delimited JSON-RPC payloads from stdin, dispatches each
/// through [`Ingress::handle_payload`], and writes any response as a single
/// line on stdout. Returns once stdin is closed or `shutdown` fires.
pub async fn serve(ingress: Arc<Ingress>, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    tracing::info!("stdio ingress listening");
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.notified() => break,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let payload: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                let err = crate::error::JsonRpcError::parse_error();
                write_response(&mut stdout, serde_json::json!({"jsonrpc": "2.0", "id": null, "error": err})).await?;
                continue;
            }
        };

        if let Some(response) = ingress.handle_payload(payload).await {
            write_response(&mut stdout, response).await?;
        }
    }
    tracing::info!("stdio ingress stopped");
    Ok(())
}

async fn write_response(stdout: &mut tokio::io::Stdout, response: serde_json::Value) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(&response)?;
    line.push(b'\n');
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}
