//! Tool-list cache persistence (SPEC_FULL §11): a small on-disk snapshot of
//! the most recently discovered tool set per backend, loaded at startup so
//! aggregated `tools/list` has content before every backend finishes its
//! handshake, and refreshed after every successful discovery. An unreadable
//! or version-mismatched file is treated as empty, never a startup failure.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Current cache format version. Bump when the persisted shape changes.
const CACHE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct ToolListCache {
    version: u32,
    /// Raw `tools/list` result entries per backend id, exactly as returned
    /// by the backend (schema included) — the ingress layer owns
    /// disambiguation/namespacing on top of this, not the cache.
    backends: HashMap<String, Vec<Value>>,
}

/// Load the cached tool lists for the backends named in `known_backend_ids`.
/// Entries for backends no longer configured are dropped silently. Returns
/// an empty map on any read/parse/version failure.
pub async fn load(path: &Path, known_backend_ids: &[String]) -> HashMap<String, Vec<Value>> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(d) => d,
        Err(_) => return HashMap::new(),
    };

    let cache: ToolListCache = match serde_json::from_str(&data) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "invalid tool list cache, ignoring");
            return HashMap::new();
        }
    };

    if cache.version != CACHE_VERSION {
        warn!(
            found = cache.version,
            expected = CACHE_VERSION,
            "incompatible tool list cache version, ignoring"
        );
        return HashMap::new();
    }

    let mut loaded = HashMap::new();
    let mut total = 0usize;
    for (backend_id, tools) in cache.backends {
        if !known_backend_ids.contains(&backend_id) {
            continue;
        }
        total += tools.len();
        loaded.insert(backend_id, tools);
    }
    debug!(tools = total, path = %path.display(), "loaded tool list cache");
    loaded
}

/// Persist the current per-backend tool lists. Writes to a temp file and
/// renames into place so a crash mid-write never leaves a truncated cache.
pub async fn save(path: &Path, backends: &HashMap<String, Vec<Value>>) {
    let cache = ToolListCache { version: CACHE_VERSION, backends: backends.clone() };

    let json = match serde_json::to_string(&cache) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "failed to serialize tool list cache");
            return;
        }
    };

    let tmp = path.with_extension("cache.tmp");
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
        warn!(error = %e, "failed to create tool list cache directory");
        return;
    }
    if let Err(e) = tokio::fs::write(&tmp, &json).await {
        warn!(error = %e, "failed to write tool list cache temp file");
        return;
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        warn!(error = %e, "failed to rename tool list cache file into place");
        return;
    }
    debug!(path = %path.display(), backends = cache.backends.len(), "tool list cache saved");
}
