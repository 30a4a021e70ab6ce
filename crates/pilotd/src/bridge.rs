//! Browser bridge client.
//!
//! Drives a single browser-automation subprocess over JSON-RPC 2.0 framed
//! as newline-delimited objects on stdio. Key responsibilities:
//! - Request/response correlation and per-call timeouts
//! - Process supervision (`is_running` / `start` / `force_restart`)
//! - Per-run context lifecycle ("clean room" semantics)
//! - Unwrapping the `tools/call` response envelope into usable payloads
//!
//! The envelope unwrapping is a hard contract: tool results arrive as
//! `content: [{type: "text", text: "<nested json>"}]` and consumers that
//! store the outer envelope end up with empty metrics.

use async_trait::async_trait;
use base64::Engine as _;
use pilot_core::{DomSnapshot, Id};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

/// JSON-RPC error codes used by the bridge.
pub mod rpc_code {
    pub const PARSE: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bridge process is not running")]
    NotRunning,
    #[error("bridge call timed out after {0:?}")]
    Timeout(Duration),
    #[error("bridge connection closed mid-call")]
    Closed,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("bridge rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Payload of one unwrapped `tools/call` result.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    /// Parsed inner JSON for text content (or a JSON string when the inner
    /// text is not JSON).
    pub value: Value,
    /// Decoded bytes for image content.
    pub image: Option<Vec<u8>>,
    pub console_logs: Vec<String>,
    pub page_errors: Vec<String>,
}

/// Unwrap the `tools/call` response envelope.
///
/// Text content carries the real result as nested JSON in `content[0].text`;
/// image content carries base64 in `content[0].data`. The auxiliary `logs`
/// object holds console messages and page errors.
pub fn unwrap_tool_response(raw: &Value) -> Result<ToolResult> {
    let mut result = ToolResult::default();

    if let Some(logs) = raw.get("logs") {
        result.console_logs = string_list(logs.get("console"));
        result.page_errors = string_list(logs.get("pageErrors"));
    }

    let Some(first) = raw.get("content").and_then(|c| c.as_array()).and_then(|c| c.first()) else {
        // No content block; some tools legitimately return nothing.
        result.value = Value::Null;
        return Ok(result);
    };

    match first.get("type").and_then(Value::as_str) {
        Some("text") => {
            let text = first
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| BridgeError::Protocol("text content without text field".into()))?;
            // The inner payload is usually JSON; plain strings pass through.
            result.value = serde_json::from_str(text)
                .unwrap_or_else(|_| Value::String(text.to_string()));
        }
        Some("image") => {
            let data = first
                .get("data")
                .and_then(Value::as_str)
                .ok_or_else(|| BridgeError::Protocol("image content without data field".into()))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| BridgeError::Protocol(format!("invalid image base64: {e}")))?;
            result.image = Some(bytes);
        }
        other => {
            return Err(BridgeError::Protocol(format!(
                "unknown content type: {other:?}"
            )));
        }
    }

    Ok(result)
}

/// Extract a canonical snapshot triple from an unwrapped snapshot result.
///
/// Snapshot tools nest `{content, url, title, mode}` inside the text
/// payload; escape sequences in the content round-trip through the JSON
/// layer, so no further unescaping happens here.
pub fn snapshot_from_value(value: &Value) -> DomSnapshot {
    let content = value
        .get("content")
        .or_else(|| value.get("snapshot"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let url = value.get("url").and_then(Value::as_str).unwrap_or_default();
    let title = value
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default();
    DomSnapshot::new(content, url, title)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Browser bridge capability used by the step loop and obstacle clearer.
#[async_trait]
pub trait BridgePort: Send + Sync {
    /// Probe subprocess liveness. A true result does not guarantee the next
    /// call succeeds; callers retry context creation with restarts.
    async fn is_running(&self) -> bool;
    async fn start(&self) -> Result<()>;
    async fn force_restart(&self) -> Result<()>;
    /// Establish an isolated context (cookies, storage, cache per run).
    async fn create_context(&self, headless: bool, run_id: &Id) -> Result<()>;
    async fn close_context(&self, run_id: &Id) -> Result<()>;
    /// Invoke a named tool; the result is already unwrapped.
    async fn call_tool(&self, run_id: &Id, name: &str, arguments: Value) -> Result<ToolResult>;

    /// Capture the current accessibility-tree snapshot.
    async fn snapshot(&self, run_id: &Id) -> Result<DomSnapshot> {
        let result = self.call_tool(run_id, "snapshot", json!({})).await?;
        Ok(snapshot_from_value(&result.value))
    }
}

/// Acquire a fresh context, retrying the whole
/// `is_running -> start -> create_context` sequence with a restart between
/// attempts. `is_running` and `create_context` race the subprocess dying,
/// so a clean probe never implies a clean create.
pub async fn ensure_clean_context(
    bridge: &dyn BridgePort,
    headless: bool,
    run_id: &Id,
    retries: u32,
) -> Result<()> {
    let mut last_err = BridgeError::NotRunning;
    for attempt in 0..=retries {
        if attempt > 0 {
            warn!(%run_id, attempt, "retrying browser context creation after restart");
            if let Err(error) = bridge.force_restart().await {
                last_err = error;
                continue;
            }
        } else if !bridge.is_running().await {
            if let Err(error) = bridge.start().await {
                last_err = error;
                continue;
            }
        }

        match bridge.create_context(headless, run_id).await {
            Ok(()) => return Ok(()),
            Err(error) => last_err = error,
        }
    }
    Err(last_err)
}

/// Configuration for the stdio bridge subprocess.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Program to spawn (e.g. `node`).
    pub program: String,
    pub args: Vec<String>,
    /// Browser engine passed in `initialize` (e.g. `chromium`).
    pub engine: String,
    /// Snapshot mode passed in `initialize` (e.g. `aria`).
    pub snapshot_mode: String,
    /// Per-call timeout.
    pub call_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            args: vec!["bridge/server.js".to_string()],
            engine: "chromium".to_string(),
            snapshot_mode: "aria".to_string(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RpcError>,
}

struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

/// JSON-RPC bridge over a subprocess's stdio. One instance per daemon;
/// writes serialize behind the process lock, so requests to the bridge are
/// ordered per caller.
pub struct StdioBridge {
    config: BridgeConfig,
    process: Mutex<Option<BridgeProcess>>,
    pending: PendingMap,
    next_id: AtomicU64,
}

impl std::fmt::Debug for StdioBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioBridge")
            .field("program", &self.config.program)
            .finish_non_exhaustive()
    }
}

impl StdioBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            process: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    async fn spawn_process(&self) -> Result<BridgeProcess> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Protocol("bridge stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Protocol("bridge stdout unavailable".into()))?;

        // Reader task: one JSON object per line, resolved against pending
        // requests. Ends when the pipe closes; unresolved callers see Closed.
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<RpcResponse>(trimmed) {
                    Ok(response) => {
                        if let Some(id) = response.id {
                            if let Some(sender) = pending.lock().await.remove(&id) {
                                let _ = sender.send(response);
                            }
                        }
                    }
                    Err(error) => {
                        debug!(%error, "discarding unparseable bridge line");
                    }
                }
            }
            // Pipe closed; drop all pending senders so callers fail fast.
            pending.lock().await.clear();
        });

        Ok(BridgeProcess { child, stdin })
    }

    async fn write_message(&self, message: &Value) -> Result<()> {
        let mut guard = self.process.lock().await;
        let process = guard.as_mut().ok_or(BridgeError::NotRunning)?;
        let mut line = serde_json::to_string(message)
            .map_err(|e| BridgeError::Protocol(e.to_string()))?;
        line.push('\n');
        process.stdin.write_all(line.as_bytes()).await?;
        process.stdin.flush().await?;
        Ok(())
    }

    /// Send a request and await its response under the per-call timeout.
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        if let Err(error) = self.write_message(&message).await {
            self.pending.lock().await.remove(&id);
            return Err(error);
        }

        let response = match timeout(self.config.call_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(BridgeError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(BridgeError::Timeout(self.config.call_timeout));
            }
        };

        if let Some(error) = response.error {
            return Err(BridgeError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// List the tools the bridge serves. Doubles as a handshake probe
    /// after startup.
    pub async fn list_tools(&self) -> Result<Vec<String>> {
        let result = self.request("tools/list", json!({})).await?;
        Ok(result
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| t.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Send a notification (no id, no response expected).
    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_message(&message).await
    }

    async fn shutdown_inner(&self) {
        // Best effort; the process may already be gone.
        let _ = self.request("shutdown", json!({})).await;
        let mut guard = self.process.lock().await;
        if let Some(mut process) = guard.take() {
            let _ = process.child.kill().await;
        }
    }
}

#[async_trait]
impl BridgePort for StdioBridge {
    async fn is_running(&self) -> bool {
        let mut guard = self.process.lock().await;
        match guard.as_mut() {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn start(&self) -> Result<()> {
        {
            let mut guard = self.process.lock().await;
            if let Some(process) = guard.as_mut() {
                if matches!(process.child.try_wait(), Ok(None)) {
                    return Ok(());
                }
            }
            let process = self.spawn_process().await?;
            *guard = Some(process);
        }

        self.request(
            "initialize",
            json!({
                "engine": self.config.engine,
                "snapshotMode": self.config.snapshot_mode,
            }),
        )
        .await?;
        // Triggers browser launch on the far side; no response follows.
        self.notify("notifications/initialized", json!({})).await?;
        let tools = self.list_tools().await?;
        debug!(tool_count = tools.len(), "bridge handshake complete");
        Ok(())
    }

    async fn force_restart(&self) -> Result<()> {
        self.shutdown_inner().await;
        self.pending.lock().await.clear();
        self.start().await
    }

    async fn create_context(&self, headless: bool, run_id: &Id) -> Result<()> {
        self.request(
            "browser/createContext",
            json!({ "runId": run_id.to_string(), "headless": headless }),
        )
        .await?;
        Ok(())
    }

    async fn close_context(&self, run_id: &Id) -> Result<()> {
        self.request(
            "browser/closeContext",
            json!({ "runId": run_id.to_string() }),
        )
        .await?;
        Ok(())
    }

    async fn call_tool(&self, run_id: &Id, name: &str, arguments: Value) -> Result<ToolResult> {
        let mut arguments = arguments;
        if let Value::Object(ref mut map) = arguments {
            map.insert("runId".to_string(), Value::String(run_id.to_string()));
        }
        let raw = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        unwrap_tool_response(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwrap_parses_nested_text_json() {
        let raw = json!({
            "content": [{
                "type": "text",
                "text": "{\"success\":true,\"webVitals\":{\"lcp\":1250.5,\"cls\":0.05}}"
            }],
            "logs": { "console": ["hello"], "pageErrors": [] }
        });
        let result = unwrap_tool_response(&raw).unwrap();
        assert_eq!(result.value["success"], Value::Bool(true));
        assert_eq!(result.value["webVitals"]["lcp"], json!(1250.5));
        assert_eq!(result.console_logs, vec!["hello"]);
    }

    #[test]
    fn unwrap_passes_plain_text_through() {
        let raw = json!({ "content": [{ "type": "text", "text": "clicked" }] });
        let result = unwrap_tool_response(&raw).unwrap();
        assert_eq!(result.value, Value::String("clicked".to_string()));
    }

    #[test]
    fn unwrap_decodes_image_content() {
        let png = b"fake-png-bytes";
        let encoded = base64::engine::general_purpose::STANDARD.encode(png);
        let raw = json!({ "content": [{ "type": "image", "data": encoded }] });
        let result = unwrap_tool_response(&raw).unwrap();
        assert_eq!(result.image.as_deref(), Some(png.as_slice()));
    }

    #[test]
    fn unwrap_rejects_unknown_content_type() {
        let raw = json!({ "content": [{ "type": "audio", "data": "x" }] });
        assert!(unwrap_tool_response(&raw).is_err());
    }

    #[test]
    fn unwrap_tolerates_missing_content() {
        let raw = json!({ "logs": { "console": [], "pageErrors": ["boom"] } });
        let result = unwrap_tool_response(&raw).unwrap();
        assert_eq!(result.value, Value::Null);
        assert_eq!(result.page_errors, vec!["boom"]);
    }

    #[test]
    fn snapshot_round_trips_escape_sequences() {
        let inner = json!({
            "content": "- button \"Accept\"\n\t[ref=e1] \"quoted\" \\slash",
            "url": "https://example.com",
            "title": "Example",
            "mode": "aria",
        });
        // Through the envelope: serialized inner JSON inside content[0].text.
        let raw = json!({
            "content": [{ "type": "text", "text": inner.to_string() }]
        });
        let unwrapped = unwrap_tool_response(&raw).unwrap();
        let snapshot = snapshot_from_value(&unwrapped.value);
        assert_eq!(
            snapshot.content,
            "- button \"Accept\"\n\t[ref=e1] \"quoted\" \\slash"
        );
        assert_eq!(snapshot.url, "https://example.com");
        assert_eq!(snapshot.title, "Example");
    }

    #[test]
    fn snapshot_from_value_accepts_snapshot_field() {
        let value = json!({ "snapshot": "tree", "url": "u", "title": "t" });
        let snapshot = snapshot_from_value(&value);
        assert_eq!(snapshot.content, "tree");
    }

    #[test]
    fn rpc_codes_match_jsonrpc() {
        assert_eq!(rpc_code::PARSE, -32700);
        assert_eq!(rpc_code::INVALID_REQUEST, -32600);
        assert_eq!(rpc_code::METHOD_NOT_FOUND, -32601);
        assert_eq!(rpc_code::INVALID_PARAMS, -32602);
        assert_eq!(rpc_code::INTERNAL, -32603);
    }

    // --- ensure_clean_context retry behavior ---

    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    /// Bridge whose create_context fails a configured number of times.
    struct FlakyBridge {
        failures: AtomicU32,
        restarts: AtomicU32,
    }

    impl FlakyBridge {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                restarts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl BridgePort for FlakyBridge {
        async fn is_running(&self) -> bool {
            true
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn force_restart(&self) -> Result<()> {
            self.restarts.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }

        async fn create_context(&self, _headless: bool, _run_id: &Id) -> Result<()> {
            let remaining = self.failures.load(AtomicOrdering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, AtomicOrdering::SeqCst);
                return Err(BridgeError::NotRunning);
            }
            Ok(())
        }

        async fn close_context(&self, _run_id: &Id) -> Result<()> {
            Ok(())
        }

        async fn call_tool(
            &self,
            _run_id: &Id,
            _name: &str,
            _arguments: Value,
        ) -> Result<ToolResult> {
            Ok(ToolResult::default())
        }
    }

    #[tokio::test]
    async fn ensure_clean_context_retries_with_restart() {
        let bridge = FlakyBridge::new(2);
        let run_id = Id::new();
        ensure_clean_context(&bridge, true, &run_id, 3).await.unwrap();
        assert!(bridge.restarts.load(AtomicOrdering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn ensure_clean_context_gives_up_after_retries() {
        let bridge = FlakyBridge::new(10);
        let run_id = Id::new();
        let result = ensure_clean_context(&bridge, true, &run_id, 2).await;
        assert!(result.is_err());
    }
}
