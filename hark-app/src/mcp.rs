//! Tool servers spoken to over stdio JSON-RPC.
//!
//! Each enabled server is spawned at startup, initialized and asked for its
//! tool list. Servers that fail any of those steps are logged and skipped so
//! one broken entry never keeps the assistant from starting.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use hark_core::error::Result;
use hark_core::{CollaboratorKind, HarkError, ToolInvoker, ToolSpec};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::settings::ToolServerSettings;

pub const PROTOCOL_VERSION: &str = "2025-06-18";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    fn into_result(self) -> anyhow::Result<Value> {
        if let Some(err) = self.error {
            bail!("code={}, message={}", err.code, err.message);
        }
        self.result.ok_or_else(|| anyhow!("empty result"))
    }
}

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema", alias = "input_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

impl From<ToolDefinition> for ToolSpec {
    fn from(def: ToolDefinition) -> Self {
        ToolSpec {
            name: def.name,
            description: def.description,
            input_schema: def.input_schema,
        }
    }
}

pub fn parse_tool_list(result: &Value) -> anyhow::Result<Vec<ToolDefinition>> {
    let tools = result.get("tools").cloned().unwrap_or(Value::Array(vec![]));
    serde_json::from_value(tools).context("malformed tools/list result")
}

/// Turn a `tools/call` result into the map handed back to the chat model.
///
/// Structured content is used as-is; otherwise text blocks are joined under
/// `result`. A result flagged `isError` is a tool failure.
pub fn tool_result_to_map(result: &Value) -> std::result::Result<Map<String, Value>, String> {
    let text: Vec<&str> = result["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b["type"] == "text")
                .filter_map(|b| b["text"].as_str())
                .collect()
        })
        .unwrap_or_default();
    let text = text.join("\n");

    if result["isError"].as_bool().unwrap_or(false) {
        return Err(if text.is_empty() {
            "tool reported an error".into()
        } else {
            text
        });
    }

    if let Some(Value::Object(structured)) = result.get("structuredContent") {
        return Ok(structured.clone());
    }
    let mut map = Map::new();
    map.insert("result".into(), Value::String(text));
    Ok(map)
}

/// Responses are handed to the request waiting on their id.
type PendingMap = Arc<Mutex<HashMap<u64, SyncSender<JsonRpcResponse>>>>;

/// Line-delimited JSON-RPC over a child's stdin/stdout.
///
/// A reader thread dispatches each response to its request's channel, so
/// the stdin lock covers only the write and requests wait independently.
struct StdioTransport {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl StdioTransport {
    fn spawn(server: &ToolServerSettings, timeout: Duration) -> anyhow::Result<Self> {
        let mut child = Command::new(&server.command)
            .args(&server.args)
            .envs(&server.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", server.command))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdout"))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        let name = server.name.clone();
        thread::Builder::new()
            .name(format!("hark-mcp-{name}"))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(server = %name, error = %e, "tool server read error");
                            break;
                        }
                    };
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                        Ok(resp) => match reader_pending.lock().remove(&resp.id) {
                            Some(tx) => {
                                let _ = tx.send(resp);
                            }
                            // Late answer to a request that already timed out.
                            None => debug!(server = %name, id = resp.id, "skipping stale response"),
                        },
                        Err(_) => debug!(server = %name, "ignoring non-response line"),
                    }
                }
                reader_closed.store(true, Ordering::SeqCst);
                // Dropping the senders wakes every waiting request.
                reader_pending.lock().clear();
                debug!(server = %name, "tool server closed stdout");
            })?;

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            closed,
            next_id: AtomicU64::new(1),
            timeout,
        })
    }

    fn write_line(&self, value: &impl Serialize) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        let mut stdin = self.stdin.lock();
        stdin.write_all(line.as_bytes())?;
        stdin.flush()?;
        Ok(())
    }

    fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::sync_channel(1);
        self.pending.lock().insert(id, tx);
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().remove(&id);
            bail!("server exited before {method}");
        }
        if let Err(e) = self.write_line(&JsonRpcRequest::new(id, method, params)) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match rx.recv_timeout(self.timeout) {
            Ok(resp) => resp.into_result(),
            Err(RecvTimeoutError::Timeout) => {
                self.pending.lock().remove(&id);
                bail!("{method} timed out")
            }
            Err(RecvTimeoutError::Disconnected) => bail!("server exited during {method}"),
        }
    }

    fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        self.write_line(&json!({ "jsonrpc": "2.0", "method": method, "params": params }))
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        let child = self.child.get_mut();
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// One initialized server.
pub struct ToolServer {
    name: String,
    transport: StdioTransport,
    tools: Vec<ToolDefinition>,
}

impl ToolServer {
    pub fn connect(settings: &ToolServerSettings) -> anyhow::Result<Self> {
        Self::connect_with_timeout(settings, REQUEST_TIMEOUT)
    }

    fn connect_with_timeout(settings: &ToolServerSettings, timeout: Duration) -> anyhow::Result<Self> {
        let transport = StdioTransport::spawn(settings, timeout)?;

        let init = transport.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "hark", "version": env!("CARGO_PKG_VERSION") },
            }),
        )?;
        let version = init["protocolVersion"].as_str().unwrap_or(PROTOCOL_VERSION);
        debug!(server = %settings.name, protocol = version, "tool server initialized");
        transport.notify("notifications/initialized", json!({}))?;

        let tools = parse_tool_list(&transport.request("tools/list", json!({}))?)?;

        Ok(Self {
            name: settings.name.clone(),
            transport,
            tools,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn call(&self, tool: &str, arguments: Map<String, Value>) -> anyhow::Result<Value> {
        self.transport
            .request("tools/call", json!({ "name": tool, "arguments": arguments }))
    }
}

/// Tools from every connected server, routed by name.
#[derive(Default)]
pub struct McpTools {
    servers: Vec<Arc<ToolServer>>,
    routes: HashMap<String, usize>,
    specs: Vec<ToolSpec>,
}

impl McpTools {
    /// Connect every enabled server. Failures are logged, never returned.
    pub fn connect_all(servers: &[ToolServerSettings]) -> Self {
        let mut connected = Vec::new();
        for settings in servers.iter().filter(|s| s.enabled) {
            match ToolServer::connect(settings) {
                Ok(server) => {
                    info!(
                        server = %settings.name,
                        tools = server.tools().len(),
                        "tool server connected"
                    );
                    connected.push(server);
                }
                Err(e) => warn!(server = %settings.name, "tool server unavailable: {e:#}"),
            }
        }
        Self::from_servers(connected)
    }

    pub fn from_servers(servers: Vec<ToolServer>) -> Self {
        let mut tools = Self::default();
        for server in servers {
            let index = tools.servers.len();
            for def in server.tools() {
                if tools.routes.contains_key(&def.name) {
                    warn!(server = server.name(), tool = %def.name, "duplicate tool name ignored");
                    continue;
                }
                tools.routes.insert(def.name.clone(), index);
                tools.specs.push(def.clone().into());
            }
            tools.servers.push(Arc::new(server));
        }
        tools
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }
}

impl ToolInvoker for McpTools {
    fn tools(&self) -> Vec<ToolSpec> {
        self.specs.clone()
    }

    fn call(&self, name: &str, args: Map<String, Value>) -> Result<Map<String, Value>> {
        let fail = |m: String| HarkError::collaborator(CollaboratorKind::Tool, m);

        let server = self
            .routes
            .get(name)
            .and_then(|&i| self.servers.get(i))
            .ok_or_else(|| fail(format!("unknown tool '{name}'")))?;
        let result = server
            .call(name, args)
            .map_err(|e| fail(format!("{}: {e:#}", server.name())))?;
        tool_result_to_map(&result).map_err(|m| fail(format!("{name}: {m}")))
    }
}
