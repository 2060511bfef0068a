mod logging;

use std::{collections::BTreeMap, path::Path, sync::Arc};

use lldb_bridge_core::{
    ops,
    types::{LaunchRequest, OpenAndAttachRequest, StepKind, WatchKind},
    LldbConfig, LldbConnector, LldbError, SessionRegistry,
};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Which debugged process a tool call refers to. `pid` wins when both are set.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
struct Target {
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    bundle_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct AttachParams {
    pid: u32,
    /// Optional bundle id to register as an alias for this pid.
    #[serde(default)]
    bundle_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct LaunchParams {
    executable_path: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    stop_at_entry: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct LaunchAppParams {
    /// Path to the `.app` bundle.
    bundle_path: String,
    /// Process name to wait for; defaults to the bundle name without `.app`.
    #[serde(default)]
    executable_name: Option<String>,
    #[serde(default)]
    bundle_id: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    stop_at_entry: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct TargetParams {
    #[serde(flatten)]
    target: Target,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct SessionsParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct CommandParams {
    #[serde(flatten)]
    target: Target,
    command: String,
    /// Wait for the debugger prompt. Turn off for commands that resume the target.
    #[serde(default = "default_true")]
    wait: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct BreakpointSetParams {
    #[serde(flatten)]
    target: Target,
    /// Function name. Use either `name` or `file` with `line`.
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: Option<u32>,
    #[serde(default)]
    condition: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DeleteParams {
    #[serde(flatten)]
    target: Target,
    id: u32,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct WatchpointSetParams {
    #[serde(flatten)]
    target: Target,
    /// Variable to watch. Use either `variable` or `address`.
    #[serde(default)]
    variable: Option<String>,
    #[serde(default)]
    address: Option<String>,
    /// read, write or read_write
    #[serde(default)]
    kind: Option<String>,
    /// Bytes to watch at `address`: 1, 2, 4 or 8.
    #[serde(default)]
    size: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ReadMemoryParams {
    #[serde(flatten)]
    target: Target,
    address: String,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    count: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct EvaluateParams {
    #[serde(flatten)]
    target: Target,
    expression: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct NamesParams {
    #[serde(flatten)]
    target: Target,
    #[serde(default)]
    names: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct SelectParams {
    #[serde(flatten)]
    target: Target,
    index: u32,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct StepParams {
    #[serde(flatten)]
    target: Target,
    /// over, into, out or instruction
    #[serde(default = "default_step_kind")]
    kind: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct BacktraceParams {
    #[serde(flatten)]
    target: Target,
    #[serde(default)]
    count: Option<u32>,
    #[serde(default)]
    all_threads: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct LookupSymbolParams {
    #[serde(flatten)]
    target: Target,
    /// Regular expression matched against symbol names.
    symbol: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct LookupAddressParams {
    #[serde(flatten)]
    target: Target,
    address: String,
}

fn default_true() -> bool {
    true
}

fn default_step_kind() -> String {
    "over".to_string()
}

fn to_mcp_error(err: LldbError) -> McpError {
    let data = Some(json!({
        "session_discarded": err.is_session_fatal(),
    }));
    match err {
        LldbError::InvalidParameter(message) => McpError::invalid_params(message, data),
        other => McpError::internal_error(other.to_string(), data),
    }
}

fn output_result(pid: u32, output: String) -> CallToolResult {
    CallToolResult::structured(json!({
        "ok": true,
        "pid": pid,
        "output": output,
    }))
}

fn launch_state(stop_at_entry: bool) -> &'static str {
    if stop_at_entry {
        "stopped"
    } else {
        "running"
    }
}

fn executable_name_for(bundle_path: &str) -> Option<String> {
    Path::new(bundle_path.trim_end_matches('/'))
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
}

#[derive(Clone)]
struct LldbMcpServer {
    tool_router: ToolRouter<Self>,
    registry: Arc<SessionRegistry<LldbConnector>>,
}

#[tool_router]
impl LldbMcpServer {
    fn new(config: LldbConfig) -> Self {
        Self {
            tool_router: Self::tool_router(),
            registry: Arc::new(SessionRegistry::new(LldbConnector::new(config))),
        }
    }

    async fn resolve_pid(&self, target: &Target) -> Result<u32, McpError> {
        if let Some(pid) = target.pid {
            return Ok(pid);
        }
        let Some(bundle_id) = target.bundle_id.as_deref() else {
            return Err(McpError::invalid_params(
                "Either pid or bundle_id is required",
                None,
            ));
        };
        self.registry
            .get_by_bundle(bundle_id)
            .await
            .and_then(|session| session.target_pid())
            .ok_or_else(|| to_mcp_error(LldbError::no_session_for_bundle(bundle_id)))
    }

    #[tool(description = "Attach LLDB to a running process by pid, reusing a live session if one exists")]
    async fn debugger_attach(
        &self,
        params: Parameters<AttachParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self
            .registry
            .get_or_create(params.pid)
            .await
            .map_err(to_mcp_error)?;
        if let Some(bundle_id) = params.bundle_id {
            self.registry.register_alias(bundle_id, params.pid).await;
        }

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": "attached",
            "pid": params.pid,
            "transcript_path": session.transcript_path().map(|p| p.display().to_string()),
        })))
    }

    #[tool(description = "Launch an executable under LLDB")]
    async fn debugger_launch(
        &self,
        params: Parameters<LaunchParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let request = LaunchRequest {
            executable_path: params.executable_path,
            args: params.args,
            env: params.env,
            stop_at_entry: params.stop_at_entry,
        };
        let (session, pid) = self
            .registry
            .launch(&request)
            .await
            .map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": launch_state(request.stop_at_entry),
            "pid": pid,
            "transcript_path": session.transcript_path().map(|p| p.display().to_string()),
        })))
    }

    #[tool(
        description = "Launch a signed or sandboxed app bundle through the OS launch service and attach once it starts"
    )]
    async fn debugger_launch_app(
        &self,
        params: Parameters<LaunchAppParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let executable_name = params
            .executable_name
            .or_else(|| executable_name_for(&params.bundle_path))
            .ok_or_else(|| {
                McpError::invalid_params(
                    "executable_name is required when it cannot be derived from bundle_path",
                    None,
                )
            })?;
        let request = OpenAndAttachRequest {
            bundle_path: params.bundle_path,
            executable_name,
            bundle_id: params.bundle_id,
            args: params.args,
            env: params.env,
            stop_at_entry: params.stop_at_entry,
        };
        let (session, pid) = self
            .registry
            .launch_via_open(&request)
            .await
            .map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": launch_state(request.stop_at_entry),
            "pid": pid,
            "bundle_id": request.bundle_id,
            "transcript_path": session.transcript_path().map(|p| p.display().to_string()),
        })))
    }

    #[tool(description = "Detach LLDB from a process, leaving it running, and close the session")]
    async fn debugger_detach(
        &self,
        params: Parameters<TargetParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        self.registry.detach(pid).await.map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": "detached",
            "pid": pid,
        })))
    }

    #[tool(description = "List live debugger sessions")]
    async fn debugger_sessions(
        &self,
        _params: Parameters<SessionsParams>,
    ) -> Result<CallToolResult, McpError> {
        let sessions = self.registry.list().await;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "sessions": sessions,
        })))
    }

    #[tool(description = "Run a raw LLDB command line (advanced users only - output is returned verbatim)")]
    async fn debugger_command(
        &self,
        params: Parameters<CommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let pid = self.resolve_pid(&params.target).await?;
        let output = ops::raw::raw(&self.registry, pid, &params.command, params.wait)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Set a breakpoint by function name or by file and line, with an optional condition")]
    async fn debugger_breakpoint_set(
        &self,
        params: Parameters<BreakpointSetParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let pid = self.resolve_pid(&params.target).await?;
        let condition = params.condition.as_deref();

        let output = match (params.name.as_deref(), params.file.as_deref(), params.line) {
            (Some(name), None, None) => {
                ops::breakpoint::set_by_name(&self.registry, pid, name, condition).await
            }
            (None, Some(file), Some(line)) => {
                ops::breakpoint::set_by_location(&self.registry, pid, file, line, condition).await
            }
            _ => {
                return Err(McpError::invalid_params(
                    "Provide either name, or file together with line",
                    None,
                ))
            }
        }
        .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Delete a breakpoint by id")]
    async fn debugger_breakpoint_delete(
        &self,
        params: Parameters<DeleteParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::breakpoint::delete(&self.registry, pid, params.0.id)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "List breakpoints")]
    async fn debugger_breakpoint_list(
        &self,
        params: Parameters<TargetParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::breakpoint::list(&self.registry, pid)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Set a watchpoint on a variable or an address")]
    async fn debugger_watchpoint_set(
        &self,
        params: Parameters<WatchpointSetParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let pid = self.resolve_pid(&params.target).await?;
        let kind = params
            .kind
            .as_deref()
            .map(str::parse::<WatchKind>)
            .transpose()
            .map_err(to_mcp_error)?;

        let output = match (params.variable.as_deref(), params.address.as_deref()) {
            (Some(variable), None) => {
                ops::watchpoint::set_variable(&self.registry, pid, variable, kind).await
            }
            (None, Some(address)) => {
                ops::watchpoint::set_address(&self.registry, pid, address, kind, params.size).await
            }
            _ => {
                return Err(McpError::invalid_params(
                    "Provide exactly one of variable or address",
                    None,
                ))
            }
        }
        .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Delete a watchpoint by id")]
    async fn debugger_watchpoint_delete(
        &self,
        params: Parameters<DeleteParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::watchpoint::delete(&self.registry, pid, params.0.id)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "List watchpoints")]
    async fn debugger_watchpoint_list(
        &self,
        params: Parameters<TargetParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::watchpoint::list(&self.registry, pid)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Read target memory at an address expression")]
    async fn debugger_read_memory(
        &self,
        params: Parameters<ReadMemoryParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let pid = self.resolve_pid(&params.target).await?;
        let output = ops::memory::read(
            &self.registry,
            pid,
            &params.address,
            params.format.as_deref(),
            params.count,
        )
        .await
        .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Evaluate an expression in the selected frame")]
    async fn debugger_evaluate(
        &self,
        params: Parameters<EvaluateParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::expression::evaluate(&self.registry, pid, &params.0.expression)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Read registers of the selected frame (all general purpose registers when names is empty)")]
    async fn debugger_registers(
        &self,
        params: Parameters<NamesParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::expression::read_registers(&self.registry, pid, &params.0.names)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "List threads")]
    async fn debugger_threads(
        &self,
        params: Parameters<TargetParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::thread::list(&self.registry, pid)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Select a thread by index")]
    async fn debugger_select_thread(
        &self,
        params: Parameters<SelectParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::thread::select(&self.registry, pid, params.0.index)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Step the selected thread (over, into, out or instruction)")]
    async fn debugger_step(
        &self,
        params: Parameters<StepParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let kind = params.0.kind.parse::<StepKind>().map_err(to_mcp_error)?;
        let output = ops::step::step(&self.registry, pid, kind)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(
        description = "Resume the target without waiting; use debugger_output or any later command to see where it stopped"
    )]
    async fn debugger_continue(
        &self,
        params: Parameters<TargetParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::step::resume(&self.registry, pid)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Interrupt a running target")]
    async fn debugger_interrupt(
        &self,
        params: Parameters<TargetParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::step::interrupt(&self.registry, pid)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Backtrace of the selected thread, or of all threads")]
    async fn debugger_backtrace(
        &self,
        params: Parameters<BacktraceParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let pid = self.resolve_pid(&params.target).await?;
        let output = ops::stack::backtrace(&self.registry, pid, params.count, params.all_threads)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Select a stack frame by index")]
    async fn debugger_select_frame(
        &self,
        params: Parameters<SelectParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::stack::select_frame(&self.registry, pid, params.0.index)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Show variables of the selected frame, optionally only the named ones")]
    async fn debugger_variables(
        &self,
        params: Parameters<NamesParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::stack::variables(&self.registry, pid, &params.0.names)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Look up symbols matching a regular expression")]
    async fn debugger_lookup_symbol(
        &self,
        params: Parameters<LookupSymbolParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::symbol::lookup_symbol(&self.registry, pid, &params.0.symbol)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Describe the code or data at an address")]
    async fn debugger_lookup_address(
        &self,
        params: Parameters<LookupAddressParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::symbol::lookup_address(&self.registry, pid, &params.0.address)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Show process status")]
    async fn debugger_status(
        &self,
        params: Parameters<TargetParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::process::status(&self.registry, pid)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }

    #[tool(description = "Return output LLDB printed since the last command, such as stop reports after debugger_continue")]
    async fn debugger_output(
        &self,
        params: Parameters<TargetParams>,
    ) -> Result<CallToolResult, McpError> {
        let pid = self.resolve_pid(&params.0.target).await?;
        let output = ops::process::pending_output(&self.registry, pid)
            .await
            .map_err(to_mcp_error)?;
        Ok(output_result(pid, output))
    }
}

#[tool_handler]
impl ServerHandler for LldbMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "LLDB MCP Server: one interactive LLDB session per target pid. A timed out \
                 session is discarded; retry the call to get a fresh one."
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = LldbConfig::from_env();
    tracing::info!(
        "Using {} with a {:?} command timeout",
        config.lldb_path.display(),
        config.command_timeout
    );

    let server = LldbMcpServer::new(config);
    let registry = server.registry.clone();
    let transport = transport::stdio();

    tracing::info!("Starting LLDB MCP Server on stdio...");

    server.serve(transport).await?.waiting().await?;

    for session in registry.list().await {
        registry.remove(session.pid).await;
    }

    Ok(())
}
