//! Tool registry and dispatcher.
//!
//! Tool calls produced by the provider loop are validated against the
//! registry, given an execution context, bounded by a per-category timeout
//! and routed to either the synchronous path or, for long CLI invocations,
//! the background CLI manager. Dispatch errors surface inside the tool
//! call's own result shape; they never fail the parent request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cli_jobs::{CliJobManager, JobSubmission};
use crate::request::TriggerContext;

/// Closed set of parameter types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParamType {
    /// Structured types reject bare strings; everything else is permissive
    /// (parameters are not coerced, only gated).
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::String => !value.is_array() && !value.is_object(),
            _ => true,
        }
    }
}

/// Declared parameter of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub description: String,
    #[serde(default)]
    pub optional: bool,
}

/// A registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Category drives the execution timeout (see `timeout_for_category`)
    pub category: String,
    #[serde(default)]
    pub parameters: HashMap<String, ParamSpec>,
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default)]
    pub requires_auth: bool,
}

/// Execution context injected into every tool call. The dispatcher never
/// mutates it; executors read what they need.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub user_id: String,
    pub agentic_id: Option<String>,
    pub conversation_id: Option<String>,
    pub account_id: Option<String>,
    pub external_id: Option<String>,
    pub platform: Option<String>,
    pub trigger_context: Option<TriggerContext>,
}

/// Outcome of one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResult {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Trait implemented by each tool's business logic (owned by the
/// application layer; only dispatch lives here).
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn run(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<Value>;
}

/// Registry mapping tool IDs to definitions and executors.
#[derive(Default)]
pub struct ToolRegistry {
    definitions: HashMap<String, ToolDefinition>,
    executors: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: ToolDefinition, executor: Arc<dyn ToolExecutor>) {
        let id = definition.id.clone();
        self.definitions.insert(id.clone(), definition);
        self.executors.insert(id, executor);
    }

    pub fn definition(&self, id: &str) -> Option<&ToolDefinition> {
        self.definitions.get(id)
    }

    pub fn executor(&self, id: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.executors.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.definitions.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Per-category execution ceilings, chosen to fit inside the reasoning
/// loop's own deadline.
pub fn timeout_for_category(category: &str) -> Duration {
    match category {
        "shell" | "remote-process" => Duration::from_secs(60),
        "transfer" | "screenshot" | "camera" | "microphone" => Duration::from_secs(60),
        "cli" => Duration::from_secs(180),
        _ => Duration::from_secs(30),
    }
}

/// Workspace path confinement. Tools that resolve file paths must stay
/// inside the permitted roots; absolute paths outside them are rejected.
#[derive(Debug, Clone)]
pub struct SafeRoots {
    roots: Vec<PathBuf>,
}

impl SafeRoots {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Resolve a raw path against the first root. Relative paths are joined;
    /// absolute paths must already live under a permitted root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, String> {
        let path = Path::new(raw);
        if path.is_absolute() {
            let canonical = path.to_path_buf();
            let permitted = self.roots.iter().any(|root| canonical.starts_with(root));
            if permitted {
                Ok(canonical)
            } else {
                tracing::warn!(path = %raw, "Rejected path outside permitted roots");
                Err(format!("path outside permitted roots: {}", raw))
            }
        } else {
            match self.roots.first() {
                Some(root) => {
                    let joined = root.join(path);
                    // Reject traversal out of the root via `..` components.
                    if joined
                        .components()
                        .any(|c| matches!(c, std::path::Component::ParentDir))
                    {
                        tracing::warn!(path = %raw, "Rejected path with parent traversal");
                        Err(format!("path escapes workspace: {}", raw))
                    } else {
                        Ok(joined)
                    }
                }
                None => Err("no permitted roots configured".to_string()),
            }
        }
    }
}

/// The dispatcher: validation pipeline, context injection, timeout
/// enforcement and the sync/async split.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    cli_jobs: Arc<CliJobManager>,
    safe_roots: SafeRoots,
    /// CLI invocations declaring a timeout above this go to the background
    sync_threshold: Duration,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        cli_jobs: Arc<CliJobManager>,
        safe_roots: SafeRoots,
        sync_threshold: Duration,
    ) -> Self {
        Self {
            registry,
            cli_jobs,
            safe_roots,
            sync_threshold,
        }
    }

    pub fn safe_roots(&self) -> &SafeRoots {
        &self.safe_roots
    }

    /// Execute a tool call. Validation failures and executor errors come
    /// back inside the result shape, not as Err.
    pub async fn execute(&self, tool_id: &str, params: Value, ctx: &ToolContext) -> ToolCallResult {
        // 1. Exact-match lookup.
        let Some(definition) = self.registry.definition(tool_id) else {
            return ToolCallResult::err(format!("unknown tool: {}", tool_id));
        };

        // 2. Required parameters present and non-empty.
        for required in &definition.required_params {
            match params.get(required) {
                None | Some(Value::Null) => {
                    return ToolCallResult::err(format!("missing required parameter: {}", required));
                }
                Some(Value::String(s)) if s.trim().is_empty() => {
                    return ToolCallResult::err(format!("required parameter is empty: {}", required));
                }
                _ => {}
            }
        }

        // 3. Structured-type gate: a string where an array/object is
        // mandatory is rejected, nothing is coerced.
        for (name, spec) in &definition.parameters {
            if let Some(value) = params.get(name) {
                if !value.is_null() && !spec.param_type.accepts(value) {
                    return ToolCallResult::err(format!(
                        "parameter {} expects {:?}, got incompatible value",
                        name, spec.param_type
                    ));
                }
            }
        }

        // 4. Long CLI invocations are diverted to the background manager.
        if definition.category == "cli" {
            if let Some(declared) = declared_timeout(&params) {
                if declared > self.sync_threshold {
                    return self.divert_to_background(definition.id.clone(), params, ctx).await;
                }
            }
        }

        // 5. Synchronous path under the category timeout.
        let timeout = timeout_for_category(&definition.category);
        let Some(executor) = self.registry.executor(tool_id) else {
            return ToolCallResult::err(format!("tool has no executor: {}", tool_id));
        };

        tracing::debug!(tool = %tool_id, timeout = ?timeout, "Dispatching tool call");
        match tokio::time::timeout(timeout, executor.run(params, ctx)).await {
            Ok(Ok(result)) => ToolCallResult::ok(result),
            Ok(Err(e)) => ToolCallResult::err(e.to_string()),
            Err(_) => ToolCallResult::err(format!(
                "tool {} timed out after {:.0?}",
                tool_id, timeout
            )),
        }
    }

    async fn divert_to_background(
        &self,
        tool_id: String,
        params: Value,
        ctx: &ToolContext,
    ) -> ToolCallResult {
        let Some(trigger) = ctx.trigger_context.clone().or_else(|| {
            match (&ctx.account_id, &ctx.external_id, &ctx.platform) {
                (Some(account_id), Some(external_id), Some(platform)) => Some(TriggerContext {
                    account_id: account_id.clone(),
                    external_id: external_id.clone(),
                    platform: platform.clone(),
                }),
                _ => None,
            }
        }) else {
            return ToolCallResult::err(
                "long-running CLI call needs a delivery target for its results",
            );
        };

        let cli_type = params
            .get("cliType")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| default_cli_for_tool(&tool_id));
        let command = match params.get("prompt").or_else(|| params.get("command")) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            _ => return ToolCallResult::err("missing prompt for CLI execution"),
        };
        let workspace = match params.get("workspace").and_then(|v| v.as_str()) {
            Some(raw) => match self.safe_roots.resolve(raw) {
                Ok(path) => path,
                Err(e) => return ToolCallResult::err(e),
            },
            None => match self.safe_roots.roots.first() {
                Some(root) => root.clone(),
                None => return ToolCallResult::err("no workspace roots configured"),
            },
        };

        let timeout = declared_timeout(&params).unwrap_or(self.sync_threshold);
        let submission = JobSubmission {
            cli_type,
            command,
            workspace,
            user_id: ctx.user_id.clone(),
            agentic_id: ctx.agentic_id.clone(),
            conversation_id: ctx.conversation_id.clone(),
            delivery_target: trigger,
            timeout,
        };

        match self.cli_jobs.start_execution(submission).await {
            Ok(tracking_id) => ToolCallResult::ok(json!({
                "async": true,
                "trackingId": tracking_id,
                "message": "Started in the background; results will be delivered when ready.",
            })),
            Err(e) => ToolCallResult::err(e.to_string()),
        }
    }
}

/// The timeout a tool invocation declares for itself, in ms or seconds.
fn declared_timeout(params: &Value) -> Option<Duration> {
    if let Some(ms) = params.get("timeoutMs").and_then(|v| v.as_u64()) {
        return Some(Duration::from_millis(ms));
    }
    params
        .get("timeoutSeconds")
        .and_then(|v| v.as_u64())
        .map(Duration::from_secs)
}

/// Map a CLI-delegation tool to its default CLI.
fn default_cli_for_tool(tool_id: &str) -> String {
    let lower = tool_id.to_lowercase();
    if lower.contains("claude") {
        "cli-claude".to_string()
    } else if lower.contains("gemini") {
        "cli-gemini".to_string()
    } else {
        "cli-opencode".to_string()
    }
}
