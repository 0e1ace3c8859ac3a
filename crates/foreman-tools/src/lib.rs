use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use foreman_types::AutonomyLevel;

/// What a tool is allowed to touch. The supervisor checks the class against
/// the calling task's autonomy level before invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityClass {
    FsRead,
    FsWrite,
    ShellExec,
    Network,
    MemoryRead,
    MemoryWrite,
}

impl CapabilityClass {
    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityClass::FsRead => "fs_read",
            CapabilityClass::FsWrite => "fs_write",
            CapabilityClass::ShellExec => "shell_exec",
            CapabilityClass::Network => "network",
            CapabilityClass::MemoryRead => "memory_read",
            CapabilityClass::MemoryWrite => "memory_write",
        }
    }

    /// Minimum autonomy level a task must have cleared before a tool of
    /// this class may run on its behalf.
    pub fn required_level(self) -> AutonomyLevel {
        match self {
            CapabilityClass::FsRead | CapabilityClass::MemoryRead => AutonomyLevel::L0Autonomous,
            CapabilityClass::FsWrite | CapabilityClass::MemoryWrite => AutonomyLevel::L1Notify,
            CapabilityClass::ShellExec | CapabilityClass::Network => AutonomyLevel::L2Approve,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-schema fragment describing the accepted arguments.
    pub parameters: Value,
    pub capability: CapabilityClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: String,
    pub metadata: Value,
}

impl ToolResult {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            metadata: json!({}),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn invoke(&self, args: Value) -> anyhow::Result<ToolResult>;
    async fn invoke_with_cancel(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        self.invoke(args).await
    }
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.spec().name;
        self.tools.write().await.insert(name, tool);
    }

    pub async fn list(&self) -> Vec<ToolSpec> {
        let mut specs = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.spec())
            .collect::<Vec<_>>();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Unknown tools produce a soft result rather than an error so worker
    /// output containing a bad directive does not fail the task.
    pub async fn invoke(&self, name: &str, args: Value) -> anyhow::Result<ToolResult> {
        self.invoke_with_cancel(name, args, CancellationToken::new())
            .await
    }

    pub async fn invoke_with_cancel(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        let tool = self.tools.read().await.get(name).cloned();
        let Some(tool) = tool else {
            tracing::warn!(tool = name, "unknown tool invoked");
            return Ok(ToolResult {
                output: format!("Unknown tool: {name}"),
                metadata: json!({"unknown_tool": true}),
            });
        };
        tool.invoke_with_cancel(args, cancel).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Test double that records every invocation.
pub struct RecordingTool {
    spec: ToolSpec,
    pub calls: std::sync::Mutex<Vec<Value>>,
}

impl RecordingTool {
    pub fn new(name: &str, capability: CapabilityClass) -> Self {
        Self {
            spec: ToolSpec {
                name: name.to_string(),
                description: format!("recording double for {name}"),
                parameters: json!({"type": "object"}),
                capability,
            },
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<ToolResult> {
        self.calls.lock().expect("calls lock").push(args);
        Ok(ToolResult::text("ok"))
    }
}
