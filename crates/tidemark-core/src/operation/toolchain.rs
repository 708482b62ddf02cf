//! External tool steps: `customScript`, `toolChain` and migration hooks.
//!
//! Steps run in order. A step's trimmed stdout is stored in a variable map
//! (under its `output` name, or its step name) and later steps can refer to
//! it as `{{name}}` in their tool, arguments and environment. The variables
//! `migrationId`, `environment` and `region` are always defined.

use super::{OperationError, OperationOutput, OperationRegistry, OutcomeStatus};
use crate::context::ExecutionContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;

fn default_true() -> bool {
    true
}

/// One external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStep {
    /// Step name, used in reports and as the default output variable.
    pub name: String,
    /// Executable to run.
    pub tool: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Variable receiving the step's stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// When false, a failure is recorded and the chain continues.
    #[serde(default = "default_true")]
    pub required: bool,
}

/// Payload of `customScript` and `toolChain`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolChain {
    pub steps: Vec<ToolStep>,
    /// Extra variables available to every step.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
}

/// A fully interpolated tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub tool: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Errors raised by a [`ToolRunner`].
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool could not be started.
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool exited unsuccessfully.
    #[error("{tool} exited with {code}: {stderr}")]
    Exit {
        tool: String,
        code: String,
        stderr: String,
    },

    /// Any other runner failure.
    #[error("{0}")]
    Other(String),
}

/// Runs external tools on behalf of tool steps.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run the tool and return its trimmed stdout.
    async fn run(&self, invocation: &ToolInvocation) -> Result<String, ToolError>;
}

/// [`ToolRunner`] that spawns a child process directly, without a shell.
#[derive(Debug, Clone)]
pub struct ProcessToolRunner {
    inherit_env: bool,
}

impl Default for ProcessToolRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessToolRunner {
    /// Create a runner whose children inherit the parent environment.
    pub fn new() -> Self {
        Self { inherit_env: true }
    }

    /// Start children with only the step's own environment.
    pub fn with_clean_env(mut self) -> Self {
        self.inherit_env = false;
        self
    }
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<String, ToolError> {
        let mut command = tokio::process::Command::new(&invocation.tool);
        command.args(&invocation.args).kill_on_drop(true);
        if !self.inherit_env {
            command.env_clear();
        }
        command.envs(&invocation.env);

        let output = command.output().await.map_err(|source| ToolError::Spawn {
            tool: invocation.tool.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(ToolError::Exit {
                tool: invocation.tool.clone(),
                code: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Replace every `{{name}}` with its variable. Unknown names are left as written.
pub fn interpolate(template: &str, variables: &BTreeMap<String, String>) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            result.push_str(&rest[start..]);
            return result;
        };
        let name = after[..end].trim();
        match variables.get(name) {
            Some(value) => result.push_str(value),
            None => result.push_str(&rest[start..start + end + 4]),
        }
        rest = &after[end + 2..];
    }

    result.push_str(rest);
    result
}

/// Per-step results of a tool chain run.
#[derive(Debug, Clone, Default)]
pub struct ToolChainReport {
    /// One entry per attempted step.
    pub steps: Vec<Value>,
    /// Final variable map.
    pub variables: BTreeMap<String, String>,
    /// Names of optional steps that failed.
    pub failed_optional: Vec<String>,
}

impl OperationRegistry {
    /// Run tool steps in order with `{{var}}` interpolation.
    ///
    /// A required step's failure stops the chain with
    /// [`OperationError::ToolFailed`]; an optional step's failure is recorded.
    pub(crate) async fn run_tool_steps(
        &self,
        steps: &[ToolStep],
        variables: &BTreeMap<String, String>,
        ctx: &ExecutionContext,
    ) -> Result<ToolChainReport, OperationError> {
        let mut report = ToolChainReport {
            variables: variables.clone(),
            ..Default::default()
        };
        report
            .variables
            .insert("migrationId".to_string(), ctx.migration_id.clone());
        report
            .variables
            .insert("environment".to_string(), ctx.environment.to_string());
        report
            .variables
            .insert("region".to_string(), ctx.region.clone());

        for step in steps {
            if ctx.is_cancelled() {
                return Err(OperationError::Cancelled);
            }

            let invocation = ToolInvocation {
                tool: interpolate(&step.tool, &report.variables),
                args: step
                    .args
                    .iter()
                    .map(|arg| interpolate(arg, &report.variables))
                    .collect(),
                env: step
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), interpolate(v, &report.variables)))
                    .collect(),
            };

            let result = tokio::select! {
                result = self.tools.run(&invocation) => result,
                _ = ctx.cancel.cancelled() => return Err(OperationError::Cancelled),
            };

            match result {
                Ok(stdout) => {
                    tracing::debug!(migration_id = %ctx.migration_id, step = %step.name, "tool step finished");
                    let variable = step.output.clone().unwrap_or_else(|| step.name.clone());
                    report.variables.insert(variable, stdout.clone());
                    report
                        .steps
                        .push(json!({"name": step.name, "status": "success", "output": stdout}));
                }
                Err(e) if step.required => {
                    return Err(OperationError::ToolFailed {
                        step: step.name.clone(),
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        migration_id = %ctx.migration_id,
                        step = %step.name,
                        error = %e,
                        "optional tool step failed"
                    );
                    report
                        .steps
                        .push(json!({"name": step.name, "status": "error", "error": e.to_string()}));
                    report.failed_optional.push(step.name.clone());
                }
            }
        }

        Ok(report)
    }

    pub(crate) async fn run_tool_chain(
        &self,
        chain: &ToolChain,
        ctx: &ExecutionContext,
    ) -> Result<OperationOutput, OperationError> {
        let report = self.run_tool_steps(&chain.steps, &chain.variables, ctx).await?;
        Ok(OperationOutput::new(OutcomeStatus::Completed)
            .with("steps", report.steps)
            .with("variables", json!(report.variables)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::EngineConfig;
    use crate::context::Environment;
    use crate::operation::Operation;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Echoes `tool args...`, failing for tools named `fail`.
    #[derive(Default)]
    struct EchoRunner {
        calls: Mutex<Vec<ToolInvocation>>,
    }

    #[async_trait]
    impl ToolRunner for EchoRunner {
        async fn run(&self, invocation: &ToolInvocation) -> Result<String, ToolError> {
            self.calls.lock().push(invocation.clone());
            if invocation.tool == "fail" {
                return Err(ToolError::Other("boom".to_string()));
            }
            Ok(format!("{} {}", invocation.tool, invocation.args.join(" ")))
        }
    }

    fn step(name: &str, tool: &str, args: &[&str]) -> ToolStep {
        ToolStep {
            name: name.to_string(),
            tool: tool.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            output: None,
            required: true,
        }
    }

    fn setup() -> (Arc<EchoRunner>, OperationRegistry) {
        let runner = Arc::new(EchoRunner::default());
        let registry = OperationRegistry::new(
            Arc::new(MemoryBackend::new()),
            runner.clone(),
            &EngineConfig::default(),
        );
        (runner, registry)
    }

    #[test]
    fn test_interpolate() {
        let vars = BTreeMap::from([("name".to_string(), "users".to_string())]);
        assert_eq!(interpolate("t={{name}}", &vars), "t=users");
        assert_eq!(interpolate("{{ name }}-{{name}}", &vars), "users-users");
        assert_eq!(interpolate("{{missing}}", &vars), "{{missing}}");
        assert_eq!(interpolate("open {{name", &vars), "open {{name");
    }

    #[tokio::test]
    async fn test_outputs_feed_later_steps() {
        let (runner, registry) = setup();
        let mut first = step("version", "echo", &["{{migrationId}}"]);
        first.output = Some("ver".to_string());
        let chain = ToolChain {
            steps: vec![first, step("deploy", "deploy", &["--tag", "{{ver}}", "{{region}}"])],
            variables: BTreeMap::new(),
        };

        let ctx = ExecutionContext::new("m7", Environment::Staging, "eu-1");
        let output = registry
            .execute(&Operation::ToolChain(chain), &ctx)
            .await
            .unwrap();
        assert_eq!(output.status, OutcomeStatus::Completed);

        let calls = runner.calls.lock();
        assert_eq!(calls[1].args, vec!["--tag", "echo m7", "eu-1"]);
    }

    #[tokio::test]
    async fn test_required_step_failure_stops_chain() {
        let (runner, registry) = setup();
        let chain = ToolChain {
            steps: vec![step("a", "fail", &[]), step("b", "echo", &[])],
            variables: BTreeMap::new(),
        };
        let ctx = ExecutionContext::new("m7", Environment::Development, "local");
        let err = registry
            .execute(&Operation::CustomScript(chain), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::ToolFailed { ref step, .. } if step == "a"));
        assert_eq!(runner.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_optional_step_failure_continues() {
        let (runner, registry) = setup();
        let mut optional = step("a", "fail", &[]);
        optional.required = false;
        let chain = ToolChain {
            steps: vec![optional, step("b", "echo", &["{{a}}"])],
            variables: BTreeMap::new(),
        };
        let ctx = ExecutionContext::new("m7", Environment::Development, "local");
        let output = registry
            .execute(&Operation::ToolChain(chain), &ctx)
            .await
            .unwrap();

        let steps = output.detail("steps").unwrap().as_array().unwrap();
        assert_eq!(steps[0]["status"], "error");
        assert_eq!(steps[1]["status"], "success");
        assert_eq!(runner.calls.lock()[1].args, vec!["{{a}}"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_captures_stdout() {
        let runner = ProcessToolRunner::new();
        let output = runner
            .run(&ToolInvocation {
                tool: "echo".to_string(),
                args: vec!["hello".to_string()],
                env: BTreeMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(output, "hello");

        let err = runner
            .run(&ToolInvocation {
                tool: "false".to_string(),
                args: Vec::new(),
                env: BTreeMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Exit { .. }));
    }
}
