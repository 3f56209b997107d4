//! CLI-backed provider adapters (claude, gemini, opencode).
//!
//! Each adapter wraps a locally installed coding-agent CLI. Processes are
//! spawned with kill-on-drop so an abandoned future cannot leak a child.
//! Captured output goes through a transcript pipeline before it becomes a
//! chat reply: ANSI escapes and spinner rewrites are stripped, binary
//! bursts are replaced with a placeholder, and the closing summary is
//! clipped to a deliverable size. Authentication state is checked by
//! invoking the CLI's own status command.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use super::{ChatInvocation, ChatOutcome, CliAdapter, CliExecOptions, CliExecution, ProviderAdapter};
use crate::error::ProviderError;
use crate::request::{Role, TokenUsage};
use crate::workspace::snapshot_workspace;

const AUTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling on the prose a CLI run may hand back as its response; anything
/// longer is a transcript, not an answer.
const MAX_RESPONSE_CHARS: usize = 4000;

/// Reduce a captured CLI stream to plain text.
///
/// Coding-agent CLIs colourise their output, redraw progress lines with
/// carriage returns, and occasionally dump raw bytes when a subcommand
/// misbehaves. Escape sequences (CSI and OSC) are dropped, `\r` rewrites
/// are discarded with the line they overwrote, and a stream that decodes
/// to mostly garbage is replaced outright instead of being forwarded.
fn clean_transcript(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut out = String::with_capacity(text.len());
    let mut garbage = 0usize;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => match chars.peek() {
                // CSI: ESC [ parameters, terminated by a byte in @..~
                Some('[') => {
                    chars.next();
                    while let Some(&next) = chars.peek() {
                        chars.next();
                        if ('@'..='~').contains(&next) {
                            break;
                        }
                    }
                }
                // OSC: ESC ] text, terminated by BEL
                Some(']') => {
                    chars.next();
                    for next in chars.by_ref() {
                        if next == '\u{7}' {
                            break;
                        }
                    }
                }
                _ => {}
            },
            // A bare \r is a progress-line rewrite; drop what it overwrote.
            '\r' => {
                if chars.peek() != Some(&'\n') {
                    if let Some(line_start) = out.rfind('\n') {
                        out.truncate(line_start + 1);
                    } else {
                        out.clear();
                    }
                }
            }
            '\n' | '\t' => out.push(c),
            '\u{FFFD}' => garbage += 1,
            c if c.is_control() => garbage += 1,
            c => out.push(c),
        }
    }

    // A stream that is one-quarter garbage was never text to begin with.
    if garbage > out.chars().count().max(1) / 4 {
        return format!("[unreadable output, {} bytes]", bytes.len());
    }
    out
}

/// The closing summary of a transcript: its last non-empty paragraph,
/// which is where CLI agents put their wrap-up prose.
fn trailing_text(stdout: &str) -> String {
    let trimmed = stdout.trim_end();
    if trimmed.is_empty() {
        return String::new();
    }
    let start = trimmed.rfind("\n\n").map(|i| i + 2).unwrap_or(0);
    trimmed[start..].trim().to_string()
}

/// Clip a response to the deliverable ceiling, cutting on a char boundary.
fn clip_response(mut text: String) -> String {
    if text.len() <= MAX_RESPONSE_CHARS {
        return text;
    }
    let mut cut = MAX_RESPONSE_CHARS;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n[response clipped]");
    text
}

/// Command layout of one CLI tool.
#[derive(Debug, Clone)]
pub struct CliCommandSpec {
    /// Provider ID (e.g. "cli-claude")
    pub id: &'static str,
    /// Binary name on PATH
    pub binary: &'static str,
    /// Arguments that run a one-shot prompt; the prompt itself is appended
    pub prompt_args: &'static [&'static str],
    /// Flag that selects a model, when one is requested
    pub model_flag: &'static str,
    /// Arguments that report authentication state
    pub auth_args: &'static [&'static str],
}

pub const CLAUDE_CLI: CliCommandSpec = CliCommandSpec {
    id: "cli-claude",
    binary: "claude",
    prompt_args: &["-p", "--output-format", "text"],
    model_flag: "--model",
    auth_args: &["auth", "status"],
};

pub const GEMINI_CLI: CliCommandSpec = CliCommandSpec {
    id: "cli-gemini",
    binary: "gemini",
    prompt_args: &["-p"],
    model_flag: "--model",
    auth_args: &["auth", "status"],
};

pub const OPENCODE_CLI: CliCommandSpec = CliCommandSpec {
    id: "cli-opencode",
    binary: "opencode",
    prompt_args: &["run"],
    model_flag: "--model",
    auth_args: &["auth", "list"],
};

/// Adapter that drives one CLI tool as a provider.
pub struct CliProcessAdapter {
    spec: CliCommandSpec,
    workspace_root: PathBuf,
}

impl CliProcessAdapter {
    pub fn new(spec: CliCommandSpec, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            spec,
            workspace_root: workspace_root.into(),
        }
    }

    pub fn claude(workspace_root: impl Into<PathBuf>) -> Self {
        Self::new(CLAUDE_CLI, workspace_root)
    }

    pub fn gemini(workspace_root: impl Into<PathBuf>) -> Self {
        Self::new(GEMINI_CLI, workspace_root)
    }

    pub fn opencode(workspace_root: impl Into<PathBuf>) -> Self {
        Self::new(OPENCODE_CLI, workspace_root)
    }

    async fn run(
        &self,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<(i32, String, String), ProviderError> {
        let mut cmd = Command::new(self.spec.binary);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            ProviderError::transport(format!("failed to spawn {}: {}", self.spec.binary, e))
        })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ProviderError::timeout(timeout))?
            .map_err(|e| ProviderError::transport(format!("{} failed: {}", self.spec.binary, e)))?;

        Ok((
            output.status.code().unwrap_or(-1),
            clean_transcript(&output.stdout),
            clean_transcript(&output.stderr),
        ))
    }
}

/// Whether CLI stdout looks like an error payload rather than a result.
fn stdout_is_error_payload(stdout: &str) -> bool {
    let first_line = stdout.lines().next().unwrap_or("").trim();
    first_line.starts_with("Error:")
        || first_line.starts_with("error:")
        || first_line.contains("\"error\":")
}

fn output_mentions_missing_auth(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("not authenticated")
        || lower.contains("not logged in")
        || lower.contains("please log in")
        || lower.contains("no credentials")
}

#[async_trait]
impl ProviderAdapter for CliProcessAdapter {
    fn id(&self) -> &str {
        self.spec.id
    }

    async fn chat(&self, invocation: ChatInvocation) -> Result<ChatOutcome, ProviderError> {
        // Collapse the conversation into a single prompt; CLI tools take a
        // one-shot instruction, not a message history.
        let prompt = invocation
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let workspace = match &invocation.provider_opts {
            Some(crate::request::ProviderSpecificOpts::Cli {
                workspace: Some(path),
            }) => path.clone(),
            _ => self.workspace_root.clone(),
        };
        let opts = CliExecOptions {
            workspace,
            model: invocation.model.clone(),
            timeout: invocation.timeout,
        };
        let execution = self.execute(&prompt, &opts).await?;

        let metadata = if execution.output_files.is_empty() {
            None
        } else {
            Some(serde_json::json!({
                "output_files": execution.output_files,
                "workspace": execution.workspace,
            }))
        };

        Ok(ChatOutcome {
            content: execution.content,
            model: invocation.model.unwrap_or_else(|| self.spec.id.to_string()),
            usage: TokenUsage::default(),
            used_native_tools: false,
            tool_calls: Vec::new(),
            metadata,
        })
    }

    async fn is_available(&self, _user_id: Option<&str>) -> bool {
        self.is_authenticated().await
    }

    fn supports_probe(&self) -> bool {
        true
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        if self.is_authenticated().await {
            Ok(())
        } else {
            Err(ProviderError::auth(format!(
                "{} is not authenticated",
                self.spec.binary
            )))
        }
    }
}

#[async_trait]
impl CliAdapter for CliProcessAdapter {
    async fn is_authenticated(&self) -> bool {
        let args: Vec<String> = self.spec.auth_args.iter().map(|s| s.to_string()).collect();
        match self
            .run(&args, &self.workspace_root, AUTH_CHECK_TIMEOUT)
            .await
        {
            Ok((code, stdout, stderr)) => {
                code == 0
                    && !output_mentions_missing_auth(&stdout)
                    && !output_mentions_missing_auth(&stderr)
            }
            Err(e) => {
                tracing::debug!(cli = self.spec.id, error = %e, "Auth check failed");
                false
            }
        }
    }

    async fn execute(
        &self,
        prompt: &str,
        opts: &CliExecOptions,
    ) -> Result<CliExecution, ProviderError> {
        let started = Instant::now();
        let before = snapshot_workspace(&opts.workspace);

        let mut args: Vec<String> = self.spec.prompt_args.iter().map(|s| s.to_string()).collect();
        if let Some(model) = &opts.model {
            args.push(self.spec.model_flag.to_string());
            args.push(model.clone());
        }
        args.push(prompt.to_string());

        tracing::info!(
            cli = self.spec.id,
            workspace = %opts.workspace.display(),
            "Executing CLI prompt"
        );

        let (code, stdout, stderr) = self.run(&args, &opts.workspace, opts.timeout).await?;

        if output_mentions_missing_auth(&stdout) || output_mentions_missing_auth(&stderr) {
            return Err(ProviderError::auth(format!(
                "{} is not authenticated",
                self.spec.binary
            )));
        }
        if code != 0 {
            let detail = if stderr.trim().is_empty() { &stdout } else { &stderr };
            return Err(ProviderError::cli_output(format!(
                "{} exited with code {}: {}",
                self.spec.binary,
                code,
                detail.trim()
            )));
        }
        if stdout_is_error_payload(&stdout) {
            return Err(ProviderError::cli_output(stdout.trim().to_string()));
        }

        let after = snapshot_workspace(&opts.workspace);
        let output_files: Vec<PathBuf> = after.difference(&before).cloned().collect();

        Ok(CliExecution {
            content: clip_response(trailing_text(&stdout)),
            output_files,
            workspace: opts.workspace.clone(),
            duration: started.elapsed(),
        })
    }
}
