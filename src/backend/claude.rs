use async_trait::async_trait;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::stream::StreamCollector;
use super::{GenerationBackend, GenerationOutput, GenerationRequest};
use crate::config::BackendSection;
use crate::errors::PipelineError;

/// Read a child's stderr to the end. A read error is logged and ends the
/// capture with whatever came before it.
pub(crate) async fn drain_stderr<R: AsyncRead + Unpin>(stderr: R) -> String {
    let mut text = String::new();
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                text.push_str(&line);
                text.push('\n');
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read backend stderr");
                break;
            }
        }
    }
    text
}

/// Runs prompts through the Claude CLI in `--print` / stream-json mode.
pub struct ClaudeCliBackend {
    claude_cmd: String,
    skip_permissions: bool,
}

impl ClaudeCliBackend {
    pub fn new(config: &BackendSection) -> Self {
        Self {
            claude_cmd: config.claude_cmd.clone(),
            skip_permissions: config.skip_permissions,
        }
    }

    pub fn flags(&self, model: &str) -> Vec<String> {
        let mut flags = Vec::new();
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        if !model.is_empty() {
            flags.push("--model".to_string());
            flags.push(model.to_string());
        }
        flags
    }

    async fn run_claude(&self, request: &GenerationRequest) -> Result<String, PipelineError> {
        let flags = self.flags(&request.selector.model);
        debug!(cmd = %self.claude_cmd, ?flags, "spawning generation backend");

        let mut child = Command::new(&self.claude_cmd)
            .args(&flags)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .current_dir(&request.cwd)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::SpawnFailed {
                command: self.claude_cmd.clone(),
                source,
            })?;

        // Prompt goes in via stdin, then stdin is closed.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| PipelineError::Other(e.into()))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| PipelineError::Other(e.into()))?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Reported("backend stdout unavailable".to_string()))?;
        // Drained alongside stdout so a chatty stderr cannot fill its pipe.
        let stderr_task = child.stderr.take().map(|e| tokio::spawn(drain_stderr(e)));
        let mut reader = BufReader::new(stdout).lines();
        let mut collector = StreamCollector::new();

        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|e| PipelineError::Other(e.into()))?
        {
            collector.push_line(&line);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| PipelineError::Other(e.into()))?;
        let exit_code = status.code().unwrap_or(-1);
        let err_text = match stderr_task {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!(error = %e, "backend stderr reader failed");
                String::new()
            }),
            None => String::new(),
        };

        if exit_code != 0 {
            return Err(PipelineError::NonZeroExit {
                exit_code,
                stderr: err_text.trim().to_string(),
            });
        }
        if collector.is_error() {
            let text = collector.finish();
            return Err(PipelineError::Reported(text));
        }
        if !err_text.trim().is_empty() {
            debug!(stderr = %err_text.trim(), "generation backend wrote to stderr");
        }
        debug!(tool_uses = collector.tool_uses(), "generation stream finished");
        Ok(collector.finish())
    }
}

#[async_trait]
impl GenerationBackend for ClaudeCliBackend {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, PipelineError> {
        if request.selector.provider != "claude" {
            return Err(PipelineError::UnsupportedProvider(
                request.selector.provider.clone(),
            ));
        }

        let start = Instant::now();
        let text = match tokio::time::timeout(request.timeout, self.run_claude(request)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(secs = request.timeout.as_secs(), "generation backend timed out");
                return Err(PipelineError::Timeout {
                    secs: request.timeout.as_secs(),
                });
            }
        };

        if let Some(parent) = request.output_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PipelineError::OutputWriteFailed {
                path: request.output_path.clone(),
                source,
            })?;
        }
        std::fs::write(&request.output_path, &text).map_err(|source| {
            PipelineError::OutputWriteFailed {
                path: request.output_path.clone(),
                source,
            }
        })?;

        let duration = start.elapsed();
        info!(
            selector = %request.selector,
            chars = text.len(),
            secs = duration.as_secs_f64(),
            "generation finished"
        );
        Ok(GenerationOutput {
            text,
            output_path: request.output_path.clone(),
            duration,
        })
    }
}
