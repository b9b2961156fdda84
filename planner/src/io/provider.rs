//! Oracle capability and the CLI-agent adapter.
//!
//! The [`Provider`] trait decouples orchestration from the actual model
//! backend. [`CommandProvider`] pipes a rendered prompt into an agent CLI and
//! decodes its stdout tolerantly. Tests use scripted providers that answer
//! from fixtures without spawning processes.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::response::{parse_compile_response, parse_generate_response};
use crate::core::types::{CompileRequest, CompileResponse, GenerateRequest, GenerateResponse};
use crate::error::ProviderError;
use crate::io::config::ProviderConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::{render_compile_prompt, render_generate_prompt};

const PING_PROMPT: &str = "Reply with the single word OK.";
const STDERR_TAIL_BYTES: usize = 2000;

/// Abstraction over oracle backends.
///
/// Implementations may be called concurrently from many branches of the
/// compilation and must not hold locks across their own suspension points.
pub trait Provider {
    /// Decompose one node into proposed children and declarations.
    fn compile(
        &self,
        request: &CompileRequest,
    ) -> impl Future<Output = Result<CompileResponse, ProviderError>>;

    /// Produce the files of one leaf.
    fn generate(
        &self,
        request: &GenerateRequest,
    ) -> impl Future<Output = Result<GenerateResponse, ProviderError>>;

    /// Cheap round trip to confirm the backend is reachable.
    fn test_connection(&self) -> impl Future<Output = Result<(), ProviderError>>;
}

/// Provider that shells out to an agent CLI (prompt on stdin, answer on stdout).
#[derive(Debug, Clone)]
pub struct CommandProvider {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandProvider {
    pub fn new(config: &ProviderConfig, workdir: &Path) -> Self {
        Self {
            command: config.command.clone(),
            workdir: workdir.to_path_buf(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    #[instrument(skip_all, fields(program = %self.command.first().map_or("", String::as_str)))]
    async fn invoke(&self, prompt: String) -> Result<String, ProviderError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(ProviderError::Call("provider command is empty".to_string()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);
        let timeout = self.timeout;
        let limit = self.output_limit_bytes;

        debug!(prompt_bytes = prompt.len(), "invoking provider");
        let output = tokio::task::spawn_blocking(move || {
            run_command_with_timeout(cmd, Some(prompt.as_bytes()), timeout, limit)
        })
        .await
        .map_err(|err| ProviderError::Call(format!("provider task failed: {err}")))?
        .map_err(|err| ProviderError::Call(format!("{err:#}")))?;

        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "provider timed out");
            return Err(ProviderError::Call(format!(
                "provider timed out after {timeout:?}"
            )));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "provider failed");
            return Err(ProviderError::Call(format!(
                "provider exited with status {:?}: {}",
                output.status.code(),
                output.stderr_tail(STDERR_TAIL_BYTES)
            )));
        }
        Ok(output.stdout_lossy())
    }
}

impl Provider for CommandProvider {
    async fn compile(&self, request: &CompileRequest) -> Result<CompileResponse, ProviderError> {
        let prompt = render_compile_prompt(request)
            .map_err(|err| ProviderError::Call(format!("{err:#}")))?;
        let text = self.invoke(prompt).await?;
        Ok(parse_compile_response(&text)?)
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        let prompt = render_generate_prompt(request)
            .map_err(|err| ProviderError::Call(format!("{err:#}")))?;
        let text = self.invoke(prompt).await?;
        Ok(parse_generate_response(&text)?)
    }

    async fn test_connection(&self) -> Result<(), ProviderError> {
        let reply = self.invoke(PING_PROMPT.to_string()).await?;
        if reply.trim().is_empty() {
            return Err(ProviderError::Call("provider returned no output".to_string()));
        }
        info!("provider reachable");
        Ok(())
    }
}
