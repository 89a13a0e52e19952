//! Collaborators backed by external programs.
//!
//! The evaluation library and the dataset opener live outside this crate.
//! Both are driven as subprocesses speaking JSON: the request goes to stdin,
//! the answer comes back on stdout.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::domain::{
    Case, DatasetDescriptor, EvaluationError, EvaluationSpec, MetricSample, SourceOpenError,
};
use crate::source::{open_error, DatasetOpener, OpenedSource, Source};
use crate::worker::EvaluationLibrary;

/// An external program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-call timeout. `0` disables it.
    #[serde(default)]
    pub timeout_secs: u64,
}

#[derive(Debug)]
struct CommandOutput {
    success: bool,
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: String,
}

#[derive(Debug)]
enum CommandFailure {
    Io(std::io::Error),
    TimedOut(u64),
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
            Self::TimedOut(secs) => write!(f, "timed out after {secs}s"),
        }
    }
}

impl From<std::io::Error> for CommandFailure {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

async fn run_command(config: &CommandConfig, input: &[u8]) -> Result<CommandOutput, CommandFailure> {
    let mut child = Command::new(&config.program)
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        // A child that exits without reading its input is not an error here;
        // its exit status decides.
        match stdin.write_all(input).await {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
            _ => {}
        }
    }

    let output = if config.timeout_secs > 0 {
        tokio::time::timeout(
            Duration::from_secs(config.timeout_secs),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| CommandFailure::TimedOut(config.timeout_secs))??
    } else {
        child.wait_with_output().await?
    };

    Ok(CommandOutput {
        success: output.status.success(),
        exit_code: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Request body sent to the evaluator on stdin.
#[derive(Debug, Serialize)]
struct EvaluationRequest<'a> {
    case: &'a Case,
    evaluation: &'a EvaluationSpec,
    source: &'a DatasetDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a serde_json::Value>,
}

/// Evaluation library driven as one subprocess per case.
///
/// The program must print a JSON array of `{metric, lead_time, value}`
/// objects. An empty array means the source has no data for the case.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    command: CommandConfig,
}

impl CommandEvaluator {
    pub fn new(command: CommandConfig) -> Self {
        Self { command }
    }
}

#[async_trait]
impl EvaluationLibrary for CommandEvaluator {
    async fn run_pipeline(
        &self,
        case: &Case,
        spec: &EvaluationSpec,
        source: &dyn Source,
    ) -> Result<Vec<MetricSample>, EvaluationError> {
        let request = EvaluationRequest {
            case,
            evaluation: spec,
            source: source.descriptor(),
            session: source.session(),
        };
        let input =
            serde_json::to_vec(&request).map_err(|e| EvaluationError::Library(e.to_string()))?;

        let output = run_command(&self.command, &input).await.map_err(|e| match e {
            CommandFailure::TimedOut(secs) => EvaluationError::Timeout(secs),
            CommandFailure::Io(e) => {
                EvaluationError::Library(format!("failed to run {}: {e}", self.command.program))
            }
        })?;

        if !output.success {
            return Err(EvaluationError::Library(format!(
                "{} exited with {}: {}",
                self.command.program, output.exit_code, output.stderr
            )));
        }
        serde_json::from_slice(&quote_non_finite(&output.stdout))
            .map_err(|e| EvaluationError::MalformedOutput(e.to_string()))
    }
}

/// Python's `json.dumps` writes NaN and infinities as the bare tokens
/// `NaN`, `Infinity` and `-Infinity`, which strict JSON rejects. Quote them
/// so they reach the metric value parser as strings. Text inside string
/// literals is left alone.
fn quote_non_finite(raw: &[u8]) -> Vec<u8> {
    const TOKENS: [&[u8]; 3] = [b"-Infinity", b"Infinity", b"NaN"];

    let mut out = Vec::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < raw.len() {
        let byte = raw[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
        } else if byte == b'"' {
            in_string = true;
        } else if let Some(token) = TOKENS.iter().find(|t| raw[i..].starts_with(t)) {
            out.push(b'"');
            out.extend_from_slice(token);
            out.push(b'"');
            i += token.len();
            continue;
        }
        out.push(byte);
        i += 1;
    }
    out
}

/// Dataset opener that checks credentials and optionally runs a handshake
/// program.
///
/// The handshake receives the descriptor as JSON on stdin. Exit status 0
/// means the dataset is reachable; any JSON it prints becomes the source
/// session.
#[derive(Debug, Clone, Default)]
pub struct CommandOpener {
    handshake: Option<CommandConfig>,
}

impl CommandOpener {
    pub fn new(handshake: Option<CommandConfig>) -> Self {
        Self { handshake }
    }
}

#[async_trait]
impl DatasetOpener for CommandOpener {
    async fn open(&self, descriptor: &DatasetDescriptor) -> Result<Arc<dyn Source>, SourceOpenError> {
        descriptor
            .credentials_ref
            .verify(&descriptor.model_name)
            .map_err(|e| open_error(descriptor, e.to_string()))?;

        let Some(handshake) = &self.handshake else {
            return Ok(Arc::new(OpenedSource::new(descriptor.clone(), None)));
        };

        let input = serde_json::to_vec(descriptor).map_err(|e| open_error(descriptor, e.to_string()))?;
        let output = run_command(handshake, &input)
            .await
            .map_err(|e| open_error(descriptor, format!("handshake {}: {e}", handshake.program)))?;
        if !output.success {
            return Err(open_error(
                descriptor,
                format!("handshake exited with {}: {}", output.exit_code, output.stderr),
            ));
        }

        let session = if output.stdout.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(
                serde_json::from_slice(&output.stdout)
                    .map_err(|e| open_error(descriptor, format!("handshake output: {e}")))?,
            )
        };
        debug!(location = %descriptor.storage_location, "handshake succeeded");
        Ok(Arc::new(OpenedSource::new(descriptor.clone(), session)))
    }
}
