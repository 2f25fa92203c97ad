//! Document to PDF conversion through the unoconv engine client.

use crate::error::ConversionError;
use crate::job::ConversionJob;
use async_trait::async_trait;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{error, info};

/// Engine output that marks a source the engine cannot interpret.
const UNSUPPORTED_MARKER: &str = "could not be opened";

/// Converts one job's source document into a PDF at its destination.
///
/// Implementations must only leave a file at `dest_path` when they return
/// `Ok`.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(&self, job: &ConversionJob) -> Result<(), ConversionError>;
}

/// Runs a converter on its own task so that a panic surfaces as a transient
/// [`ConversionError::EngineFailure`] instead of taking the queue down.
pub async fn execute_isolated(
    converter: Arc<dyn DocumentConverter>,
    job: ConversionJob,
) -> Result<(), ConversionError> {
    let job_id = job.job_id.clone();
    let attempt = tokio::spawn(async move { converter.convert(&job).await });

    match attempt.await {
        Ok(result) => result,
        Err(e) => {
            error!(job_id = %job_id, "Converter crashed: {}", e);
            Err(ConversionError::EngineFailure(format!("converter crashed: {e}")))
        }
    }
}

/// Builds a process from a whitespace-split engine command such as
/// `["python3", "/usr/bin/unoconv"]`.
pub(crate) fn engine_command(parts: &[String]) -> Option<Command> {
    let (program, args) = parts.split_first()?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Some(cmd)
}

/// Client for a running `unoconv --listener`.
///
/// Every conversion is issued with `--no-launch`, so a dead listener fails
/// fast instead of having unoconv start a private office instance.
pub struct UnoconvConverter {
    command: Vec<String>,
    port: u16,
    timeout: Option<Duration>,
}

impl UnoconvConverter {
    pub fn new(command: Vec<String>, port: u16) -> Self {
        Self {
            command,
            port,
            timeout: None,
        }
    }

    /// Kills the engine client if a single attempt runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl DocumentConverter for UnoconvConverter {
    async fn convert(&self, job: &ConversionJob) -> Result<(), ConversionError> {
        info!(
            job_id = %job.job_id,
            source = %job.source_path.display(),
            "Converting document to PDF"
        );

        let mut cmd = engine_command(&self.command)
            .ok_or_else(|| ConversionError::EngineFailure("engine command is empty".to_string()))?;
        cmd.arg("--no-launch")
            .arg(format!("--port={}", self.port))
            .args(["-f", "pdf", "--stdout"])
            .arg(&job.source_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            ConversionError::EngineFailure(format!("failed to spawn engine client: {e}"))
        })?;

        let waited = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, waited).await.map_err(|_| {
                ConversionError::EngineFailure(format!("conversion timed out after {limit:?}"))
            })?,
            None => waited.await,
        }
        .map_err(|e| {
            ConversionError::EngineFailure(format!("I/O error waiting for engine client: {e}"))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                job_id = %job.job_id,
                status = %output.status,
                "Engine failed to convert {}: {}",
                job.source_path.display(),
                stderr.trim()
            );
            return Err(classify_failure(&job.source_path, &stderr));
        }

        if output.stdout.is_empty() {
            return Err(ConversionError::EngineFailure(
                "engine returned an empty document".to_string(),
            ));
        }

        let bytes = output.stdout.len();
        write_output(job.dest_path.clone(), output.stdout).await?;

        info!(job_id = %job.job_id, bytes, "PDF conversion complete");
        Ok(())
    }
}

/// Maps engine client error output onto the retry taxonomy.
pub fn classify_failure(source: &Path, stderr: &str) -> ConversionError {
    let detail = stderr.trim();
    if detail.contains(UNSUPPORTED_MARKER) {
        ConversionError::UnsupportedFormat {
            path: source.to_path_buf(),
            detail: detail.to_string(),
        }
    } else if detail.is_empty() {
        ConversionError::EngineFailure("engine client exited abnormally".to_string())
    } else {
        ConversionError::EngineFailure(detail.to_string())
    }
}

async fn write_output(dest: PathBuf, pdf: Vec<u8>) -> Result<(), ConversionError> {
    let shown = dest.display().to_string();
    tokio::task::spawn_blocking(move || persist_pdf(&dest, &pdf))
        .await
        .map_err(|e| ConversionError::EngineFailure(format!("output writer crashed: {e}")))?
        .map_err(|e| ConversionError::EngineFailure(format!("failed to write PDF to {shown}: {e}")))
}

/// Stages the PDF next to `dest` and renames it into place, so a failed
/// write never leaves a truncated destination behind.
fn persist_pdf(dest: &Path, pdf: &[u8]) -> io::Result<()> {
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(pdf)?;
    staged.as_file().sync_all()?;
    staged.persist(dest).map_err(|e| e.error)?;
    Ok(())
}
