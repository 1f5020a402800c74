use super::{OutputFile, StageBody, StageBodyError, StageOutput, StagedInput};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Longest stderr excerpt carried into an error message.
const STDERR_EXCERPT_LEN: usize = 512;

/// Runs an external program once per object.
///
/// The program is invoked as `program [args..] <input-path> <output-dir>` with
/// `STAGE_INPUT`, `STAGE_OUTPUT_DIR`, `STAGE_WORK_DIR` and `STAGE_SOURCE_URI`
/// in its environment. When a sidecar is present it is written to
/// `<work-dir>/sidecar.json` and exposed as `STAGE_SIDECAR`. Every regular file
/// left in the output directory becomes an output.
#[derive(Debug, Clone)]
pub struct CommandStage {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandStage {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn write_sidecar(&self, input: &StagedInput) -> Result<Option<PathBuf>, StageBodyError> {
        let Some(sidecar) = &input.sidecar else {
            return Ok(None);
        };
        let path = input.work_dir.join("sidecar.json");
        let body = serde_json::to_vec(sidecar)
            .map_err(|e| StageBodyError::InvalidInput(format!("sidecar not serializable: {e}")))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| StageBodyError::Io {
                path: path.clone(),
                source: e,
            })?;
        Ok(Some(path))
    }

    async fn collect_outputs(&self, input: &StagedInput) -> Result<Vec<OutputFile>, StageBodyError> {
        let io_err = |e| StageBodyError::Io {
            path: input.output_dir.clone(),
            source: e,
        };

        let mut entries = tokio::fs::read_dir(&input.output_dir).await.map_err(io_err)?;
        let mut outputs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let file_type = entry.file_type().await.map_err(io_err)?;
            if !file_type.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!(path = %entry.path().display(), "Skipping output with non UTF-8 name");
                continue;
            };
            let size = entry.metadata().await.map_err(io_err)?.len();
            outputs.push(OutputFile::new(entry.path(), name).with_attribute("size_bytes", size));
        }

        outputs.sort_by(|a, b| a.relative_key.cmp(&b.relative_key));
        Ok(outputs)
    }
}

#[async_trait]
impl StageBody for CommandStage {
    fn name(&self) -> &str {
        &self.program
    }

    async fn process(&self, input: &StagedInput) -> Result<StageOutput, StageBodyError> {
        let sidecar_path = self.write_sidecar(input).await?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&input.local_path)
            .arg(&input.output_dir)
            .env("STAGE_INPUT", &input.local_path)
            .env("STAGE_OUTPUT_DIR", &input.output_dir)
            .env("STAGE_WORK_DIR", &input.work_dir)
            .env("STAGE_SOURCE_URI", input.source.uri())
            .current_dir(&input.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = &sidecar_path {
            command.env("STAGE_SIDECAR", path);
        }

        let started = Instant::now();
        let child = command.spawn().map_err(|e| {
            StageBodyError::Failed(format!("failed to start {}: {e}", self.program))
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                StageBodyError::Failed(format!("failed waiting for {}: {e}", self.program))
            })?,
            // Dropping the future kills the child.
            Err(_) => return Err(StageBodyError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT_LEN).collect();
            return Err(StageBodyError::Failed(format!(
                "{} exited with {}: {}",
                self.program, output.status, excerpt
            )));
        }

        let outputs = self.collect_outputs(input).await?;
        let elapsed = started.elapsed();
        debug!(
            program = %self.program,
            source = %input.source,
            outputs = outputs.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Command completed"
        );

        let mut result = StageOutput {
            outputs,
            ..Default::default()
        };
        result
            .metadata
            .insert("body".to_string(), Value::from(self.program.clone()));
        result.metadata.insert(
            "command_seconds".to_string(),
            Value::from(elapsed.as_secs_f64()),
        );
        Ok(result)
    }
}
