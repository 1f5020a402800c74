use super::{with_suffix, OutputFile, StageBody, StageBodyError, StageOutput, StagedInput};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Copies the input unchanged into the output directory, renaming it with a
/// suffix. Sidecar content is carried into the output attributes.
#[derive(Debug, Clone)]
pub struct PassthroughStage {
    suffix: String,
}

impl PassthroughStage {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

#[async_trait]
impl StageBody for PassthroughStage {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn process(&self, input: &StagedInput) -> Result<StageOutput, StageBodyError> {
        let file_name = input
            .local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                StageBodyError::InvalidInput(format!(
                    "input path has no usable file name: {}",
                    input.local_path.display()
                ))
            })?;

        let output_name = with_suffix(file_name, &self.suffix);
        let output_path = input.output_dir.join(&output_name);

        let bytes = tokio::fs::copy(&input.local_path, &output_path)
            .await
            .map_err(|e| StageBodyError::Io {
                path: output_path.clone(),
                source: e,
            })?;

        debug!(
            source = %input.source,
            output = %output_path.display(),
            bytes = bytes,
            "Copied object to output"
        );

        let mut output = OutputFile::new(output_path, output_name)
            .with_attribute("size_bytes", bytes);
        if let Some(sidecar) = &input.sidecar {
            output = output.with_attribute("annotation", sidecar.clone());
        }

        let mut result = StageOutput {
            outputs: vec![output],
            ..Default::default()
        };
        result
            .metadata
            .insert("body".to_string(), Value::from(self.name()));
        Ok(result)
    }
}
