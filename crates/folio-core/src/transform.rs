use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::models::{CoreError, CoreErrorKind, FileError};

/// Channel from a running transform back to the worker.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: u8, stage: Option<&str>);

    /// Checked at checkpoints; a cancelled transform should return promptly.
    fn is_cancelled(&self) -> bool;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InputDocument {
    pub filename: String,
    pub path: PathBuf,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransformRequest {
    pub inputs: Vec<InputDocument>,
    pub options: BTreeMap<String, String>,
    /// Scratch directory owned by this job; removed after the job ends.
    pub work_dir: PathBuf,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputDocument {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransformOutput {
    pub documents: Vec<OutputDocument>,
    pub page_count: Option<u32>,
    pub file_errors: Vec<FileError>,
}

/// The document transform a worker runs for each job. Implementations know
/// nothing about sessions, queues or storage layout.
pub trait DocumentTransform: Send + Sync {
    fn transform(
        &self,
        request: &TransformRequest,
        reporter: &dyn ProgressReporter,
    ) -> Result<TransformOutput, CoreError>;
}

/// Copies every readable input to an output of the same name.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughTransform;

impl DocumentTransform for PassthroughTransform {
    fn transform(
        &self,
        request: &TransformRequest,
        reporter: &dyn ProgressReporter,
    ) -> Result<TransformOutput, CoreError> {
        reporter.report(0, Some("reading"));
        let total = request.inputs.len().max(1);
        let mut output = TransformOutput::default();

        for (index, input) in request.inputs.iter().enumerate() {
            if reporter.is_cancelled() {
                return Err(CoreError::new(
                    CoreErrorKind::Cancelled,
                    "transform cancelled before finishing",
                ));
            }
            match fs::read(&input.path) {
                Ok(bytes) => output.documents.push(OutputDocument {
                    filename: input.filename.clone(),
                    bytes,
                }),
                Err(error) => output.file_errors.push(FileError {
                    filename: input.filename.clone(),
                    message: error.to_string(),
                }),
            }
            let progress = ((index + 1) * 95 / total) as u8;
            reporter.report(progress, Some("copying"));
        }

        if output.documents.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::ProcessingFailure,
                "none of the inputs could be read",
            ));
        }
        output.page_count = u32::try_from(output.documents.len()).ok();
        Ok(output)
    }
}
