use lookout_core::PortError;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<ModelError> for PortError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::ModelNotFound(path) => {
                PortError::ModelUnavailable(format!("model file not found: {path}"))
            }
            other => PortError::InferenceFailed(other.to_string()),
        }
    }
}

/// Build an ONNX Runtime session for `path`.
pub(crate) fn load_session(path: &Path, kind: &str) -> Result<ort::session::Session, ModelError> {
    if !path.exists() {
        return Err(ModelError::ModelNotFound(path.display().to_string()));
    }

    let session = ort::session::Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;

    tracing::info!(
        path = %path.display(),
        model = kind,
        inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "model loaded"
    );
    Ok(session)
}
