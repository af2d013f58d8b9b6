//! Model file sanity check run before any load attempt

use crate::error::EngineError;
use std::path::Path;
use tracing::{debug, error};

/// Size in bytes of a file that exists and is large enough to be a model
pub fn validate_model_file(path: &Path, min_bytes: u64) -> Result<u64, EngineError> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        _ => {
            error!("Model file not found: {}", path.display());
            return Err(EngineError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
    };

    let size = metadata.len();
    if size < min_bytes {
        error!(size, minimum = min_bytes, "Model file too small: {}", path.display());
        return Err(EngineError::FileImplausiblySmall {
            path: path.to_path_buf(),
            size,
            minimum: min_bytes,
        });
    }

    debug!(size, "Model file size OK: {}", path.display());
    Ok(size)
}
