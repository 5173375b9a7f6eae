//! Frame serialization to storage

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::capture::FrameTask;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Persists one frame to `path`
#[cfg_attr(test, mockall::automock)]
pub trait FrameWriter: Send {
    fn save(&mut self, frame: &FrameTask, path: &Path) -> Result<(), WriteError>;
}

/// Writes the payload bytes untouched, creating directories as needed
#[derive(Debug, Default, Clone, Copy)]
pub struct RawFileWriter;

impl FrameWriter for RawFileWriter {
    fn save(&mut self, frame: &FrameTask, path: &Path) -> Result<(), WriteError> {
        let io_err = |source| WriteError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(path, &frame.data).map_err(io_err)
    }
}
