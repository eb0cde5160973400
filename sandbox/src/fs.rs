use std::fs;
use std::path::{Path, PathBuf};

use tracing::instrument;

use crate::errors::Result;
use crate::path::SandboxRoot;

#[derive(Clone, Debug)]
pub struct SandboxFs {
    root: SandboxRoot,
}

#[derive(Debug, PartialEq, Eq)]
pub struct WriteReport {
    pub path: PathBuf,
    pub bytes_written: usize,
}

impl SandboxFs {
    pub fn new(root: SandboxRoot) -> Self {
        Self { root }
    }

    pub fn base_dir(&self) -> &Path {
        self.root.as_path()
    }

    /// Overwrites `relative` with `bytes`, creating missing parent directories.
    #[instrument(skip(self, relative, bytes), fields(path = %relative.as_ref().display(), size = bytes.as_ref().len()))]
    pub fn write(&self, relative: impl AsRef<Path>, bytes: impl AsRef<[u8]>) -> Result<WriteReport> {
        let path = self.root.resolve(relative)?;
        let data = bytes.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        Ok(WriteReport {
            path,
            bytes_written: data.len(),
        })
    }

    /// Truncates an existing file to zero length. Returns false when it does not exist.
    #[instrument(skip(self))]
    pub fn clear(&self, relative: impl AsRef<Path> + std::fmt::Debug) -> Result<bool> {
        let path = self.root.resolve(relative)?;
        if !path.is_file() {
            return Ok(false);
        }
        fs::write(path, b"")?;
        Ok(true)
    }
}
