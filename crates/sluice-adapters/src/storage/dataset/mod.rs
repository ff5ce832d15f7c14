//! Intermediate datasets.
//!
//! A dataset is the durable output of a non-terminal stage: a directory
//! holding one part file per producing task. Each part file is a header
//! followed by checksummed frames, one per (key, value) pair:
//!
//! ```text
//! header: "SLDS" | u32 version
//! frame:  u32 key_len | u32 value_len | key | value | u32 crc32(key ++ value)
//! ```
//!
//! All integers are little-endian.

mod reader;
mod writer;

pub use reader::{DatasetReader, PartSummary, inspect_part};
pub use writer::DatasetWriter;

use std::fs;
use std::path::{Path, PathBuf};

use sluice_common::utils::error::Result;
use tracing::debug;

/// Magic bytes at the start of every part file.
pub const MAGIC: &[u8; 4] = b"SLDS";

/// Format version written after the magic bytes.
pub const FORMAT_VERSION: u32 = 1;

/// Extension of part files.
pub const PART_EXTENSION: &str = "part";

/// Name of the dataset produced by stage `seq` of job `job`.
#[must_use]
pub fn temp_dataset_name(job: &str, seq: usize) -> String {
    format!("{job}_temp_{seq}")
}

/// Root directory under which datasets are stored.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    /// Creates a store rooted at `root`. The directory is created on first
    /// write.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory of dataset `name`.
    #[must_use]
    pub fn dataset_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Returns true if dataset `name` has been written.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.dataset_dir(name).is_dir()
    }

    /// Removes dataset `name` if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    pub fn delete(&self, name: &str) -> Result<()> {
        let dir = self.dataset_dir(name);
        if dir.exists() {
            debug!("deleting existing dataset {}", dir.display());
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Prepares dataset `name` for writing, clearing it first if
    /// `delete_existing` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be cleared or created.
    pub fn prepare(&self, name: &str, delete_existing: bool) -> Result<()> {
        if delete_existing {
            self.delete(name)?;
        }
        fs::create_dir_all(self.dataset_dir(name))?;
        Ok(())
    }

    /// Creates part file `part` of dataset `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create_part(&self, name: &str, part: usize) -> Result<DatasetWriter> {
        let dir = self.dataset_dir(name);
        fs::create_dir_all(&dir)?;
        DatasetWriter::create(dir.join(format!("{part:05}.{PART_EXTENSION}")))
    }

    /// Lists the part files of dataset `name` in part order.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset directory cannot be read.
    pub fn parts(&self, name: &str) -> Result<Vec<PathBuf>> {
        list_parts(&self.dataset_dir(name))
    }
}

/// Lists the part files in `dir`, sorted by name.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn list_parts(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut parts = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == PART_EXTENSION) {
            parts.push(path);
        }
    }
    parts.sort();
    Ok(parts)
}
