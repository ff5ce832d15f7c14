//! Part file writer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use sluice_common::utils::error::{Error, Result};
use sluice_core::shuffle::PairWriter;

use super::{FORMAT_VERSION, MAGIC};

/// Appends checksummed frames to one part file.
pub struct DatasetWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    frames: u64,
}

impl DatasetWriter {
    /// Creates (or truncates) the part file at `path` and writes its header.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(MAGIC)?;
        writer.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        Ok(Self {
            path,
            writer: Some(writer),
            frames: 0,
        })
    }

    /// Returns the number of frames written.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Returns the part file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and syncs the file. Returns the number of frames written.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or sync fails.
    pub fn finish(mut self) -> Result<u64> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(self.frames)
    }
}

impl PairWriter for DatasetWriter {
    fn write_pair(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Internal("dataset writer already finished".to_string()))?;
        let key_len = u32::try_from(key.len())
            .map_err(|_| Error::Internal(format!("key of {} bytes is too large", key.len())))?;
        let value_len = u32::try_from(value.len())
            .map_err(|_| Error::Internal(format!("value of {} bytes is too large", value.len())))?;

        writer.write_u32::<LittleEndian>(key_len)?;
        writer.write_u32::<LittleEndian>(value_len)?;
        writer.write_all(key)?;
        writer.write_all(value)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(key);
        hasher.update(value);
        writer.write_u32::<LittleEndian>(hasher.finalize())?;

        self.frames += 1;
        Ok(())
    }
}
