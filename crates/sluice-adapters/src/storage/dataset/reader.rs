//! Part file reader.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use sluice_common::utils::error::{CodecError, Error, Result};
use sluice_core::shuffle::{PairReader, ShufflePair};

use super::{FORMAT_VERSION, MAGIC};

/// Reads and verifies the frames of one part file.
pub struct DatasetReader {
    path: PathBuf,
    reader: BufReader<File>,
    frames: u64,
}

impl DatasetReader {
    /// Opens the part file at `path` and checks its header.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened, or a corruption
    /// error if the header is wrong.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = BufReader::new(File::open(&path)?);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|_| corrupt(&path, "missing header"))?;
        if &magic != MAGIC {
            return Err(corrupt(&path, "bad magic bytes"));
        }
        let version = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| corrupt(&path, "missing header"))?;
        if version != FORMAT_VERSION {
            return Err(corrupt(&path, &format!("unsupported format version {version}")));
        }

        Ok(Self {
            path,
            reader,
            frames: 0,
        })
    }

    /// Returns the number of frames read so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn read_frame(&mut self) -> Result<Option<ShufflePair>> {
        let key_len = match self.reader.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let truncated = |path: &Path| corrupt(path, "truncated frame");
        let value_len = self
            .reader
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated(&self.path))? as usize;

        let mut data = vec![0u8; key_len + value_len];
        self.reader
            .read_exact(&mut data)
            .map_err(|_| truncated(&self.path))?;
        let stored = self
            .reader
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated(&self.path))?;
        if stored != crc32fast::hash(&data) {
            return Err(corrupt(
                &self.path,
                &format!("checksum mismatch in frame {}", self.frames),
            ));
        }

        self.frames += 1;
        let mut key = Bytes::from(data);
        let value = key.split_off(key_len);
        Ok(Some(ShufflePair { key, value }))
    }
}

impl PairReader for DatasetReader {
    fn next_pair(&mut self) -> Result<Option<ShufflePair>> {
        self.read_frame()
    }
}

fn corrupt(path: &Path, message: &str) -> Error {
    CodecError::Corrupt(format!("{}: {message}", path.display())).into()
}

/// Frame counts and sizes of one part file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSummary {
    /// Part file path.
    pub path: PathBuf,
    /// Number of frames.
    pub frames: u64,
    /// Total key bytes.
    pub key_bytes: u64,
    /// Total value bytes.
    pub value_bytes: u64,
    /// File size.
    pub file_bytes: u64,
}

/// Reads every frame of a part file, verifying checksums.
///
/// # Errors
///
/// Returns the first I/O or corruption error.
pub fn inspect_part(path: impl AsRef<Path>) -> Result<PartSummary> {
    let path = path.as_ref();
    let mut reader = DatasetReader::open(path)?;
    let mut summary = PartSummary {
        path: path.to_path_buf(),
        frames: 0,
        key_bytes: 0,
        value_bytes: 0,
        file_bytes: std::fs::metadata(path)?.len(),
    };
    while let Some(pair) = reader.next_pair()? {
        summary.frames += 1;
        summary.key_bytes += pair.key.len() as u64;
        summary.value_bytes += pair.value.len() as u64;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dataset::DatasetWriter;
    use sluice_core::shuffle::PairWriter;
    use tempfile::tempdir;

    fn write(path: &Path, pairs: &[(&[u8], &[u8])]) {
        let mut writer = DatasetWriter::create(path).unwrap();
        for (k, v) in pairs {
            writer.write_pair(k, v).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00000.part");
        write(&path, &[(b"k1", b"v1"), (b"", b"empty-key")]);

        let mut reader = DatasetReader::open(&path).unwrap();
        let first = reader.next_pair().unwrap().unwrap();
        assert_eq!((first.key.as_ref(), first.value.as_ref()), (&b"k1"[..], &b"v1"[..]));
        let second = reader.next_pair().unwrap().unwrap();
        assert!(second.key.is_empty());
        assert!(reader.next_pair().unwrap().is_none());
        assert_eq!(reader.frames(), 2);

        let summary = inspect_part(&path).unwrap();
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.key_bytes, 2);
        assert_eq!(summary.value_bytes, 11);
    }

    #[test]
    fn test_corrupted_frame_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00000.part");
        write(&path, &[(b"key", b"value")]);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[18] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = DatasetReader::open(&path).unwrap();
        let err = reader.next_pair().unwrap_err();
        assert!(matches!(err, Error::Codec(CodecError::Corrupt(_))));
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_bad_header_and_truncation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.part");
        std::fs::write(&path, b"NOPE\x01\x00\x00\x00").unwrap();
        assert!(DatasetReader::open(&path).is_err());

        write(&path, &[(b"key", b"value")]);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();
        let mut reader = DatasetReader::open(&path).unwrap();
        assert!(reader.next_pair().is_err());
    }
}
