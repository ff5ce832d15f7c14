//! Delimited text collection.
//!
//! One record per line, fields separated by a single-byte delimiter, no
//! quoting. An empty field reads as null.
//!
//! Splits are byte ranges of the file. A split reads every line that
//! *starts* inside its range, so lines crossing a split boundary are read
//! exactly once.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use sluice_common::types::{LogicalType, Record, Value};
use sluice_common::utils::error::{Error, Result};
use sluice_core::execution::source::{
    FieldDef, RecordSource, RecordStream, ScanPredicate, ScanRequest, SourceSplit, bind_request,
};

use super::project;

/// A delimited text file.
#[derive(Debug, Clone)]
pub struct DelimitedSource {
    name: String,
    path: PathBuf,
    fields: Vec<FieldDef>,
    delimiter: u8,
    has_header: bool,
}

impl DelimitedSource {
    /// Creates a collection over the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns a source error if a field has a list type.
    pub fn new(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        fields: Vec<FieldDef>,
        delimiter: u8,
        has_header: bool,
    ) -> Result<Self> {
        let name = name.into();
        if let Some(field) = fields.iter().find(|f| !f.ty.is_atomic()) {
            return Err(Error::Source(format!(
                "field {} of {name} has type {}; delimited files hold atomic fields only",
                field.name, field.ty
            )));
        }
        Ok(Self {
            name,
            path: path.as_ref().to_path_buf(),
            fields,
            delimiter,
            has_header,
        })
    }
}

impl RecordSource for DelimitedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    fn splits(&self, hint: usize) -> Result<Vec<SourceSplit>> {
        let len = std::fs::metadata(&self.path)?.len();
        Ok(super::memory::range_splits(&self.name, len, hint))
    }

    fn open(&self, split: &SourceSplit, request: &ScanRequest) -> Result<RecordStream> {
        let (projection, predicates) = bind_request(&self.name, &self.fields, request)?;
        let predicates = predicates.into_iter().map(|(i, p)| (i, p.clone())).collect();

        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut pos = split.start;
        if pos > 0 {
            // Skip the tail of a line owned by the previous split.
            reader.seek(SeekFrom::Start(pos - 1))?;
            let mut skipped = Vec::new();
            pos = pos - 1 + reader.read_until(b'\n', &mut skipped)? as u64;
        }
        let mut lines = LineReader {
            reader,
            pos,
            end: split.end,
            line: 0,
            source: self.name.clone(),
            fields: self.fields.clone(),
            delimiter: self.delimiter,
            projection,
            predicates,
        };
        if self.has_header && split.start == 0 {
            lines.read_line()?;
        }
        Ok(Box::new(lines))
    }
}

struct LineReader {
    reader: BufReader<File>,
    pos: u64,
    end: u64,
    line: usize,
    source: String,
    fields: Vec<FieldDef>,
    delimiter: u8,
    projection: Vec<usize>,
    predicates: Vec<(usize, ScanPredicate)>,
}

impl LineReader {
    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        if self.pos >= self.end {
            return Ok(None);
        }
        let mut buf = Vec::new();
        let read = self.reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            return Ok(None);
        }
        self.pos += read as u64;
        self.line += 1;
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(Some(buf))
    }

    fn parse(&self, line: &[u8]) -> Result<Record> {
        let text = std::str::from_utf8(line)
            .map_err(|e| Error::Source(format!("{}: invalid UTF-8: {e}", self.source)))?;
        let raw: Vec<&str> = text.split(char::from(self.delimiter)).collect();
        if raw.len() != self.fields.len() {
            return Err(Error::Source(format!(
                "{}: line has {} fields, expected {}",
                self.source,
                raw.len(),
                self.fields.len()
            )));
        }
        let values = raw
            .iter()
            .zip(&self.fields)
            .map(|(text, field)| parse_field(text, field))
            .collect::<Result<Vec<_>>>()?;
        Ok(Record::new(values))
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        while let Some(line) = self.read_line()? {
            if line.is_empty() {
                continue;
            }
            let record = self.parse(&line)?;
            let keep = self
                .predicates
                .iter()
                .all(|(slot, p)| record.get(*slot).is_some_and(|v| p.matches(v)));
            if keep {
                return Ok(Some(project(&record, &self.projection)));
            }
        }
        Ok(None)
    }
}

impl Iterator for LineReader {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn parse_field(text: &str, field: &FieldDef) -> Result<Value> {
    if text.is_empty() {
        return Ok(Value::Null);
    }
    let invalid = || Error::Source(format!("field {}: cannot read {text:?} as {}", field.name, field.ty));
    Ok(match field.ty {
        LogicalType::Bool => match text {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => return Err(invalid()),
        },
        LogicalType::Int64 => Value::Int64(text.trim().parse().map_err(|_| invalid())?),
        LogicalType::Float64 => Value::Float64(text.trim().parse().map_err(|_| invalid())?),
        LogicalType::String => Value::from(text),
        LogicalType::List(_) => return Err(invalid()),
    })
}
