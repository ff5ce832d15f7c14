//! Inspect command.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::Cell;
use serde::Serialize;
use sluice_adapters::storage::{PartSummary, inspect_part, list_parts};

use crate::OutputFormat;
use crate::output::{self, Format};

/// Summary of one part file.
#[derive(Serialize)]
struct PartOutput {
    path: String,
    frames: u64,
    key_bytes: u64,
    value_bytes: u64,
    file_bytes: u64,
}

impl From<PartSummary> for PartOutput {
    fn from(s: PartSummary) -> Self {
        Self {
            path: s.path.display().to_string(),
            frames: s.frames,
            key_bytes: s.key_bytes,
            value_bytes: s.value_bytes,
            file_bytes: s.file_bytes,
        }
    }
}

/// Run the inspect command.
pub fn run(path: &Path, format: OutputFormat, quiet: bool) -> Result<()> {
    let fmt: Format = format.into();

    if path.is_file() {
        let part = PartOutput::from(
            inspect_part(path).with_context(|| format!("reading {}", path.display()))?,
        );
        return output::print_key_value_table(
            &[
                ("Path", part.path),
                ("Frames", part.frames.to_string()),
                ("Key bytes", part.key_bytes.to_string()),
                ("Value bytes", part.value_bytes.to_string()),
                ("File bytes", part.file_bytes.to_string()),
            ],
            fmt,
            quiet,
        );
    }

    if !path.is_dir() {
        bail!("{} is neither a dataset directory nor a part file", path.display());
    }
    let parts = list_parts(path)?
        .into_iter()
        .map(|p| {
            inspect_part(&p)
                .map(PartOutput::from)
                .with_context(|| format!("reading {}", p.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    match fmt {
        Format::Json => output::print_output(&parts, fmt, quiet)?,
        Format::Table => {
            if quiet {
                return Ok(());
            }
            let mut table = output::create_table();
            output::add_header(&mut table, &["Part", "Frames", "Key bytes", "Value bytes"]);
            for part in &parts {
                table.add_row(vec![
                    Cell::new(&part.path),
                    Cell::new(part.frames),
                    Cell::new(part.key_bytes),
                    Cell::new(part.value_bytes),
                ]);
            }
            println!("{table}");
            let frames: u64 = parts.iter().map(|p| p.frames).sum();
            output::success(
                &format!("{} parts, {frames} frames, checksums verified", parts.len()),
                quiet,
            );
        }
    }
    Ok(())
}
