//! Run command.

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use comfy_table::Cell;
use sluice_core::shuffle::DiagnosticOrder;
use sluice_engine::QueryResult;

use super::JobFile;
use crate::output::{self, Format};
use crate::{Diagnostic, OutputFormat, Overrides};

/// Run the run command.
pub fn run(
    job: &Path,
    overrides: &Overrides,
    diagnostic_order: Option<Diagnostic>,
    format: OutputFormat,
    quiet: bool,
) -> Result<()> {
    let mut job = JobFile::load(job)?;
    if let Some(order) = diagnostic_order {
        job.config.diagnostic_order = Some(match order {
            Diagnostic::Constant => DiagnosticOrder::Constant,
            Diagnostic::Random => DiagnosticOrder::Random,
        });
    }
    let (engine, plan) = job.into_engine(overrides)?;

    let started = Instant::now();
    let result = engine.execute(plan)?;
    let elapsed = started.elapsed();

    let fmt: Format = format.into();
    match fmt {
        Format::Json => output::print_output(&result.to_json(), fmt, quiet)?,
        Format::Table => {
            if quiet {
                return Ok(());
            }
            println!("{}", result_table(&result));
            output::status(
                &format!("{} rows in {:.2?}", result.len(), elapsed),
                quiet,
            );
        }
    }
    Ok(())
}

fn result_table(result: &QueryResult) -> comfy_table::Table {
    let mut table = output::create_table();
    let headers: Vec<String> = result
        .columns
        .iter()
        .zip(&result.types)
        .map(|(name, ty)| format!("{name}\n{ty}"))
        .collect();
    output::add_header(&mut table, &headers.iter().map(String::as_str).collect::<Vec<_>>());
    for row in &result.rows {
        table.add_row(
            row.values()
                .iter()
                .map(|v| Cell::new(v.to_string()))
                .collect::<Vec<_>>(),
        );
    }
    table
}
