//! Explain command.

use std::path::Path;

use anyhow::Result;
use comfy_table::Cell;
use serde::Serialize;

use super::JobFile;
use crate::output::{self, Format};
use crate::{OutputFormat, Overrides};

/// One stage of the explained graph.
#[derive(Serialize)]
struct StageOutput {
    seq: usize,
    inputs: Vec<usize>,
    shuffle: Option<String>,
    partitions: Option<usize>,
    skip_sort: bool,
    output: String,
    terminal: bool,
}

/// Explain output.
#[derive(Serialize)]
struct ExplainOutput {
    plan: String,
    stages: Vec<StageOutput>,
}

/// Run the explain command.
pub fn run(job: &Path, overrides: &Overrides, format: OutputFormat, quiet: bool) -> Result<()> {
    let (engine, plan) = JobFile::load(job)?.into_engine(overrides)?;
    let rewritten = engine.rewrite(plan.clone())?;
    let graph = engine.compile(plan)?;

    let output = ExplainOutput {
        plan: rewritten.explain(),
        stages: graph
            .stages
            .iter()
            .map(|s| StageOutput {
                seq: s.seq,
                inputs: s.inputs.clone(),
                shuffle: s
                    .shuffle
                    .as_ref()
                    .map(|spec| format!("{} ({})", spec.site, spec.policy)),
                partitions: s.shuffle.as_ref().map(|spec| spec.partitions),
                skip_sort: s.shuffle.as_ref().is_some_and(|spec| spec.skip_sort),
                output: s.output.to_string(),
                terminal: s.is_terminal,
            })
            .collect(),
    };

    let fmt: Format = format.into();
    match fmt {
        Format::Json => output::print_output(&output, fmt, quiet)?,
        Format::Table => {
            if quiet {
                return Ok(());
            }
            println!("{}", output.plan);
            let mut table = output::create_table();
            output::add_header(
                &mut table,
                &["Stage", "Inputs", "Shuffle", "Partitions", "Output"],
            );
            for stage in &output.stages {
                let seq = if stage.terminal {
                    format!("{} *", stage.seq)
                } else {
                    stage.seq.to_string()
                };
                let shuffle = match &stage.shuffle {
                    Some(s) if stage.skip_sort => format!("{s}, skip-sort"),
                    Some(s) => s.clone(),
                    None => "-".to_string(),
                };
                table.add_row(vec![
                    Cell::new(seq),
                    Cell::new(format!("{:?}", stage.inputs)),
                    Cell::new(shuffle),
                    Cell::new(stage.partitions.map_or("-".to_string(), |p| p.to_string())),
                    Cell::new(&stage.output),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}
