//! Storage for intermediate stage outputs.

pub mod dataset;

pub use dataset::{
    DatasetReader, DatasetStore, DatasetWriter, PartSummary, inspect_part, list_parts,
    temp_dataset_name,
};
