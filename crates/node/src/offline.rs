//! Offline artifact commands: partition, prune, relocate

use std::error::Error;
use std::path::{Path, PathBuf};

use duoshard_graph::{
    load_model, prune_layer_initializers, prune_unused_initializers, relocate_external_data,
    save_model, write_descriptor, LoadMode, Partitioner,
};
use tracing::info;

use crate::config::{model_dir, PartitionJob};

pub fn run_partition(job: PartitionJob) -> Result<(), Box<dyn Error>> {
    info!("✂️ Partitioning {} at {}", job.model.display(), job.partition.gate);

    let full = load_model(&job.model, LoadMode::DescriptorOnly)?;
    let source_dir = model_dir(&job.model);
    let pair = Partitioner::new(job.partition).partition(&full)?;

    save_model(&pair.early, Some(&source_dir), &job.early_out)?;
    save_model(&pair.late, Some(&source_dir), &job.late_out)?;

    info!(
        "✅ Early shard: {} nodes -> {}",
        pair.early.nodes.len(),
        job.early_out.display()
    );
    info!(
        "✅ Late shard: {} nodes -> {}",
        pair.late.nodes.len(),
        job.late_out.display()
    );
    Ok(())
}

pub fn run_prune(model_path: &Path, output: Option<PathBuf>, min_layer: Option<u32>) -> Result<(), Box<dyn Error>> {
    let mut model = load_model(model_path, LoadMode::DescriptorOnly)?;
    let before = model.initializers.len();

    prune_unused_initializers(&mut model);
    if let Some(min_layer) = min_layer {
        prune_layer_initializers(&mut model, min_layer);
    }

    let output = output.unwrap_or_else(|| model_path.to_path_buf());
    save_model(&model, Some(&model_dir(model_path)), &output)?;
    info!(
        "✅ Kept {} of {} initializers -> {}",
        model.initializers.len(),
        before,
        output.display()
    );
    Ok(())
}

pub fn run_relocate(model_path: &Path, location: &str) -> Result<(), Box<dyn Error>> {
    let mut model = load_model(model_path, LoadMode::DescriptorOnly)?;
    let changed = relocate_external_data(&mut model, location);
    write_descriptor(&model, model_path)?;
    info!("✅ Pointed {} initializers at {}", changed, location);
    Ok(())
}
