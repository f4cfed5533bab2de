//! Initializer pruning for saved shards

use std::collections::HashSet;

use tracing::info;

use crate::model::GraphModel;

/// Drop initializers no node reads. Returns how many were removed.
pub fn prune_unused_initializers(model: &mut GraphModel) -> usize {
    let used: HashSet<String> = model
        .nodes
        .iter()
        .flat_map(|n| n.inputs.iter().cloned())
        .collect();
    let before = model.initializers.len();
    model.initializers.retain(|i| used.contains(&i.name));
    let removed = before - model.initializers.len();
    if removed > 0 {
        info!("🧹 Pruned {} unused initializers from {}", removed, model.name);
    }
    removed
}

/// Transformer layer index carried by a weight name such as
/// `model.layers.12.mlp.down_proj.weight`.
pub fn layer_index(name: &str) -> Option<u32> {
    let mut rest = name;
    while let Some(pos) = rest.find("layers.") {
        let after = &rest[pos + "layers.".len()..];
        let digits: &str = &after[..after.find(|c: char| !c.is_ascii_digit()).unwrap_or(after.len())];
        if !digits.is_empty() && after[digits.len()..].starts_with('.') {
            return digits.parse().ok();
        }
        rest = after;
    }
    None
}

/// Drop initializers belonging to layers below `min_layer`. Weights that are
/// not tied to a layer (embeddings, final norm, head) are kept.
pub fn prune_layer_initializers(model: &mut GraphModel, min_layer: u32) -> usize {
    let before = model.initializers.len();
    model
        .initializers
        .retain(|i| layer_index(&i.name).map_or(true, |layer| layer >= min_layer));
    let removed = before - model.initializers.len();
    info!(
        "🧹 Dropped {} initializers from layers below {} in {}",
        removed, min_layer, model.name
    );
    removed
}
