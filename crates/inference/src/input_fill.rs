//! Input fill table
//!
//! The service only ever receives token ids, but a shard may declare more
//! inputs than that. Each declared input is matched against an ordered list
//! of rules; the first rule whose pattern matches decides how its tensor is
//! built.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use duoshard_graph::{Dim, ElementType, ValueInfo};

use crate::error::ExecutorError;
use crate::executor::dtype_for;

/// How an input name is matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamePattern {
    Exact(String),
    Contains(String),
    Any,
}

impl NamePattern {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            NamePattern::Exact(exact) => name == exact,
            NamePattern::Contains(part) => name.contains(part.as_str()),
            NamePattern::Any => true,
        }
    }
}

/// How the tensor for a matched input is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStrategy {
    /// The request's token ids, cast to the declared width
    RequestIds,
    /// All-ones `[batch, seq]`
    OnesMask,
    /// Empty past-sequence cache of the declared rank
    CachePlaceholder,
    /// Zeros; declared dims kept, unknown or symbolic ones set to 1
    Zeros,
}

#[derive(Debug, Clone)]
pub struct FillRule {
    pub pattern: NamePattern,
    pub strategy: FillStrategy,
}

impl FillRule {
    pub fn new(pattern: NamePattern, strategy: FillStrategy) -> Self {
        Self { pattern, strategy }
    }
}

#[derive(Debug, Clone)]
pub struct FillTable {
    rules: Vec<FillRule>,
}

impl Default for FillTable {
    fn default() -> Self {
        Self::new(vec![
            FillRule::new(NamePattern::Exact("input_ids".into()), FillStrategy::RequestIds),
            FillRule::new(NamePattern::Exact("attention_mask".into()), FillStrategy::OnesMask),
            FillRule::new(NamePattern::Contains("past_key_values".into()), FillStrategy::CachePlaceholder),
            FillRule::new(NamePattern::Contains("past_key".into()), FillStrategy::CachePlaceholder),
            FillRule::new(NamePattern::Contains("past_value".into()), FillStrategy::CachePlaceholder),
            FillRule::new(NamePattern::Any, FillStrategy::Zeros),
        ])
    }
}

impl FillTable {
    pub fn new(rules: Vec<FillRule>) -> Self {
        Self { rules }
    }

    /// First matching strategy for an input name
    pub fn strategy_for(&self, name: &str) -> FillStrategy {
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(name))
            .map(|rule| rule.strategy)
            .unwrap_or(FillStrategy::Zeros)
    }

    /// Build the tensor for one declared input
    pub fn resolve(&self, info: &ValueInfo, input_ids: &Tensor) -> Result<Tensor, ExecutorError> {
        let (batch, seq) = input_ids.dims2()?;
        let device = input_ids.device();

        let tensor = match self.strategy_for(&info.name) {
            FillStrategy::RequestIds => {
                let dtype = declared_dtype(info.element_type, DType::I64)?;
                input_ids.to_dtype(dtype)?
            }
            FillStrategy::OnesMask => {
                let dtype = declared_dtype(info.element_type, DType::I64)?;
                Tensor::ones((batch, seq), dtype, device)?
            }
            FillStrategy::CachePlaceholder => {
                let dtype = declared_dtype(info.element_type, DType::F32)?;
                Tensor::zeros(cache_shape(info.shape.as_deref(), batch), dtype, device)?
            }
            FillStrategy::Zeros => {
                let dtype = declared_dtype(info.element_type, DType::F32)?;
                let shape: Vec<usize> = info
                    .shape
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(|d| d.as_fixed().unwrap_or(1) as usize)
                    .collect();
                Tensor::zeros(shape, dtype, device)?
            }
        };
        Ok(tensor)
    }

    /// Tensors for every declared input of a shard
    pub fn fill_inputs(
        &self,
        declared: &[ValueInfo],
        input_ids: &Tensor,
    ) -> Result<HashMap<String, Tensor>, ExecutorError> {
        declared
            .iter()
            .map(|info| Ok((info.name.clone(), self.resolve(info, input_ids)?)))
            .collect()
    }
}

fn declared_dtype(element_type: ElementType, fallback: DType) -> Result<DType, ExecutorError> {
    match element_type {
        ElementType::Undefined => Ok(fallback),
        other => dtype_for(other),
    }
}

/// Shape of an empty cache: known dims kept, unknown dim 0 is the batch, the
/// past-sequence axis is 0 and any other unknown dim is 1. Without a declared
/// shape the cache is `[batch, 0]`.
pub fn cache_shape(declared: Option<&[Dim]>, batch: usize) -> Vec<usize> {
    let dims = match declared {
        Some(dims) if !dims.is_empty() => dims,
        _ => return vec![batch, 0],
    };

    let rank = dims.len();
    let past_axis = dims
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, d)| d.as_fixed().is_none())
        .map(|(i, _)| i)
        .unwrap_or(rank.saturating_sub(2));

    dims.iter()
        .enumerate()
        .map(|(i, d)| {
            if i == past_axis {
                0
            } else {
                match d.as_fixed() {
                    Some(v) if v >= 0 => v as usize,
                    _ if i == 0 => batch,
                    _ => 1,
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn ids() -> Tensor {
        Tensor::new(&[[5i64, 6, 7]], &Device::Cpu).unwrap()
    }

    #[test]
    fn test_first_match_wins() {
        let table = FillTable::default();
        assert_eq!(table.strategy_for("input_ids"), FillStrategy::RequestIds);
        assert_eq!(table.strategy_for("attention_mask"), FillStrategy::OnesMask);
        assert_eq!(table.strategy_for("past_key_values.0.key"), FillStrategy::CachePlaceholder);
        assert_eq!(table.strategy_for("layer.3.past_value"), FillStrategy::CachePlaceholder);
        assert_eq!(table.strategy_for("position_ids"), FillStrategy::Zeros);
        assert_eq!(table.strategy_for("my_input_ids"), FillStrategy::Zeros);
    }

    #[test]
    fn test_ids_cast_to_declared_width() {
        let info = ValueInfo::new("input_ids", ElementType::Int32, vec![Dim::Unknown, Dim::Unknown]);
        let t = FillTable::default().resolve(&info, &ids()).unwrap();
        assert_eq!(t.dtype(), DType::U32);
        assert_eq!(t.to_vec2::<u32>().unwrap(), vec![vec![5, 6, 7]]);
    }

    #[test]
    fn test_attention_mask_all_ones() {
        let info = ValueInfo::new("attention_mask", ElementType::Int64, vec![Dim::symbolic("b"), Dim::symbolic("s")]);
        let t = FillTable::default().resolve(&info, &ids()).unwrap();
        assert_eq!(t.to_vec2::<i64>().unwrap(), vec![vec![1, 1, 1]]);
    }

    #[test]
    fn test_cache_placeholder_shape() {
        let dims = vec![Dim::symbolic("batch"), Dim::Fixed(8), Dim::symbolic("past"), Dim::Fixed(64)];
        assert_eq!(cache_shape(Some(&dims), 2), vec![2, 8, 0, 64]);

        let known = vec![Dim::Fixed(1), Dim::Fixed(8), Dim::Fixed(16), Dim::Fixed(64)];
        assert_eq!(cache_shape(Some(&known), 1), vec![1, 8, 0, 64]);

        assert_eq!(cache_shape(None, 3), vec![3, 0]);

        let info = ValueInfo::new("past_key_values.0.value", ElementType::Float16, dims);
        let t = FillTable::default().resolve(&info, &ids()).unwrap();
        assert_eq!(t.dims(), &[1, 8, 0, 64]);
        assert_eq!(t.dtype(), DType::F16);
    }

    #[test]
    fn test_zeros_replace_unknown_dims() {
        let info = ValueInfo::new(
            "position_ids",
            ElementType::Int64,
            vec![Dim::symbolic("batch"), Dim::Fixed(3), Dim::Unknown],
        );
        let t = FillTable::default().resolve(&info, &ids()).unwrap();
        assert_eq!(t.dims(), &[1, 3, 1]);
        assert_eq!(t.dtype(), DType::I64);

        // A declared zero-length axis stays empty
        let info = ValueInfo::new("extra", ElementType::Float, vec![Dim::Fixed(2), Dim::Fixed(0)]);
        let t = FillTable::default().resolve(&info, &ids()).unwrap();
        assert_eq!(t.dims(), &[2, 0]);
        assert_eq!(t.elem_count(), 0);
    }

    #[test]
    fn test_custom_table() {
        let table = FillTable::new(vec![FillRule::new(NamePattern::Any, FillStrategy::RequestIds)]);
        assert_eq!(table.strategy_for("anything"), FillStrategy::RequestIds);
    }
}
