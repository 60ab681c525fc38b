//! Checkpointing and serialization.
//!
//! Trainer state is persisted with the `safetensors` format: every state
//! vector is stored as a flat `F32` tensor, and step counters as one-element
//! `U64` tensors.

use crate::error::{Result, SyncError};
use crate::training::shards::ShardState;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const PARAMS: &str = "params";
const PARAMS_AVG: &str = "params_avg";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const BATCHES: &str = "batches";

/// Named flat tensors plus named counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Checkpoint {
    pub tensors: BTreeMap<String, Vec<f32>>,
    pub counters: BTreeMap<String, u64>,
}

impl Checkpoint {
    /// Packs the shard store snapshot and the reported-batch counter.
    pub fn from_shard_state(state: ShardState, batches: u64) -> Self {
        let mut tensors = BTreeMap::new();
        tensors.insert(PARAMS.to_string(), state.params);
        if let Some(avg) = state.params_avg {
            tensors.insert(PARAMS_AVG.to_string(), avg);
        }
        for (key, values) in state.optimizer {
            tensors.insert(format!("{OPTIMIZER_PREFIX}{key}"), values);
        }
        let mut counters = BTreeMap::new();
        counters.insert(BATCHES.to_string(), batches);
        Self { tensors, counters }
    }

    /// Inverse of [`from_shard_state`](Self::from_shard_state).
    pub fn into_shard_state(mut self) -> Result<(ShardState, u64)> {
        let params = self
            .tensors
            .remove(PARAMS)
            .ok_or_else(|| SyncError::Checkpoint(format!("missing tensor '{PARAMS}'")))?;
        let params_avg = self.tensors.remove(PARAMS_AVG);
        let optimizer = self
            .tensors
            .into_iter()
            .filter_map(|(name, values)| {
                name.strip_prefix(OPTIMIZER_PREFIX)
                    .map(|key| (key.to_string(), values))
            })
            .collect();
        let batches = self.counters.get(BATCHES).copied().unwrap_or(0);
        Ok((
            ShardState {
                params,
                params_avg,
                optimizer,
            },
            batches,
        ))
    }
}

/// Writes `checkpoint` to a safetensors file at `path`.
pub fn save_checkpoint<P: AsRef<Path>>(path: P, checkpoint: &Checkpoint) -> Result<()> {
    // The views borrow these buffers, so they must outlive serialization.
    let tensor_bytes: Vec<(&String, Vec<u8>, usize)> = checkpoint
        .tensors
        .iter()
        .map(|(name, values)| {
            let bytes = values.iter().flat_map(|x| x.to_le_bytes()).collect();
            (name, bytes, values.len())
        })
        .collect();
    let counter_bytes: Vec<(&String, [u8; 8])> = checkpoint
        .counters
        .iter()
        .map(|(name, value)| (name, value.to_le_bytes()))
        .collect();

    let mut views = HashMap::new();
    for (name, bytes, len) in &tensor_bytes {
        let view = TensorView::new(Dtype::F32, vec![*len], bytes)?;
        views.insert((*name).clone(), view);
    }
    for (name, bytes) in &counter_bytes {
        if views.contains_key(*name) {
            return Err(SyncError::Checkpoint(format!(
                "'{name}' is both a tensor and a counter"
            )));
        }
        let view = TensorView::new(Dtype::U64, vec![1], bytes)?;
        views.insert((*name).clone(), view);
    }

    let metadata: Option<HashMap<String, String>> = None;
    safetensors::serialize_to_file(&views, metadata, path.as_ref())?;
    Ok(())
}

/// Reads a checkpoint written by [`save_checkpoint`].
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
    let file_content = std::fs::read(path)?;
    let safetensors = SafeTensors::deserialize(&file_content)?;

    let mut checkpoint = Checkpoint::default();
    for (name, view) in safetensors.tensors() {
        let data = view.data();
        match view.dtype() {
            Dtype::F32 => {
                let values = data
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                checkpoint.tensors.insert(name, values);
            }
            Dtype::U64 => {
                let raw: [u8; 8] = data.try_into().map_err(|_| {
                    SyncError::Checkpoint(format!("counter '{name}' is not a single u64"))
                })?;
                checkpoint.counters.insert(name, u64::from_le_bytes(raw));
            }
            other => {
                return Err(SyncError::Checkpoint(format!(
                    "tensor '{name}' has unsupported dtype {other:?}"
                )))
            }
        }
    }
    Ok(checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_state_packing() {
        let mut optimizer = BTreeMap::new();
        optimizer.insert("adam_m".to_string(), vec![0.5, 0.25]);
        let state = ShardState {
            params: vec![1.0, 2.0],
            params_avg: None,
            optimizer,
        };
        let checkpoint = Checkpoint::from_shard_state(state.clone(), 7);
        assert!(checkpoint.tensors.contains_key("optimizer.adam_m"));
        let (restored, batches) = checkpoint.into_shard_state().unwrap();
        assert_eq!(restored, state);
        assert_eq!(batches, 7);
    }

    #[test]
    fn test_missing_params() {
        assert!(Checkpoint::default().into_shard_state().is_err());
    }

    #[test]
    fn test_save_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.safetensors");
        let mut checkpoint = Checkpoint::default();
        checkpoint.tensors.insert("params".to_string(), vec![1.0, -2.5, 3.25]);
        checkpoint.counters.insert("batches".to_string(), u64::MAX - 1);

        save_checkpoint(&path, &checkpoint).unwrap();
        assert_eq!(load_checkpoint(&path).unwrap(), checkpoint);
    }
}
