//! Typed names and containers for the inputs and outputs of a forward pass.

use std::fmt;

use crate::tensor::{HostTensor, Tensor};
use crate::{EngineError, ModelConfig, Result, TokenId};

/// Which half of a layer's attention cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KvKind {
    Key,
    Value,
}

impl fmt::Display for KvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvKind::Key => write!(f, "key"),
            KvKind::Value => write!(f, "value"),
        }
    }
}

/// One KV-cache entry: a layer and a key/value half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheSlot {
    pub layer: usize,
    pub kind: KvKind,
}

impl CacheSlot {
    pub fn key(layer: usize) -> Self {
        Self {
            layer,
            kind: KvKind::Key,
        }
    }

    pub fn value(layer: usize) -> Self {
        Self {
            layer,
            kind: KvKind::Value,
        }
    }

    /// Dense index: `2 * layer` for keys, `2 * layer + 1` for values.
    pub fn index(&self) -> usize {
        2 * self.layer
            + match self.kind {
                KvKind::Key => 0,
                KvKind::Value => 1,
            }
    }

    /// Every slot of a model with `layers` layers, in index order.
    pub fn all(layers: usize) -> impl Iterator<Item = CacheSlot> {
        (0..layers).flat_map(|l| [CacheSlot::key(l), CacheSlot::value(l)])
    }

    pub fn input_name(self) -> InputName {
        InputName::Past(self)
    }

    pub fn output_name(self) -> OutputName {
        OutputName::Present(self)
    }
}

/// Graph input names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputName {
    InputIds,
    AttentionMask,
    PositionIds,
    Past(CacheSlot),
}

impl fmt::Display for InputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputName::InputIds => write!(f, "input_ids"),
            InputName::AttentionMask => write!(f, "attention_mask"),
            InputName::PositionIds => write!(f, "position_ids"),
            InputName::Past(slot) => write!(f, "past_key_values.{}.{}", slot.layer, slot.kind),
        }
    }
}

/// Graph output names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputName {
    Logits,
    Present(CacheSlot),
}

impl OutputName {
    /// The cache slot a `present` output feeds on the next step.
    pub fn cache_slot(&self) -> Option<CacheSlot> {
        match self {
            OutputName::Logits => None,
            OutputName::Present(slot) => Some(*slot),
        }
    }
}

impl fmt::Display for OutputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputName::Logits => write!(f, "logits"),
            OutputName::Present(slot) => write!(f, "present.{}.{}", slot.layer, slot.kind),
        }
    }
}

/// Read access to the cached keys/values fed into a forward pass.
pub trait PastKeyValues {
    /// Number of layers the cache covers.
    fn layers(&self) -> usize;

    /// Tensor held in `slot`, if any.
    fn get(&self, slot: CacheSlot) -> Option<&Tensor>;

    /// Sequence length of the cached prefix.
    fn seq_len(&self) -> usize {
        self.get(CacheSlot::key(0))
            .and_then(Tensor::seq_len)
            .unwrap_or(0)
    }
}

/// Inputs of one forward pass.
#[derive(Clone, Copy)]
pub struct SessionInputs<'a> {
    pub input_ids: &'a [TokenId],
    pub attention_mask: &'a [i64],
    pub position_ids: Option<&'a [i64]>,
    pub past: &'a dyn PastKeyValues,
}

impl fmt::Debug for SessionInputs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInputs")
            .field("input_ids", &self.input_ids)
            .field("attention_mask_len", &self.attention_mask.len())
            .field("position_ids", &self.position_ids)
            .field("past_seq_len", &self.past.seq_len())
            .finish()
    }
}

impl SessionInputs<'_> {
    /// Check every input against the model config before running.
    pub fn validate(&self, config: &ModelConfig, needs_position_ids: bool) -> Result<()> {
        let n = self.input_ids.len();
        if n == 0 {
            return Err(EngineError::shape(InputName::InputIds, "[1, >0]", "[1, 0]"));
        }
        if self.past.layers() != config.num_hidden_layers {
            return Err(EngineError::shape(
                "past_key_values",
                format!("{} layers", config.num_hidden_layers),
                format!("{} layers", self.past.layers()),
            ));
        }

        let past_len = self.past.seq_len();
        let [b, h, _, d] = config.empty_kv_shape();
        for slot in CacheSlot::all(config.num_hidden_layers) {
            let name = slot.input_name();
            let tensor = self
                .past
                .get(slot)
                .ok_or_else(|| EngineError::Inference(format!("missing input {name}")))?;
            let expected = [b, h, past_len, d];
            if tensor.shape() != expected {
                return Err(EngineError::shape(
                    name,
                    format!("{expected:?}"),
                    format!("{:?}", tensor.shape()),
                ));
            }
        }

        let total = past_len + n;
        if self.attention_mask.len() != total {
            return Err(EngineError::shape(
                InputName::AttentionMask,
                format!("[1, {total}]"),
                format!("[1, {}]", self.attention_mask.len()),
            ));
        }

        match (needs_position_ids, self.position_ids) {
            (true, None) => {
                return Err(EngineError::Inference(format!(
                    "missing input {}",
                    InputName::PositionIds
                )))
            }
            (true, Some(pos)) if pos.len() != n => {
                return Err(EngineError::shape(
                    InputName::PositionIds,
                    format!("[1, {n}]"),
                    format!("[1, {}]", pos.len()),
                ))
            }
            _ => {}
        }
        Ok(())
    }
}

/// Outputs of one forward pass.
#[derive(Debug)]
pub struct SessionOutputs {
    /// `[1, seq, vocab]` logits for every input position.
    pub logits: HostTensor,
    /// New cache tensors, one per slot, in slot index order.
    pub present: Vec<(CacheSlot, Tensor)>,
}

impl SessionOutputs {
    /// Vocabulary-width logits of the last input position.
    pub fn last_logits(&self) -> Result<&[f32]> {
        let (seq, vocab) = match self.logits.shape() {
            [1, seq, vocab] if *seq > 0 && *vocab > 0 => (*seq, *vocab),
            other => {
                return Err(EngineError::shape(
                    OutputName::Logits,
                    "[1, >0, >0]",
                    format!("{other:?}"),
                ))
            }
        };
        let start = (seq - 1) * vocab;
        Ok(&self.logits.data()[start..start + vocab])
    }

    /// Free every device-resident `present` tensor. Returns how many failed.
    pub fn dispose(self) -> usize {
        self.present
            .into_iter()
            .filter_map(|(_, t)| t.dispose().err())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapPast {
        layers: usize,
        tensors: HashMap<CacheSlot, Tensor>,
    }

    impl MapPast {
        fn empty(config: &ModelConfig) -> Self {
            let tensors = CacheSlot::all(config.num_hidden_layers)
                .map(|s| (s, HostTensor::zeros(config.empty_kv_shape().to_vec()).into()))
                .collect();
            Self {
                layers: config.num_hidden_layers,
                tensors,
            }
        }
    }

    impl PastKeyValues for MapPast {
        fn layers(&self) -> usize {
            self.layers
        }
        fn get(&self, slot: CacheSlot) -> Option<&Tensor> {
            self.tensors.get(&slot)
        }
    }

    fn config() -> ModelConfig {
        ModelConfig::from_json(
            r#"{"eos_token_id": 2, "num_hidden_layers": 2, "num_key_value_heads": 1,
                "hidden_size": 8, "num_attention_heads": 2}"#,
        )
        .unwrap()
    }

    #[test]
    fn names_render_like_graph_tensors() {
        assert_eq!(InputName::InputIds.to_string(), "input_ids");
        assert_eq!(
            CacheSlot::value(3).input_name().to_string(),
            "past_key_values.3.value"
        );
        assert_eq!(CacheSlot::key(0).output_name().to_string(), "present.0.key");
        assert_eq!(
            OutputName::Present(CacheSlot::key(5)).cache_slot(),
            Some(CacheSlot::key(5))
        );
        assert_eq!(OutputName::Logits.cache_slot(), None);
    }

    #[test]
    fn slots_enumerate_in_index_order() {
        let slots: Vec<_> = CacheSlot::all(2).collect();
        assert_eq!(slots.len(), 4);
        for (i, s) in slots.iter().enumerate() {
            assert_eq!(s.index(), i);
        }
    }

    #[test]
    fn validate_prime_step() {
        let config = config();
        let past = MapPast::empty(&config);
        let ids = [5, 6, 7];
        let mask = [1i64; 3];
        let pos = [0i64, 1, 2];
        let inputs = SessionInputs {
            input_ids: &ids,
            attention_mask: &mask,
            position_ids: Some(&pos[..]),
            past: &past,
        };
        inputs.validate(&config, true).unwrap();
    }

    #[test]
    fn validate_rejects_bad_mask_and_missing_positions() {
        let config = config();
        let past = MapPast::empty(&config);
        let ids = [5, 6];
        let short_mask = [1i64; 1];
        let inputs = SessionInputs {
            input_ids: &ids,
            attention_mask: &short_mask,
            position_ids: Some(&[0, 1][..]),
            past: &past,
        };
        let err = inputs.validate(&config, true).unwrap_err();
        assert!(err.to_string().contains("attention_mask"));

        let mask = [1i64; 2];
        let inputs = SessionInputs {
            input_ids: &ids,
            attention_mask: &mask,
            position_ids: None,
            past: &past,
        };
        assert!(inputs.validate(&config, true).is_err());
        assert!(inputs.validate(&config, false).is_ok());
    }

    #[test]
    fn validate_rejects_wrong_cache_shape() {
        let config = config();
        let mut past = MapPast::empty(&config);
        past.tensors.insert(
            CacheSlot::value(1),
            HostTensor::zeros(vec![1, 2, 0, 4]).into(),
        );
        let inputs = SessionInputs {
            input_ids: &[1],
            attention_mask: &[1],
            position_ids: Some(&[0][..]),
            past: &past,
        };
        let err = inputs.validate(&config, true).unwrap_err();
        assert!(err.to_string().contains("past_key_values.1.value"));
    }

    #[test]
    fn last_logits_slices_final_position() {
        let logits = HostTensor::new(vec![1, 2, 3], vec![0.0, 1.0, 2.0, 9.0, 8.0, 7.0]).unwrap();
        let out = SessionOutputs {
            logits,
            present: Vec::new(),
        };
        assert_eq!(out.last_logits().unwrap(), &[9.0, 8.0, 7.0]);
    }
}
