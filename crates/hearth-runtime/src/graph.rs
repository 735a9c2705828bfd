//! Serialized graph format of the CPU reference backend.
//!
//! A model is three artifacts:
//! - `graph.json`: a [`GraphHeader`] describing the architecture and a table
//!   of named weight tensors with byte offsets into the shard
//! - `weights.bin`: the external shard, a flat little-endian `f32` blob
//! - `config.json`: the [`ModelConfig`] side-config
//!
//! [`write_tiny_model`] produces a small, deterministically seeded model in
//! this format so the whole pipeline can run without downloaded weights.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use hearth_engine::{EngineError, ModelConfig, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Format tag every graph header must carry.
pub const GRAPH_FORMAT: &str = "hearth-graph-v1";

pub const GRAPH_FILE: &str = "graph.json";
pub const WEIGHTS_FILE: &str = "weights.bin";
pub const CONFIG_FILE: &str = "config.json";

/// One weight tensor in the external shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub name: String,
    pub shape: Vec<usize>,
    /// Byte offset into the shard.
    pub offset: usize,
}

impl TensorEntry {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Header of a serialized graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphHeader {
    pub format: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub ffn_size: usize,
    #[serde(default = "default_rope_base")]
    pub rope_base: f32,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f32,
    #[serde(default = "default_true")]
    pub needs_position_ids: bool,
    pub tensors: Vec<TensorEntry>,
}

fn default_rope_base() -> f32 {
    10_000.0
}

fn default_norm_eps() -> f32 {
    1e-5
}

fn default_true() -> bool {
    true
}

impl GraphHeader {
    pub fn parse(model_bytes: &[u8]) -> Result<Self> {
        let header: GraphHeader = serde_json::from_slice(model_bytes)
            .map_err(|e| EngineError::Load(format!("malformed graph header: {e}")))?;
        if header.format != GRAPH_FORMAT {
            return Err(EngineError::Load(format!(
                "unsupported graph format '{}', expected '{GRAPH_FORMAT}'",
                header.format
            )));
        }
        Ok(header)
    }

    /// Check the graph against the side-config it is loaded with.
    pub fn check_config(&self, config: &ModelConfig) -> Result<()> {
        let pairs = [
            ("hidden_size", self.hidden_size, config.hidden_size),
            ("num_hidden_layers", self.num_hidden_layers, config.num_hidden_layers),
            ("num_attention_heads", self.num_attention_heads, config.num_attention_heads),
            ("num_key_value_heads", self.num_key_value_heads, config.num_key_value_heads),
        ];
        for (name, graph, side) in pairs {
            if graph != side {
                return Err(EngineError::Load(format!(
                    "{name} disagrees: graph has {graph}, config has {side}"
                )));
            }
        }
        if let Some(vocab) = config.vocab_size {
            if vocab != self.vocab_size {
                return Err(EngineError::Load(format!(
                    "vocab_size disagrees: graph has {}, config has {vocab}",
                    self.vocab_size
                )));
            }
        }
        if config.eos_token_id as usize >= self.vocab_size {
            return Err(EngineError::Load(format!(
                "eos_token_id {} is outside the vocabulary of {}",
                config.eos_token_id, self.vocab_size
            )));
        }
        Ok(())
    }

    fn kv_dim(&self) -> usize {
        self.num_key_value_heads * (self.hidden_size / self.num_attention_heads)
    }

    /// Every tensor the architecture needs, with its expected shape.
    pub fn expected_tensors(&self) -> Vec<(String, Vec<usize>)> {
        let (d, ff, v, kv) = (self.hidden_size, self.ffn_size, self.vocab_size, self.kv_dim());
        let mut out = vec![("embed_tokens".to_string(), vec![v, d])];
        for l in 0..self.num_hidden_layers {
            let p = format!("layers.{l}");
            out.extend([
                (format!("{p}.attn_norm"), vec![d]),
                (format!("{p}.wq"), vec![d, d]),
                (format!("{p}.wk"), vec![d, kv]),
                (format!("{p}.wv"), vec![d, kv]),
                (format!("{p}.wo"), vec![d, d]),
                (format!("{p}.mlp_norm"), vec![d]),
                (format!("{p}.w_gate"), vec![d, ff]),
                (format!("{p}.w_up"), vec![d, ff]),
                (format!("{p}.w_down"), vec![ff, d]),
            ]);
        }
        out.push(("final_norm".to_string(), vec![d]));
        out.push(("lm_head".to_string(), vec![d, v]));
        out
    }
}

/// Weights of one transformer block.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub attn_norm: Vec<f32>,
    pub wq: Vec<f32>,
    pub wk: Vec<f32>,
    pub wv: Vec<f32>,
    pub wo: Vec<f32>,
    pub mlp_norm: Vec<f32>,
    pub w_gate: Vec<f32>,
    pub w_up: Vec<f32>,
    pub w_down: Vec<f32>,
}

/// All weights of a loaded graph.
#[derive(Debug, Clone)]
pub struct ModelWeights {
    pub embed_tokens: Vec<f32>,
    pub layers: Vec<LayerWeights>,
    pub final_norm: Vec<f32>,
    pub lm_head: Vec<f32>,
}

impl ModelWeights {
    /// Resolve every expected tensor from the shard.
    pub fn from_shard(header: &GraphHeader, shard: &[u8]) -> Result<Self> {
        let table: HashMap<&str, &TensorEntry> =
            header.tensors.iter().map(|t| (t.name.as_str(), t)).collect();

        let mut loaded: HashMap<String, Vec<f32>> = HashMap::new();
        for (name, shape) in header.expected_tensors() {
            let entry = table
                .get(name.as_str())
                .ok_or_else(|| EngineError::Load(format!("missing weight tensor {name}")))?;
            if entry.shape != shape {
                return Err(EngineError::Load(format!(
                    "weight tensor {name} has shape {:?}, expected {shape:?}",
                    entry.shape
                )));
            }
            let len = entry.numel() * 4;
            let bytes = shard.get(entry.offset..entry.offset + len).ok_or_else(|| {
                EngineError::Load(format!(
                    "weight shard too short for {name}: needs bytes {}..{}, shard has {}",
                    entry.offset,
                    entry.offset + len,
                    shard.len()
                ))
            })?;
            let mut data = vec![0.0f32; entry.numel()];
            LittleEndian::read_f32_into(bytes, &mut data);
            loaded.insert(name, data);
        }

        let mut take = |name: String| {
            loaded
                .remove(&name)
                .ok_or_else(|| EngineError::Load(format!("missing weight tensor {name}")))
        };

        let embed_tokens = take("embed_tokens".into())?;
        let mut layers = Vec::with_capacity(header.num_hidden_layers);
        for l in 0..header.num_hidden_layers {
            layers.push(LayerWeights {
                attn_norm: take(format!("layers.{l}.attn_norm"))?,
                wq: take(format!("layers.{l}.wq"))?,
                wk: take(format!("layers.{l}.wk"))?,
                wv: take(format!("layers.{l}.wv"))?,
                wo: take(format!("layers.{l}.wo"))?,
                mlp_norm: take(format!("layers.{l}.mlp_norm"))?,
                w_gate: take(format!("layers.{l}.w_gate"))?,
                w_up: take(format!("layers.{l}.w_up"))?,
                w_down: take(format!("layers.{l}.w_down"))?,
            });
        }
        Ok(Self {
            embed_tokens,
            layers,
            final_norm: take("final_norm".into())?,
            lm_head: take("lm_head".into())?,
        })
    }
}

/// Architecture of a generated tiny model.
#[derive(Debug, Clone, PartialEq)]
pub struct TinyModelSpec {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub ffn_size: usize,
    pub eos_token_id: i32,
    pub seed: u64,
}

impl Default for TinyModelSpec {
    fn default() -> Self {
        Self {
            // 256 byte tokens plus the chat special tokens.
            vocab_size: 261,
            hidden_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            ffn_size: 64,
            eos_token_id: 256,
            seed: 12345,
        }
    }
}

/// Seeded xorshift64 generator for reproducible weights.
struct WeightRng {
    state: u64,
}

impl WeightRng {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        ((self.state >> 40) as f32 / (1u64 << 24) as f32 - 0.5) * 0.2
    }
}

/// Paths of a model written to disk.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub graph: PathBuf,
    pub weights: PathBuf,
    pub config: PathBuf,
}

impl ModelArtifacts {
    /// Standard artifact names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            graph: dir.join(GRAPH_FILE),
            weights: dir.join(WEIGHTS_FILE),
            config: dir.join(CONFIG_FILE),
        }
    }
}

/// Serialize a tiny model into memory: `(graph bytes, shard bytes, config)`.
pub fn build_tiny_model(spec: &TinyModelSpec) -> Result<(Vec<u8>, Vec<u8>, ModelConfig)> {
    let mut header = GraphHeader {
        format: GRAPH_FORMAT.to_string(),
        vocab_size: spec.vocab_size,
        hidden_size: spec.hidden_size,
        num_hidden_layers: spec.num_hidden_layers,
        num_attention_heads: spec.num_attention_heads,
        num_key_value_heads: spec.num_key_value_heads,
        ffn_size: spec.ffn_size,
        rope_base: default_rope_base(),
        norm_eps: default_norm_eps(),
        needs_position_ids: true,
        tensors: Vec::new(),
    };
    let config = ModelConfig {
        eos_token_id: spec.eos_token_id,
        num_hidden_layers: spec.num_hidden_layers,
        num_key_value_heads: spec.num_key_value_heads,
        hidden_size: spec.hidden_size,
        num_attention_heads: spec.num_attention_heads,
        vocab_size: Some(spec.vocab_size),
        max_position_embeddings: 4096,
    };
    config.validate()?;

    let mut rng = WeightRng::new(spec.seed);
    let mut shard = Vec::new();
    for (name, shape) in header.expected_tensors() {
        let numel: usize = shape.iter().product();
        let is_norm = name.ends_with("norm");
        header.tensors.push(TensorEntry {
            name,
            shape,
            offset: shard.len(),
        });
        for _ in 0..numel {
            let w = if is_norm { 1.0 } else { rng.next_f32() };
            shard.write_f32::<LittleEndian>(w)?;
        }
    }

    let graph = serde_json::to_vec_pretty(&header)?;
    Ok((graph, shard, config))
}

/// Write a tiny seeded model into `dir`, creating it if needed.
pub fn write_tiny_model(dir: &Path, spec: &TinyModelSpec) -> Result<ModelArtifacts> {
    let (graph, shard, config) = build_tiny_model(spec)?;
    fs::create_dir_all(dir)?;
    let artifacts = ModelArtifacts::in_dir(dir);

    fs::write(&artifacts.graph, graph)?;
    let mut file = fs::File::create(&artifacts.weights)?;
    file.write_all(&shard)?;
    file.sync_all()?;
    fs::write(&artifacts.config, serde_json::to_vec_pretty(&config)?)?;

    debug!(dir = %dir.display(), bytes = shard.len(), "wrote tiny model");
    Ok(artifacts)
}
