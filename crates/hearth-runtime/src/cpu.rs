//! CPU reference implementation of [`InferenceSession`].
//!
//! Executes a decoder-only transformer (RMSNorm, RoPE, grouped-query
//! attention, SwiGLU MLP) described by a [`GraphHeader`] and an external
//! weight shard. Each run consumes the cached keys/values of the previous
//! positions and returns `present` tensors covering the whole sequence, so the
//! cache grows by the number of input tokens per run.

use std::path::Path;
use std::time::{Duration, Instant};

use hearth_engine::{
    CacheSlot, DeviceArena, EngineError, HostTensor, InferenceSession, ModelConfig, OutputLocation,
    Result, SessionInputs, SessionOptions, SessionOutputs, Tensor,
};
use tracing::{debug, info};

use crate::graph::{GraphHeader, ModelArtifacts, ModelWeights};
use crate::ops::{apply_rope, attention, matvec, mlp_swiglu, rms_norm};
use crate::provider::KernelMatrix;

/// Handle to a loaded graph.
pub type SessionHandle = CpuSession;

/// A loaded graph executing on the host CPU.
pub struct CpuSession {
    config: ModelConfig,
    options: SessionOptions,
    header: GraphHeader,
    weights: Option<ModelWeights>,
    arena: DeviceArena,
    runs: usize,
    profile: Vec<Duration>,
}

impl std::fmt::Debug for CpuSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuSession")
            .field("config", &self.config)
            .field("options", &self.options)
            .field("loaded", &self.weights.is_some())
            .field("runs", &self.runs)
            .finish()
    }
}

impl CpuSession {
    /// Load a graph from its serialized header and external weight shard.
    pub fn load(
        model_bytes: &[u8],
        external_weights: &[u8],
        config: ModelConfig,
        options: SessionOptions,
    ) -> Result<SessionHandle> {
        config.validate()?;
        KernelMatrix::probe()
            .validate(options.provider)
            .map_err(|e| EngineError::Load(e.to_string()))?;

        let header = GraphHeader::parse(model_bytes)?;
        header.check_config(&config)?;
        let weights = ModelWeights::from_shard(&header, external_weights)?;

        debug!(
            layers = header.num_hidden_layers,
            vocab = header.vocab_size,
            provider = %options.provider,
            output_location = ?options.output_location,
            "loaded cpu session"
        );

        Ok(Self {
            config,
            options,
            header,
            weights: Some(weights),
            arena: DeviceArena::new(),
            runs: 0,
            profile: Vec::new(),
        })
    }

    /// Load `graph.json`, `weights.bin` and `config.json` from `dir`.
    pub fn load_dir(dir: &Path, options: SessionOptions) -> Result<SessionHandle> {
        let artifacts = ModelArtifacts::in_dir(dir);
        let read = |path: &Path| {
            std::fs::read(path)
                .map_err(|e| EngineError::Load(format!("failed to read {}: {e}", path.display())))
        };
        let model_bytes = read(&artifacts.graph)?;
        let shard = read(&artifacts.weights)?;
        let config = ModelConfig::load(&artifacts.config)?;
        Self::load(&model_bytes, &shard, config, options)
    }

    /// Use `arena` for device-resident outputs instead of a private one.
    pub fn with_arena(mut self, arena: DeviceArena) -> Self {
        self.arena = arena;
        self
    }

    pub fn arena(&self) -> &DeviceArena {
        &self.arena
    }

    pub fn header(&self) -> &GraphHeader {
        &self.header
    }

    /// Number of forward passes run so far.
    pub fn runs(&self) -> usize {
        self.runs
    }

    /// Durations recorded since the last `end_profiling`.
    pub fn profiled_runs(&self) -> &[Duration] {
        &self.profile
    }

    fn forward(&self, weights: &ModelWeights, inputs: &SessionInputs<'_>) -> Result<SessionOutputs> {
        let h = &self.header;
        let (d, vocab, ff) = (h.hidden_size, h.vocab_size, h.ffn_size);
        let (n_heads, kv_heads) = (h.num_attention_heads, h.num_key_value_heads);
        let head_dim = d / n_heads;
        let kv_dim = kv_heads * head_dim;

        let n = inputs.input_ids.len();
        let past_len = inputs.past.seq_len();
        let total = past_len + n;

        // Per-layer caches laid out [kv_heads, total, head_dim], past copied in.
        let mut k_cache = Vec::with_capacity(h.num_hidden_layers);
        let mut v_cache = Vec::with_capacity(h.num_hidden_layers);
        for layer in 0..h.num_hidden_layers {
            for (slot, dst) in [
                (CacheSlot::key(layer), &mut k_cache),
                (CacheSlot::value(layer), &mut v_cache),
            ] {
                let past = inputs
                    .past
                    .get(slot)
                    .ok_or_else(|| EngineError::Inference(format!("missing input {}", slot.input_name())))?
                    .to_host()?;
                let mut buf = vec![0.0f32; kv_heads * total * head_dim];
                for head in 0..kv_heads {
                    let src = &past.data()[head * past_len * head_dim..(head + 1) * past_len * head_dim];
                    let at = head * total * head_dim;
                    buf[at..at + src.len()].copy_from_slice(src);
                }
                dst.push(buf);
            }
        }

        let mut logits = Vec::with_capacity(n * vocab);
        for (i, &token) in inputs.input_ids.iter().enumerate() {
            if token < 0 || token as usize >= vocab {
                return Err(EngineError::Inference(format!(
                    "token id {token} outside vocabulary of {vocab}"
                )));
            }
            let t = past_len + i;
            let position = match inputs.position_ids {
                Some(ids) if ids[i] >= 0 => ids[i] as usize,
                Some(ids) => {
                    return Err(EngineError::Inference(format!("negative position id {}", ids[i])))
                }
                None => t,
            };

            let row = token as usize * d;
            let mut x = weights.embed_tokens[row..row + d].to_vec();

            for (layer, lw) in weights.layers.iter().enumerate() {
                let xn = rms_norm(&x, &lw.attn_norm, h.norm_eps)?;
                let mut q = matvec(&xn, &lw.wq, d, d)?;
                let mut k = matvec(&xn, &lw.wk, d, kv_dim)?;
                let v = matvec(&xn, &lw.wv, d, kv_dim)?;
                apply_rope(&mut q, position, n_heads, head_dim, h.rope_base)?;
                apply_rope(&mut k, position, kv_heads, head_dim, h.rope_base)?;

                for head in 0..kv_heads {
                    let at = (head * total + t) * head_dim;
                    let src = head * head_dim..(head + 1) * head_dim;
                    k_cache[layer][at..at + head_dim].copy_from_slice(&k[src.clone()]);
                    v_cache[layer][at..at + head_dim].copy_from_slice(&v[src]);
                }

                let attn = attention(
                    &q,
                    &k_cache[layer],
                    &v_cache[layer],
                    total,
                    t + 1,
                    inputs.attention_mask,
                    n_heads,
                    kv_heads,
                    head_dim,
                )?;
                let proj = matvec(&attn, &lw.wo, d, d)?;
                x.iter_mut().zip(&proj).for_each(|(a, b)| *a += b);

                let xn2 = rms_norm(&x, &lw.mlp_norm, h.norm_eps)?;
                let mlp = mlp_swiglu(&xn2, &lw.w_gate, &lw.w_up, &lw.w_down, d, ff)?;
                x.iter_mut().zip(&mlp).for_each(|(a, b)| *a += b);
            }

            let hn = rms_norm(&x, &weights.final_norm, h.norm_eps)?;
            logits.extend(matvec(&hn, &weights.lm_head, d, vocab)?);
        }

        let shape = vec![1, kv_heads, total, head_dim];
        let mut present: Vec<(CacheSlot, Tensor)> = Vec::with_capacity(2 * h.num_hidden_layers);
        let produced = k_cache
            .into_iter()
            .zip(v_cache)
            .enumerate()
            .flat_map(|(l, (k, v))| [(CacheSlot::key(l), k), (CacheSlot::value(l), v)]);
        for (slot, data) in produced {
            match self.place(shape.clone(), data) {
                Ok(tensor) => present.push((slot, tensor)),
                Err(e) => {
                    for (_, t) in present {
                        let _ = t.dispose();
                    }
                    return Err(e);
                }
            }
        }

        Ok(SessionOutputs {
            logits: HostTensor::new(vec![1, n, vocab], logits)?,
            present,
        })
    }

    fn place(&self, shape: Vec<usize>, data: Vec<f32>) -> Result<Tensor> {
        match self.options.output_location {
            OutputLocation::Host => Ok(HostTensor::new(shape, data)?.into()),
            OutputLocation::Device => Ok(self.arena.upload(shape, data)?.into()),
        }
    }
}

impl InferenceSession for CpuSession {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn options(&self) -> &SessionOptions {
        &self.options
    }

    fn needs_position_ids(&self) -> bool {
        self.header.needs_position_ids
    }

    fn run(&mut self, inputs: SessionInputs<'_>) -> Result<SessionOutputs> {
        let weights = self
            .weights
            .as_ref()
            .ok_or_else(|| EngineError::Inference("session has been disposed".into()))?;
        inputs.validate(&self.config, self.header.needs_position_ids)?;

        let start = Instant::now();
        let outputs = self.forward(weights, &inputs)?;
        let elapsed = start.elapsed();

        self.runs += 1;
        if self.options.profiling {
            self.profile.push(elapsed);
        }
        debug!(
            run = self.runs,
            input_len = inputs.input_ids.len(),
            past_len = inputs.past.seq_len(),
            elapsed_us = elapsed.as_micros() as u64,
            "forward pass"
        );
        Ok(outputs)
    }

    fn end_profiling(&mut self) {
        if !self.options.profiling || self.profile.is_empty() {
            return;
        }
        let total: Duration = self.profile.iter().sum();
        let runs = self.profile.len();
        info!(
            runs,
            total_ms = total.as_secs_f64() * 1000.0,
            mean_ms = total.as_secs_f64() * 1000.0 / runs as f64,
            "profiling summary"
        );
        self.profile.clear();
    }

    fn dispose(&mut self) -> Result<()> {
        if self.weights.take().is_some() {
            debug!(
                live_buffers = self.arena.live_buffers(),
                "disposed cpu session"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{build_tiny_model, TinyModelSpec};
    use hearth_engine::ExecutionProvider;

    #[test]
    fn load_rejects_unusable_provider() {
        let (graph, shard, config) = build_tiny_model(&TinyModelSpec::default()).unwrap();
        let options = SessionOptions::default().with_provider(ExecutionProvider::Gpu);
        let err = CpuSession::load(&graph, &shard, config, options).unwrap_err();
        assert!(err.is_load());
    }

    #[test]
    fn load_rejects_missing_shard() {
        let (graph, _, config) = build_tiny_model(&TinyModelSpec::default()).unwrap();
        let err = CpuSession::load(&graph, &[], config, SessionOptions::default()).unwrap_err();
        assert!(err.is_load());
    }

    #[test]
    fn load_dir_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = CpuSession::load_dir(dir.path(), SessionOptions::default()).unwrap_err();
        assert!(err.is_load());
        assert!(err.to_string().contains("graph.json"));
    }
}
