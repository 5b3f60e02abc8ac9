//! Reference attention stack.
//!
//! A pre-norm decoder in the Transformer-XL style:
//! - every layer attends over `[memory | segment]`, memory being read-only context
//! - keys and values of the segment are cached so a segment can be extended one
//!   position at a time
//! - optional rotary positions inside attention (absolute positions are then
//!   turned off in the composer)
//!
//! ```text
//! x ─→ [norm → attn(mem, cache) → +] → [norm → ff → +] ─→ ... ─→ norm ─→ out
//! ```

pub mod attention;
pub mod layers;
pub mod mask;
pub mod rope;

use candle_core::{bail, DType, Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::DecoderConfig;
use crate::model::stack::{AttentionStack, LayerIntermediates, StackArgs, StackCache};
use attention::RopeTables;
use layers::{DecoderLayer, LayerNorm};
use rope::RotaryEmbedding;

/// Stack of [`DecoderLayer`]s with a final LayerNorm.
#[derive(Debug, Clone)]
pub struct Decoder {
    layers: Vec<DecoderLayer>,
    final_norm: LayerNorm,
    rope: Option<RotaryEmbedding>,
    dim: usize,
    causal: bool,
}

impl Decoder {
    pub fn new(cfg: &DecoderConfig, vb: VarBuilder) -> crate::Result<Self> {
        cfg.validate()?;
        let layers = (0..cfg.depth)
            .map(|i| DecoderLayer::new(cfg, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = LayerNorm::new(cfg.dim, cfg.norm_eps, vb.pp("final_norm"))?;
        let rope = cfg
            .rotary_pos_emb
            .then(|| RotaryEmbedding::new(cfg.head_dim(), cfg.rotary_theta));
        Ok(Self {
            layers,
            final_norm,
            rope,
            dim: cfg.dim,
            causal: cfg.causal,
        })
    }

    /// Rotary tables for `k_len` keys and the trailing `q_len` queries.
    fn rope_tables(
        &self,
        rope: &RotaryEmbedding,
        q_len: usize,
        k_len: usize,
        seq_start_pos: Option<&Tensor>,
        dtype: DType,
        device: &candle_core::Device,
    ) -> Result<RopeTables> {
        let (cos_k, sin_k) = match seq_start_pos {
            Some(start) => {
                let positions = Tensor::arange(0u32, k_len as u32, device)?
                    .to_dtype(DType::F32)?
                    .unsqueeze(0)?
                    .broadcast_sub(&start.to_dtype(DType::F32)?.unsqueeze(1)?)?
                    .clamp(0f32, f32::MAX)?;
                rope.freqs_at(&positions, dtype)?
            }
            None => rope.compute_freqs(0, k_len, dtype, device)?,
        };
        let rank = cos_k.rank();
        let offset = k_len - q_len;
        Ok(RopeTables {
            cos_q: cos_k.narrow(rank - 2, offset, q_len)?,
            sin_q: sin_k.narrow(rank - 2, offset, q_len)?,
            cos_k,
            sin_k,
        })
    }
}

impl AttentionStack for Decoder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn depth(&self) -> usize {
        self.layers.len()
    }

    fn disables_abs_pos_emb(&self) -> bool {
        self.rope.is_some()
    }

    fn forward(&self, x: &Tensor, args: StackArgs<'_>) -> Result<(Tensor, LayerIntermediates)> {
        let (_, q_len, _) = x.dims3()?;
        let depth = self.layers.len();

        if let Some(mems) = args.mems {
            if mems.len() != depth {
                bail!("decoder: got {} memories for {depth} layers", mems.len());
            }
        }
        if let Some(cache) = args.cache {
            if cache.depth() != depth {
                bail!("decoder: cache has {} layers, expected {depth}", cache.depth());
            }
        }
        let cache_len = args.cache.map_or(0, StackCache::seq_len);
        let seg_len = cache_len + q_len;
        if let Some(mask) = args.mask {
            let mask_len = mask.dim(1)?;
            if mask_len != seg_len {
                bail!("decoder: mask covers {mask_len} positions, segment has {seg_len}");
            }
        }

        if let Some(mem_mask) = args.mem_mask {
            let Some(mems) = args.mems else {
                bail!("decoder: memory mask given without memories");
            };
            let mask_len = mem_mask.dim(1)?;
            for m in mems {
                let mem_len = m.dim(1)?;
                if mem_len != mask_len {
                    bail!("decoder: memory mask covers {mask_len} keys, memory has {mem_len}");
                }
            }
        }
        let key_padding = args
            .mem_mask
            .map(|m| mask::with_memory_padding(m, args.mask, seg_len))
            .transpose()?;
        let key_padding = key_padding.as_ref().or(args.mask);

        let mut h = x.clone();
        let mut attn = Vec::with_capacity(depth);
        let mut caches = Vec::with_capacity(depth);

        for (i, layer) in self.layers.iter().enumerate() {
            let mem = args.mems.map(|m| &m[i]);
            let k_len = seg_len + mem.map_or(Ok(0), |m| m.dim(1))?;

            let blocked =
                mask::memory_attention_mask(q_len, k_len, self.causal, key_padding, x.device())?;
            let rope = self
                .rope
                .as_ref()
                .map(|r| self.rope_tables(r, q_len, k_len, args.seq_start_pos, x.dtype(), x.device()))
                .transpose()?;

            let layer_cache = args.cache.map(|c| &c.layers[i]);
            let (out, scores, cache) = layer.forward(
                &h,
                mem,
                layer_cache,
                blocked.as_ref(),
                rope.as_ref(),
                args.train,
            )?;
            h = out;
            attn.push(scores);
            caches.push(cache);
        }

        let out = self.final_norm.forward(&h)?;
        let hiddens = caches.iter().map(|c| c.hiddens.clone()).collect();
        let intermediates = LayerIntermediates {
            hiddens,
            attn,
            cache: StackCache::new(caches)?,
            mems: None,
            attn_z_loss: None,
        };
        Ok((out, intermediates))
    }
}
