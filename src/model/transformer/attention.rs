//! Scaled dot-product self-attention over `[memory | cached segment | new positions]`.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Dropout, Linear, VarBuilder};

use super::mask::apply_mask;
use super::rope::RotaryEmbedding;
use crate::model::stack::{AttentionIntermediate, LayerCache};

/// Rotary tables for keys and queries of one call.
///
/// Keys cover positions `0..k_len` (memory first); queries are the last `q_len`.
pub struct RopeTables {
    pub cos_k: Tensor,
    pub sin_k: Tensor,
    pub cos_q: Tensor,
    pub sin_q: Tensor,
}

/// Multi-head self-attention with memory keys and an incremental cache.
#[derive(Debug, Clone)]
pub struct MemoryAttention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
}

impl MemoryAttention {
    pub fn new(
        dim: usize,
        num_heads: usize,
        head_dim: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner_dim = num_heads * head_dim;
        Ok(Self {
            to_q: candle_nn::linear_no_bias(dim, inner_dim, vb.pp("to_q"))?,
            to_k: candle_nn::linear_no_bias(dim, inner_dim, vb.pp("to_k"))?,
            to_v: candle_nn::linear_no_bias(dim, inner_dim, vb.pp("to_v"))?,
            to_out: candle_nn::linear(inner_dim, dim, vb.pp("to_out"))?,
            dropout: Dropout::new(dropout),
            num_heads,
            head_dim,
        })
    }

    /// `[B, S, H*D]` → `[B, H, S, D]`
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        x.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Forward pass.
    ///
    /// - `x`: normed new positions `[B, Q, dim]`
    /// - `mem`: normed memory `[B, M, dim]`
    /// - `cache`: keys/values of the earlier positions of this segment
    /// - `blocked`: `[B|1, 1, Q, M + C + Q]`, `1` = masked
    ///
    /// Returns the output `[B, Q, dim]`, the scores, and keys/values of the
    /// segment so far (the `hiddens` field is left for the caller to fill).
    pub fn forward(
        &self,
        x: &Tensor,
        mem: Option<&Tensor>,
        cache: Option<&LayerCache>,
        blocked: Option<&Tensor>,
        rope: Option<&RopeTables>,
        train: bool,
    ) -> Result<(Tensor, AttentionIntermediate, Tensor, Tensor)> {
        let (batch, q_len, _) = x.dims3()?;

        let q = self.split_heads(&self.to_q.forward(x)?)?;
        let k_new = self.split_heads(&self.to_k.forward(x)?)?;
        let v_new = self.split_heads(&self.to_v.forward(x)?)?;

        let (seg_k, seg_v) = match cache {
            Some(c) => (
                Tensor::cat(&[&c.keys, &k_new], 2)?,
                Tensor::cat(&[&c.values, &v_new], 2)?,
            ),
            None => (k_new, v_new),
        };

        let (k, v) = match mem {
            Some(mem) => {
                let mem_k = self.split_heads(&self.to_k.forward(mem)?)?;
                let mem_v = self.split_heads(&self.to_v.forward(mem)?)?;
                (
                    Tensor::cat(&[&mem_k, &seg_k], 2)?,
                    Tensor::cat(&[&mem_v, &seg_v], 2)?,
                )
            }
            None => (seg_k.clone(), seg_v.clone()),
        };

        let (q, k) = match rope {
            Some(t) => (
                RotaryEmbedding::apply(&q, &t.cos_q, &t.sin_q)?,
                RotaryEmbedding::apply(&k, &t.cos_k, &t.sin_k)?,
            ),
            None => (q, k),
        };

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? / scale)?;
        let scores = match blocked {
            Some(blocked) => apply_mask(&scores, blocked)?,
            None => scores,
        };

        let attn = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let dropped = self.dropout.forward(&attn, train)?;
        let out = dropped.matmul(&v.contiguous()?)?; // [B, H, Q, D]

        let out = out
            .transpose(1, 2)?
            .reshape((batch, q_len, self.num_heads * self.head_dim))?;
        let out = self.to_out.forward(&out)?;

        let intermediate = AttentionIntermediate {
            pre_softmax: scores,
            post_softmax: attn,
        };
        Ok((out, intermediate, seg_k, seg_v))
    }
}
