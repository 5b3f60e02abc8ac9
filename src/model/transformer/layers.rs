//! Decoder layer: pre-norm memory attention + pre-norm feed-forward, both residual.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{Dropout, Init, Linear, VarBuilder};

use super::attention::{MemoryAttention, RopeTables};
use crate::config::DecoderConfig;
use crate::model::stack::{AttentionIntermediate, LayerCache};

/// LayerNorm over the last dimension, written with plain tensor ops so the
/// input and both affine parameters stay on the autograd graph.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(dim, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_f32 = x.to_dtype(DType::F32)?;
        let mean = x_f32.mean_keepdim(D::Minus1)?;
        let centered = x_f32.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        normed
            .to_dtype(x.dtype())?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Linear → GELU → dropout → Linear.
#[derive(Debug, Clone)]
pub struct FeedForward {
    proj_in: Linear,
    proj_out: Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(dim: usize, mult: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let inner = dim * mult;
        Ok(Self {
            proj_in: candle_nn::linear(dim, inner, vb.pp("proj_in"))?,
            proj_out: candle_nn::linear(inner, dim, vb.pp("proj_out"))?,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.proj_in.forward(x)?.gelu()?;
        let h = self.dropout.forward(&h, train)?;
        self.proj_out.forward(&h)
    }
}

#[derive(Debug, Clone)]
pub struct DecoderLayer {
    attn_norm: LayerNorm,
    attn: MemoryAttention,
    ff_norm: LayerNorm,
    ff: FeedForward,
}

impl DecoderLayer {
    pub fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attn_norm: LayerNorm::new(cfg.dim, cfg.norm_eps, vb.pp("attn_norm"))?,
            attn: MemoryAttention::new(
                cfg.dim,
                cfg.heads,
                cfg.head_dim(),
                cfg.attn_dropout,
                vb.pp("attn"),
            )?,
            ff_norm: LayerNorm::new(cfg.dim, cfg.norm_eps, vb.pp("ff_norm"))?,
            ff: FeedForward::new(cfg.dim, cfg.ff_mult, cfg.ff_dropout, vb.pp("ff"))?,
        })
    }

    /// Forward pass over the new positions `x: [B, Q, dim]`.
    ///
    /// Memory goes through the same norm as the layer input before it is
    /// projected to keys and values.
    pub fn forward(
        &self,
        x: &Tensor,
        mem: Option<&Tensor>,
        cache: Option<&LayerCache>,
        blocked: Option<&Tensor>,
        rope: Option<&RopeTables>,
        train: bool,
    ) -> Result<(Tensor, AttentionIntermediate, LayerCache)> {
        let normed = self.attn_norm.forward(x)?;
        let normed_mem = mem.map(|m| self.attn_norm.forward(m)).transpose()?;

        let (h, scores, keys, values) =
            self.attn
                .forward(&normed, normed_mem.as_ref(), cache, blocked, rope, train)?;
        let h = (x + h)?;

        let residual = &h;
        let out = self.ff.forward(&self.ff_norm.forward(&h)?, train)?;
        let out = (residual + out)?;

        let hiddens = match cache {
            Some(c) => Tensor::cat(&[&c.hiddens, x], 1)?,
            None => x.clone(),
        };
        Ok((
            out,
            scores,
            LayerCache {
                keys,
                values,
                hiddens,
            },
        ))
    }
}
