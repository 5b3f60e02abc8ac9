//! Rotary position embedding (RoPE).
//!
//! Keys of a memory-extended attention call occupy positions `0..k_len`
//! (memory first, then the segment); queries are the trailing `q_len` of those,
//! so they are rotated starting at `k_len - q_len`.

use candle_core::{DType, Device, Result, Tensor, D};

/// Rotary embedding tables, computed on demand for any position range.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    head_dim: usize,
    theta: f64,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, theta: f64) -> Self {
        Self { head_dim, theta }
    }

    /// Compute cos and sin tables for positions `start..start + len`.
    ///
    /// Returns `(cos, sin)` each of shape `[len, head_dim]`.
    pub fn compute_freqs(
        &self,
        start: usize,
        len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        let positions: Vec<f32> = (start..start + len).map(|i| i as f32).collect();
        let positions = Tensor::from_vec(positions, len, device)?;
        self.freqs_at(&positions, dtype)
    }

    /// Cos and sin tables for explicit positions of shape `[S]` or `[B, S]`.
    ///
    /// Returns tables shaped `[S, head_dim]` or `[B, S, head_dim]`.
    pub fn freqs_at(&self, positions: &Tensor, dtype: DType) -> Result<(Tensor, Tensor)> {
        let half_dim = self.head_dim / 2;

        // inv_freq = 1 / (theta ^ (2i / head_dim)) for i in 0..half_dim
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / self.theta.powf(2.0 * i as f64 / self.head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, half_dim, positions.device())?;

        // freqs = outer(positions, inv_freq)
        let freqs = positions
            .to_dtype(DType::F32)?
            .unsqueeze(D::Minus1)?
            .broadcast_mul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
    }

    /// Apply rotary embedding to `x` of shape `[B, H, S, D]`; `cos`/`sin` are
    /// `[S, D]` or per-batch `[B, S, D]`.
    pub fn apply(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let lift = |t: &Tensor| -> Result<Tensor> {
            let t = t.to_dtype(DType::F32)?;
            if t.rank() == 2 {
                t.unsqueeze(0)?.unsqueeze(0)
            } else {
                t.unsqueeze(1)
            }
        };
        let cos = lift(cos)?;
        let sin = lift(sin)?;

        // rotate_half: [-x[..., D/2:], x[..., :D/2]]
        let half = x.dim(D::Minus1)? / 2;
        let x_first = x.narrow(D::Minus1, 0, half)?;
        let x_second = x.narrow(D::Minus1, half, half)?;
        let x_rotated = Tensor::cat(&[&x_second.neg()?, &x_first], D::Minus1)?;

        let result = (x.broadcast_mul(&cos)? + x_rotated.broadcast_mul(&sin)?)?;
        result.to_dtype(x_dtype)
    }
}
