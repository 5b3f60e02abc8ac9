//! Attention masks for memory-extended self-attention.
//!
//! Keys are laid out as `[memory | segment]`, queries are the trailing `q_len`
//! segment positions. Masks are `u8` with `1` for blocked positions, shaped
//! `[B or 1, 1, q_len, k_len]`.
//!
//! Key padding never blocks a query's own key, so a fully padded query row still
//! attends to itself instead of spreading uniformly over future positions.

use candle_core::{bail, DType, Device, Result, Tensor};

/// Most negative finite value representable in `dtype`.
pub fn mask_min_value(dtype: DType) -> f64 {
    match dtype {
        DType::F32 => f64::from(f32::MIN),
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Build the combined causal + key-padding mask.
///
/// - `key_padding`: optional `[B, S]` with `1` marking padded segment keys;
///   `S` must not exceed `k_len` (the remaining leading keys are memory).
///
/// Returns `None` when nothing is blocked by construction.
pub fn memory_attention_mask(
    q_len: usize,
    k_len: usize,
    causal: bool,
    key_padding: Option<&Tensor>,
    device: &Device,
) -> Result<Option<Tensor>> {
    if q_len > k_len {
        bail!("attention mask: {q_len} queries cannot exceed {k_len} keys");
    }
    if !causal && key_padding.is_none() {
        return Ok(None);
    }
    let offset = k_len - q_len;

    let (batch, padding) = match key_padding {
        Some(pad) => {
            let (batch, seg_len) = pad.dims2()?;
            if seg_len > k_len || seg_len < q_len {
                bail!(
                    "attention mask: padding covers {seg_len} keys, expected between {q_len} and {k_len}"
                );
            }
            let rows: Vec<Vec<u8>> = pad.to_dtype(DType::U8)?.to_vec2()?;
            (batch, Some((k_len - seg_len, rows)))
        }
        None => (1, None),
    };

    let mut data = vec![0u8; batch * q_len * k_len];
    for b in 0..batch {
        for i in 0..q_len {
            let own_key = offset + i;
            for j in 0..k_len {
                let mut blocked = causal && j > own_key;
                if let Some((mem_len, rows)) = &padding {
                    if j >= *mem_len && j != own_key && rows[b][j - mem_len] != 0 {
                        blocked = true;
                    }
                }
                if blocked {
                    data[(b * q_len + i) * k_len + j] = 1;
                }
            }
        }
    }

    Tensor::from_vec(data, (batch, 1, q_len, k_len), device).map(Some)
}

/// Prefix segment key padding `[B, S]` with memory key padding `[B, M]`.
/// A missing segment padding counts as nothing padded.
pub fn with_memory_padding(
    mem_mask: &Tensor,
    key_padding: Option<&Tensor>,
    seg_len: usize,
) -> Result<Tensor> {
    let (batch, _) = mem_mask.dims2()?;
    let mem_mask = mem_mask.to_dtype(DType::U8)?;
    let segment = match key_padding {
        Some(pad) => pad.to_dtype(DType::U8)?,
        None => Tensor::zeros((batch, seg_len), DType::U8, mem_mask.device())?,
    };
    Tensor::cat(&[&mem_mask, &segment], 1)
}

/// Replace blocked score entries with the dtype's most negative finite value.
pub fn apply_mask(scores: &Tensor, blocked: &Tensor) -> Result<Tensor> {
    let min_val = Tensor::new(mask_min_value(scores.dtype()), scores.device())?
        .to_dtype(scores.dtype())?
        .broadcast_as(scores.shape())?;
    blocked
        .broadcast_as(scores.shape())?
        .where_cond(&min_val, scores)
}
