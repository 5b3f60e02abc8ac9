//! Logit filters and per-row token sampling.
//!
//! Sampling runs on the CPU: logits are filtered, scaled by the temperature,
//! turned into probabilities and sampled by walking the CDF with a seeded
//! [`ChaCha8Rng`]. A temperature of zero means greedy argmax.

use candle_core::{DType, Device, Result, Tensor, D};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Transforms `[B, V]` logits before sampling; removed entries become `-inf`.
pub trait LogitFilter: Send + Sync {
    fn apply(&self, logits: &Tensor) -> Result<Tensor>;
}

/// Keep the `k` largest logits per row.
///
/// `k` defaults to `ceil((1 - thres) * V)`, i.e. the top 10% at the default
/// threshold of 0.9.
#[derive(Debug, Clone, Copy)]
pub struct TopK {
    pub thres: f64,
    pub k: Option<usize>,
}

impl Default for TopK {
    fn default() -> Self {
        Self { thres: 0.9, k: None }
    }
}

impl TopK {
    fn k_for(&self, vocab: usize) -> usize {
        let k = self
            .k
            .unwrap_or_else(|| ((1.0 - self.thres) * vocab as f64).ceil() as usize);
        k.clamp(1, vocab.max(1))
    }
}

impl LogitFilter for TopK {
    fn apply(&self, logits: &Tensor) -> Result<Tensor> {
        let k = self.k_for(logits.dim(D::Minus1)?);
        map_rows(logits, |row| {
            let mut sorted = row.to_vec();
            sorted.sort_by(|a, b| b.total_cmp(a));
            let cutoff = sorted[k - 1];
            for v in row.iter_mut() {
                if *v < cutoff {
                    *v = f32::NEG_INFINITY;
                }
            }
        })
    }
}

/// Nucleus filtering: keep the smallest prefix of the sorted distribution whose
/// probability mass exceeds `thres`.
#[derive(Debug, Clone, Copy)]
pub struct TopP {
    pub thres: f64,
}

impl Default for TopP {
    fn default() -> Self {
        Self { thres: 0.9 }
    }
}

impl LogitFilter for TopP {
    fn apply(&self, logits: &Tensor) -> Result<Tensor> {
        let thres = self.thres;
        map_rows(logits, |row| {
            let mut order: Vec<usize> = (0..row.len()).collect();
            order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));

            let max = row[order[0]];
            let total: f64 = row.iter().map(|&v| f64::from(v - max).exp()).sum();
            let mut cumulative = 0.0f64;
            let mut removing = false;
            for &idx in &order {
                // The entry that crosses the threshold is kept.
                if removing {
                    row[idx] = f32::NEG_INFINITY;
                    continue;
                }
                cumulative += f64::from(row[idx] - max).exp() / total;
                if cumulative > thres {
                    removing = true;
                }
            }
        })
    }
}

/// Pass-through.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFilter;

impl LogitFilter for NoFilter {
    fn apply(&self, logits: &Tensor) -> Result<Tensor> {
        Ok(logits.clone())
    }
}

/// Apply `f` to every row of a `[B, V]` tensor on the CPU.
fn map_rows(logits: &Tensor, mut f: impl FnMut(&mut [f32])) -> Result<Tensor> {
    let (batch, vocab) = logits.dims2()?;
    let mut rows: Vec<Vec<f32>> = logits
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .to_vec2()?;
    for row in rows.iter_mut() {
        f(row);
    }
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Tensor::from_vec(flat, (batch, vocab), logits.device())?.to_dtype(logits.dtype())
}

/// Sample one token per row of `[B, V]` logits.
pub fn sample_next(
    logits: &Tensor,
    temperature: f64,
    filter: &dyn LogitFilter,
    rng: &mut ChaCha8Rng,
) -> Result<Vec<u32>> {
    let logits = logits.to_dtype(DType::F32)?;
    if temperature <= 0.0 {
        return logits.argmax(D::Minus1)?.to_vec1::<u32>();
    }
    let filtered = filter.apply(&logits)?;
    let probs = candle_nn::ops::softmax_last_dim(&(filtered / temperature)?)?;
    let rows: Vec<Vec<f32>> = probs.to_device(&Device::Cpu)?.to_vec2()?;
    Ok(rows.iter().map(|row| sample_multinomial(row, rng)).collect())
}

/// Draw a uniform sample in [0,1) and walk the CDF of `probs`.
fn sample_multinomial(probs: &[f32], rng: &mut ChaCha8Rng) -> u32 {
    let sample: f64 = rng.random();
    let mut cumulative = 0.0f64;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p as f64;
        if sample < cumulative {
            return i as u32;
        }
    }
    // Floating-point rounding: fall back to the last token with mass.
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .unwrap_or(probs.len().saturating_sub(1)) as u32
}
