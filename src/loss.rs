//! Losses used by the composer and the chunked recurrence.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops;

/// Mean cross-entropy over the tokens whose label is not in `ignored`.
///
/// - `logits`: `[B, N, V]`
/// - `targets`: `[B, N]` integer labels
///
/// Returns `None` when every label is ignored. Ignored labels may lie outside
/// the vocabulary.
pub fn cross_entropy(logits: &Tensor, targets: &Tensor, ignored: &[u32]) -> Result<Option<Tensor>> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    let token_count = batch * seq_len;
    if targets.dims() != [batch, seq_len] {
        candle_core::bail!(
            "cross entropy: targets {:?} do not match logits {:?}",
            targets.dims(),
            logits.dims()
        );
    }
    if token_count == 0 {
        return Ok(None);
    }

    let targets = targets
        .to_device(logits.device())?
        .to_dtype(DType::U32)?
        .reshape(token_count)?;

    let mut valid = Tensor::ones(token_count, DType::U8, logits.device())?;
    for &sentinel in ignored {
        valid = (valid * targets.ne(sentinel)?)?;
    }
    let count = valid.to_dtype(DType::F32)?.sum_all()?.to_vec0::<f32>()?.round() as usize;
    if count == 0 {
        return Ok(None);
    }

    // Ignored labels are gathered at index 0 and zeroed out below.
    let safe_targets = valid.where_cond(&targets, &targets.zeros_like()?)?;
    let log_probs = ops::log_softmax(&logits.reshape((token_count, vocab))?, D::Minus1)?;
    let nll = log_probs
        .gather(&safe_targets.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;

    let weight = valid.to_dtype(nll.dtype())?;
    let loss = (nll * weight)?.sum_all()?.affine(1.0 / count as f64, 0.0)?;
    Ok(Some(loss))
}

/// Attention z-loss of one stack.
///
/// Sums the log-sum-exp of every layer's pre-softmax scores `[B, H, Q, K]`,
/// squares it, sums over heads and averages over batch and queries.
pub fn attn_z_loss(pre_softmax: &[Tensor], weight: f64) -> Result<Tensor> {
    let Some((first, rest)) = pre_softmax.split_first() else {
        candle_core::bail!("attention z-loss needs at least one layer");
    };
    let mut lse = logsumexp_last_dim(first)?;
    for scores in rest {
        lse = (lse + logsumexp_last_dim(scores)?)?;
    }
    let per_query = lse.sqr()?.sum(1)?; // [B, Q]
    per_query.mean_all()?.affine(weight, 0.0)
}

fn logsumexp_last_dim(x: &Tensor) -> Result<Tensor> {
    let x = x.to_dtype(DType::F32)?;
    let max = x.max_keepdim(D::Minus1)?.detach();
    let shifted = x.broadcast_sub(&max)?;
    let lse = shifted.exp()?.sum_keepdim(D::Minus1)?.log()?;
    (lse + max)?.squeeze(D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: &Tensor) -> f32 {
        t.to_vec0().unwrap()
    }

    #[test]
    fn uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros((2, 3, 8), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu).unwrap();
        let loss = cross_entropy(&logits, &targets, &[]).unwrap().unwrap();
        assert!((scalar(&loss) - (8f32).ln()).abs() < 1e-5);
    }

    #[test]
    fn ignored_labels_do_not_count() {
        // Row 0 predicts its label confidently, row 1 is ignored.
        let logits = Tensor::new(
            &[[[10.0f32, 0.0, 0.0], [0.0, 0.0, 0.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let with_ignored = Tensor::new(&[[0u32, 99]], &Device::Cpu).unwrap();
        let only_first = cross_entropy(&logits.narrow(1, 0, 1).unwrap(), &with_ignored.narrow(1, 0, 1).unwrap(), &[])
            .unwrap()
            .unwrap();
        let masked = cross_entropy(&logits, &with_ignored, &[99]).unwrap().unwrap();
        assert!((scalar(&masked) - scalar(&only_first)).abs() < 1e-6);
    }

    #[test]
    fn all_ignored_is_none() {
        let logits = Tensor::zeros((1, 4, 5), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32, 0, 7, 7]], &Device::Cpu).unwrap();
        assert!(cross_entropy(&logits, &targets, &[0, 7]).unwrap().is_none());
    }

    #[test]
    fn z_loss_of_uniform_scores() {
        // logsumexp of 4 zeros is ln 4; two layers sum to 2 ln 4, two heads.
        let scores = Tensor::zeros((1, 2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let loss = attn_z_loss(&[scores.clone(), scores], 0.5).unwrap();
        let lse = 2.0 * (4f32).ln();
        let expected = 0.5 * 2.0 * lse * lse;
        assert!((scalar(&loss) - expected).abs() < 1e-4);
    }

    #[test]
    fn z_loss_ignores_masked_scores() {
        let scores = Tensor::new(&[[[[0.0f32, f32::MIN]]]], &Device::Cpu).unwrap();
        let loss = attn_z_loss(&[scores], 1.0).unwrap();
        assert!(scalar(&loss).abs() < 1e-6);
    }
}
