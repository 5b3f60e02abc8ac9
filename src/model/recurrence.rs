//! Chunked XL-style recurrence over a [`MultiStreamComposer`].
//!
//! Sequences longer than the composer's window are processed window by window:
//! memories flow from each window into the next, the per-stream losses of every
//! window are weighted by the window's share of the sequence, and fully padded
//! windows are excluded with a compensating renormalisation.
//!
//! Generation rolls memory forward over the full leading windows of the prompt,
//! then samples one multi-stream token at a time, threading the incremental
//! cache inside a window and committing memories at every window boundary.

use std::collections::BTreeMap;

use candle_core::{DType, IndexOp, Tensor, Var, D};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::RecurrenceConfig;
use crate::loss::cross_entropy;
use crate::model::branch::{Caches, Memories};
use crate::model::composer::{ComposerOutput, ForwardArgs, MultiStreamComposer};
use crate::sampling::{sample_next, LogitFilter, TopK};
use crate::{Error, Result};

/// Per-call options of [`ChunkedRecurrence::forward`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkedLossArgs<'a> {
    /// Memories carried in ahead of the first window.
    pub mems: Option<&'a Memories>,
    /// Return the concatenated per-stream logits.
    pub return_outputs: bool,
    /// Return the memories after every processed window (implies `return_outputs`).
    pub return_mems: bool,
    /// Overrides the configured per-output loss weights.
    pub loss_weights: Option<&'a [f64]>,
    /// One name → `[B, N]` ids map per stream, aligned with the full sequence.
    /// Each window receives its own slice.
    pub embed_ids: Option<&'a [BTreeMap<String, Tensor>]>,
    /// One `[B, N, width]` tensor per stream, sliced per window like `embed_ids`.
    pub sum_embeds: Option<&'a [Tensor]>,
    pub train: bool,
}

/// Result of [`ChunkedRecurrence::forward`].
#[derive(Debug, Clone)]
pub struct ChunkedLoss {
    /// Scalar loss.
    pub loss: Tensor,
    /// `[B, N', V]` per output stream over the processed windows.
    pub logits: Option<Vec<Tensor>>,
    /// Memories after every processed window. Empty when the composer's
    /// memory cap is `0`, since such a composer keeps no memories.
    pub mems: Option<Vec<Memories>>,
}

/// Options of [`ChunkedRecurrence::generate`].
pub struct GenerateOptions {
    /// `0` samples greedily.
    pub temperature: f64,
    pub filter: Box<dyn LogitFilter>,
    /// Joint end vector, one id per stream.
    pub eos_token: Option<Vec<u32>>,
    /// Per-stream end ids, stream index → id.
    pub index_eos_token: Option<BTreeMap<usize, u32>>,
    /// Memories carried in ahead of the prompt.
    pub mems: Option<Memories>,
    /// Auxiliary ids per stream covering the prompt and every generated
    /// position, `[B, T + seq_len]`.
    pub embed_ids: Option<Vec<BTreeMap<String, Tensor>>>,
    /// Summed embeddings per stream, `[B, T + seq_len, width]`.
    pub sum_embeds: Option<Vec<Tensor>>,
    pub seed: u64,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            filter: Box::new(TopK::default()),
            eos_token: None,
            index_eos_token: None,
            mems: None,
            embed_ids: None,
            sum_embeds: None,
            seed: 0,
        }
    }
}

/// Running state of generation. Memory and position only change at window
/// boundaries; the cache is replaced after every call.
struct GenerationState {
    out: Tensor,
    curr_pos: usize,
    curr_mems: Option<Memories>,
    cache: Option<Caches>,
}

impl GenerationState {
    /// The part of the output that belongs to the current window.
    fn window(&self) -> Result<Tensor> {
        let len = self.out.dim(1)?;
        Ok(self.out.narrow(1, self.curr_pos, len - self.curr_pos)?)
    }

    /// Append `sample: [B, 1, K]` produced by `call`. If the window fed to
    /// `call` filled a whole segment, its memories are committed and the
    /// cache starts over.
    fn advance(self, sample: &Tensor, call: ComposerOutput, window_len: usize) -> Result<Self> {
        let len = self.out.dim(1)?;
        let at_boundary = len % window_len == 0;
        let out = Tensor::cat(&[&self.out, sample], 1)?;
        if at_boundary {
            tracing::debug!(position = len, "window boundary, committing memories");
            Ok(Self {
                out,
                curr_pos: len,
                curr_mems: call.mems,
                cache: None,
            })
        } else {
            Ok(Self {
                out,
                curr_pos: self.curr_pos,
                curr_mems: self.curr_mems,
                cache: Some(call.cache),
            })
        }
    }
}

/// Per-stream auxiliary inputs cut down to one window.
struct WindowAux {
    embed_ids: Option<Vec<BTreeMap<String, Tensor>>>,
    sum_embeds: Option<Vec<Tensor>>,
}

impl WindowAux {
    /// Slice `[start, start + len)` out of sequence-aligned auxiliary inputs.
    fn slice(
        embed_ids: Option<&[BTreeMap<String, Tensor>]>,
        sum_embeds: Option<&[Tensor]>,
        start: usize,
        len: usize,
    ) -> Result<Self> {
        let embed_ids = embed_ids
            .map(|streams| {
                streams
                    .iter()
                    .map(|ids| {
                        ids.iter()
                            .map(|(name, t)| -> Result<(String, Tensor)> {
                                Ok((name.clone(), t.narrow(1, start, len)?))
                            })
                            .collect::<Result<BTreeMap<_, _>>>()
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;
        let sum_embeds = sum_embeds
            .map(|streams| {
                streams
                    .iter()
                    .map(|t| -> Result<Tensor> { Ok(t.narrow(1, start, len)?) })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;
        Ok(Self { embed_ids, sum_embeds })
    }
}

/// Auxiliary inputs must span at least `needed` positions.
fn check_aux_len(
    embed_ids: Option<&[BTreeMap<String, Tensor>]>,
    sum_embeds: Option<&[Tensor]>,
    needed: usize,
) -> Result<()> {
    let ids = embed_ids.into_iter().flatten().flat_map(|m| m.iter());
    for (name, t) in ids {
        let len = t.dim(1)?;
        if len < needed {
            return Err(Error::usage(format!(
                "embed_ids '{name}' cover {len} positions, {needed} needed"
            )));
        }
    }
    for t in sum_embeds.into_iter().flatten() {
        let len = t.dim(1)?;
        if len < needed {
            return Err(Error::usage(format!(
                "sum_embeds cover {len} positions, {needed} needed"
            )));
        }
    }
    Ok(())
}

/// Weighted sum of one window's per-output losses. `None` terms (every label
/// ignored) and NaN terms are left out; `None` when nothing remains.
fn combine_stream_losses(
    terms: &[Option<Tensor>],
    weights: &[f64],
    window: usize,
) -> Result<Option<Tensor>> {
    let mut total: Option<Tensor> = None;
    for (i, (term, &weight)) in terms.iter().zip(weights).enumerate() {
        let Some(term) = term else {
            continue;
        };
        if term.to_dtype(DType::F32)?.to_scalar::<f32>()?.is_nan() {
            tracing::warn!(window, stream = i, "NaN loss term skipped");
            continue;
        }
        let weighted = term.affine(weight, 0.0)?;
        total = Some(match total {
            Some(acc) => (acc + weighted)?,
            None => weighted,
        });
    }
    Ok(total)
}

/// Segment-recurrent training and sampling wrapper.
pub struct ChunkedRecurrence {
    net: MultiStreamComposer,
    pad_value: Vec<u32>,
    ignore_index: Option<u32>,
    loss_weights: Vec<f64>,
    max_seq_len: usize,
}

impl ChunkedRecurrence {
    /// Wrap `net`; each stream's padding sentinel becomes its token embedding's
    /// padding index.
    pub fn new(mut net: MultiStreamComposer, cfg: RecurrenceConfig) -> Result<Self> {
        let num_inputs = net.num_inputs();
        let num_outputs = net.num_outputs();
        if num_outputs != num_inputs {
            return Err(Error::config(format!(
                "chunked recurrence predicts its own inputs: {num_outputs} outputs for {num_inputs} inputs"
            )));
        }
        if cfg.pad_value.len() != num_inputs {
            return Err(Error::config(format!(
                "got {} padding values for {num_inputs} streams",
                cfg.pad_value.len()
            )));
        }
        let loss_weights = cfg.loss_weights.unwrap_or_else(|| vec![1.0; num_outputs]);
        if loss_weights.len() != num_outputs {
            return Err(Error::config(format!(
                "got {} loss weights for {num_outputs} outputs",
                loss_weights.len()
            )));
        }
        let max_seq_len = net.max_seq_len();
        if max_seq_len == 0 {
            return Err(Error::config("chunked recurrence needs a non-zero max_seq_len"));
        }
        for (i, &pad) in cfg.pad_value.iter().enumerate() {
            let vocab = net.config().num_tokens[i];
            if pad as usize >= vocab {
                return Err(Error::config(format!(
                    "padding value {pad} of stream {i} is outside its vocabulary of {vocab}"
                )));
            }
            net.set_padding_idx(i, Some(pad))?;
        }
        tracing::info!(
            streams = num_inputs,
            window = max_seq_len,
            max_mem_len = net.config().max_mem_len,
            "wrapped composer in chunked recurrence"
        );
        Ok(Self {
            net,
            pad_value: cfg.pad_value,
            ignore_index: cfg.ignore_index,
            loss_weights,
            max_seq_len,
        })
    }

    pub fn net(&self) -> &MultiStreamComposer {
        &self.net
    }

    pub fn pad_value(&self) -> &[u32] {
        &self.pad_value
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    fn stream_ids(&self, x: &Tensor) -> Result<Tensor> {
        let k = self.net.num_inputs();
        match x.dims() {
            [_, _] if k == 1 => Ok(x.unsqueeze(D::Minus1)?.to_dtype(DType::U32)?),
            [_, _, last] if *last == k => Ok(x.to_dtype(DType::U32)?),
            dims => Err(Error::usage(format!(
                "expected token ids [B, N, {k}], got {dims:?}"
            ))),
        }
    }

    /// `[B, N]` mask, `1` where every stream holds its padding value.
    fn padding_mask(&self, chunk: &Tensor) -> Result<Tensor> {
        let k = self.pad_value.len();
        let pad = Tensor::new(self.pad_value.as_slice(), chunk.device())?;
        let matches = chunk
            .broadcast_eq(&pad)?
            .to_dtype(DType::U32)?
            .sum(D::Minus1)?;
        Ok(matches.eq(k as u32)?)
    }

    /// Length-weighted multi-stream loss over `x: [B, N, K]`.
    pub fn forward(&self, x: &Tensor, args: ChunkedLossArgs<'_>) -> Result<ChunkedLoss> {
        let x = self.stream_ids(x)?;
        let (batch, total, _) = x.dims3()?;
        if total < 2 {
            return Err(Error::usage("need at least two positions to build inputs and labels"));
        }
        let weights = args.loss_weights.unwrap_or(&self.loss_weights);
        if weights.len() != self.net.num_outputs() {
            return Err(Error::usage(format!(
                "got {} loss weights for {} outputs",
                weights.len(),
                self.net.num_outputs()
            )));
        }
        let return_outputs = args.return_outputs || args.return_mems;

        check_aux_len(args.embed_ids, args.sum_embeds, total)?;

        let seq_len = total - 1;
        let inputs = x.narrow(1, 0, seq_len)?;
        let labels = x.narrow(1, 1, seq_len)?;

        let mut mems = args.mems.cloned();
        let mut total_loss: Option<Tensor> = None;
        let mut padding_adjustment = 0f64;
        let mut logits_total: Option<Vec<Tensor>> = None;
        let mut mems_total = Vec::new();

        let mut start = 0;
        let mut window = 0;
        while start < seq_len {
            let len = self.max_seq_len.min(seq_len - start);
            let fraction = len as f64 / seq_len as f64;
            let chunk = inputs.narrow(1, start, len)?;
            let chunk_labels = labels.narrow(1, start, len)?;
            let aux = WindowAux::slice(args.embed_ids, args.sum_embeds, start, len)?;
            start += len;
            window += 1;

            let mask = self.padding_mask(&chunk)?;
            let padded = mask.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()? as usize;
            if padded == batch * len {
                padding_adjustment += fraction;
                tracing::debug!(window, len, "fully padded window skipped");
                continue;
            }

            let out = self.net.forward(
                &chunk,
                ForwardArgs {
                    mask: Some(&mask),
                    mems: mems.as_ref(),
                    embed_ids: aux.embed_ids.as_deref(),
                    sum_embeds: aux.sum_embeds.as_deref(),
                    return_mems: true,
                    train: args.train,
                    ..Default::default()
                },
            )?;
            mems = out.mems;

            let mut terms = Vec::with_capacity(out.logits.len());
            for (i, logits) in out.logits.iter().enumerate() {
                let mut ignored = vec![self.pad_value[i]];
                ignored.extend(self.ignore_index);
                let targets = chunk_labels.i((.., .., i))?.contiguous()?;
                terms.push(cross_entropy(logits, &targets, &ignored)?);
            }
            let window_loss = combine_stream_losses(&terms, weights, window)?;

            if return_outputs {
                logits_total = Some(match logits_total {
                    None => out.logits,
                    Some(acc) => acc
                        .iter()
                        .zip(out.logits.iter())
                        .map(|(a, l)| Tensor::cat(&[a, l], 1))
                        .collect::<candle_core::Result<Vec<_>>>()?,
                });
            }
            if args.return_mems {
                mems_total.extend(mems.clone());
            }

            match window_loss {
                Some(loss) => {
                    let scaled = loss.affine(fraction, 0.0)?;
                    total_loss = Some(match total_loss {
                        Some(acc) => (acc + scaled)?,
                        None => scaled,
                    });
                    tracing::debug!(window, len, padding_adjustment, "window counted");
                }
                None => {
                    padding_adjustment += fraction;
                    tracing::debug!(window, len, "every output stream ignored, window skipped");
                }
            }
        }

        let loss = match total_loss {
            // Nothing counted: a tracked zero keeps the caller's backward uniform.
            None => Var::zeros((), DType::F32, x.device())?.as_tensor().clone(),
            Some(loss) if padding_adjustment > 0.0 && padding_adjustment < 1.0 => {
                loss.affine(1.0 / (1.0 - padding_adjustment), 0.0)?
            }
            Some(loss) => loss,
        };

        Ok(ChunkedLoss {
            loss,
            logits: if return_outputs { logits_total } else { None },
            mems: args.return_mems.then_some(mems_total),
        })
    }

    /// Sample `seq_len` new positions after `prompts: [B, T, K]`.
    ///
    /// Returns only the new positions, `[B, seq_len, K]`. Rows that hit an end
    /// condition are filled with the padding values after the end token.
    pub fn generate(&self, prompts: &Tensor, seq_len: usize, opts: &GenerateOptions) -> Result<Tensor> {
        let prompts = self.stream_ids(prompts)?;
        let (batch, prompt_len, k) = prompts.dims3()?;
        if prompt_len == 0 {
            return Err(Error::usage("generation needs a non-empty prompt"));
        }
        if let Some(eos) = &opts.eos_token {
            if eos.len() != k {
                return Err(Error::usage(format!(
                    "end-of-sequence vector has {} ids for {k} streams",
                    eos.len()
                )));
            }
        }
        if let Some(index_eos) = &opts.index_eos_token {
            if let Some(idx) = index_eos.keys().find(|&&idx| idx >= k) {
                return Err(Error::usage(format!("no stream {idx} for a per-stream end id")));
            }
        }
        let embed_ids = opts.embed_ids.as_deref();
        let sum_embeds = opts.sum_embeds.as_deref();
        check_aux_len(embed_ids, sum_embeds, prompt_len + seq_len)?;
        let window = self.max_seq_len;
        let device = prompts.device();
        let mut rng = ChaCha8Rng::seed_from_u64(opts.seed);

        // Catch memory up over every full window but the last prompt segment.
        let leading = (prompt_len - 1) / window;
        let mut mems = opts.mems.clone();
        for s in 0..leading {
            let segment = prompts.narrow(1, s * window, window)?;
            let aux = WindowAux::slice(embed_ids, sum_embeds, s * window, window)?;
            let out = self.net.forward(
                &segment,
                ForwardArgs {
                    mems: mems.as_ref(),
                    embed_ids: aux.embed_ids.as_deref(),
                    sum_embeds: aux.sum_embeds.as_deref(),
                    return_mems: true,
                    ..Default::default()
                },
            )?;
            mems = out.mems;
        }

        let mut state = GenerationState {
            out: prompts.clone(),
            curr_pos: leading * window,
            curr_mems: mems,
            cache: None,
        };
        let mut ended = vec![false; batch];

        for _ in 0..seq_len {
            let x = state.window()?;
            let x_len = x.dim(1)?;
            let mask = Tensor::zeros((batch, x_len), DType::U8, device)?;
            let aux = WindowAux::slice(embed_ids, sum_embeds, state.curr_pos, x_len)?;
            let call = self.net.forward(
                &x,
                ForwardArgs {
                    mask: Some(&mask),
                    mems: state.curr_mems.as_ref(),
                    cache: state.cache.as_ref(),
                    embed_ids: aux.embed_ids.as_deref(),
                    sum_embeds: aux.sum_embeds.as_deref(),
                    return_mems: true,
                    ..Default::default()
                },
            )?;

            let mut samples = Vec::with_capacity(k);
            for logits in &call.logits {
                let last = logits.dim(1)? - 1;
                let logits = logits.i((.., last, ..))?.detach();
                samples.push(sample_next(&logits, opts.temperature, opts.filter.as_ref(), &mut rng)?);
            }
            let mut token = Vec::with_capacity(batch * k);
            for b in 0..batch {
                let row: Vec<u32> = samples.iter().map(|s| s[b]).collect();
                ended[b] |= self.is_end(&row, opts);
                token.extend(row);
            }
            let token = Tensor::from_vec(token, (batch, 1, k), device)?;
            state = state.advance(&token, call, window)?;

            if ended.iter().all(|&e| e) {
                break;
            }
        }

        let generated_len = state.out.dim(1)? - prompt_len;
        let mut rows: Vec<Vec<Vec<u32>>> = state.out.narrow(1, prompt_len, generated_len)?.to_vec3()?;
        for row in rows.iter_mut() {
            row.resize(seq_len, self.pad_value.clone());
        }
        mask_after_end(&mut rows, opts, &self.pad_value);

        let flat: Vec<u32> = rows.into_iter().flatten().flatten().collect();
        Ok(Tensor::from_vec(flat, (batch, seq_len, k), device)?)
    }

    fn is_end(&self, token: &[u32], opts: &GenerateOptions) -> bool {
        let joint = opts.eos_token.as_deref().is_some_and(|eos| eos == token);
        let per_stream = opts
            .index_eos_token
            .as_ref()
            .is_some_and(|m| m.iter().any(|(&idx, &id)| token[idx] == id));
        joint || per_stream
    }
}

/// Overwrite every position strictly after the first end token with `pad`.
///
/// The joint end vector is handled first, then every per-stream end id in its
/// own pass over the already-masked rows.
fn mask_after_end(rows: &mut [Vec<Vec<u32>>], opts: &GenerateOptions, pad: &[u32]) {
    if let Some(eos) = &opts.eos_token {
        mask_rows_after(rows, pad, |t| t == eos.as_slice());
    }
    if let Some(index_eos) = &opts.index_eos_token {
        for (&idx, &id) in index_eos {
            mask_rows_after(rows, pad, |t| t[idx] == id);
        }
    }
}

fn mask_rows_after(rows: &mut [Vec<Vec<u32>>], pad: &[u32], is_end: impl Fn(&[u32]) -> bool) {
    for row in rows.iter_mut() {
        if let Some(first) = row.iter().position(|t| is_end(t.as_slice())) {
            for t in row.iter_mut().skip(first + 1) {
                t.copy_from_slice(pad);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ComposerConfig, DecoderConfig, ModelConfig};
    use crate::model::branch::BranchState;
    use crate::model::stack::StackCache;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn recurrence(num_tokens: Vec<usize>, window: usize, max_mem_len: usize) -> (VarMap, ChunkedRecurrence) {
        let streams = num_tokens.len();
        let cfg = ModelConfig {
            composer: ComposerConfig {
                num_tokens,
                max_seq_len: window,
                max_mem_len,
                ..Default::default()
            },
            backbone: DecoderConfig::new(16, 1, 2),
            pre_stacks: None,
            post_stacks: None,
            recurrence: None,
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = cfg.build(vb).unwrap();
        let rec = ChunkedRecurrence::new(
            net,
            RecurrenceConfig {
                pad_value: vec![0; streams],
                ..Default::default()
            },
        )
        .unwrap();
        (varmap, rec)
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_dtype(DType::F32).unwrap().to_scalar().unwrap()
    }

    fn tokens(rows: &[Vec<[u32; 2]>]) -> Tensor {
        let (b, n) = (rows.len(), rows[0].len());
        let flat: Vec<u32> = rows.iter().flatten().flatten().copied().collect();
        Tensor::from_vec(flat, (b, n, 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn padding_values_must_fit_vocabulary() {
        let cfg = ModelConfig::from_json_str(
            r#"{"composer": {"num_tokens": [8], "max_seq_len": 4}, "backbone": {"dim": 16, "depth": 1, "heads": 2}}"#,
        )
        .unwrap();
        let varmap = VarMap::new();
        let net = cfg
            .build(VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu))
            .unwrap();
        let res = ChunkedRecurrence::new(
            net,
            RecurrenceConfig {
                pad_value: vec![8],
                ..Default::default()
            },
        );
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn padded_window_is_renormalised() {
        // Window 4, 8 input positions: the second window is padding on every stream.
        let (_vm, rec) = recurrence(vec![8, 8], 4, 0);
        let real = vec![[1, 2], [3, 4], [5, 6], [7, 1]];
        let mut seq = real.clone();
        seq.extend(vec![[0, 0]; 5]);
        let full = rec.forward(&tokens(&[seq.clone()]), ChunkedLossArgs::default()).unwrap();

        let first = rec
            .forward(&tokens(&[seq[..5].to_vec()]), ChunkedLossArgs::default())
            .unwrap();
        // Same first window; its fraction was 4/8 and is renormalised back to 1.
        assert!((scalar(&full.loss) - scalar(&first.loss)).abs() < 1e-5);
    }

    #[test]
    fn all_padding_gives_tracked_zero() {
        let (_vm, rec) = recurrence(vec![8, 8], 4, 0);
        let seq = vec![[0, 0]; 9];
        let out = rec.forward(&tokens(&[seq]), ChunkedLossArgs::default()).unwrap();
        assert_eq!(scalar(&out.loss), 0.0);
        // Still differentiable.
        assert!(out.loss.backward().is_ok());
    }

    #[test]
    fn ignored_output_stream_contributes_nothing() {
        let (_vm, rec) = recurrence(vec![8, 8], 8, 0);
        // Stream 1 labels are all padding.
        let seq = vec![[1, 3], [2, 0], [3, 0], [4, 0], [5, 0]];
        let both = rec.forward(&tokens(&[seq.clone()]), ChunkedLossArgs::default()).unwrap();

        let only_first = [1.0, 0.0];
        let args = ChunkedLossArgs {
            loss_weights: Some(&only_first),
            ..Default::default()
        };
        let first = rec.forward(&tokens(&[seq]), args).unwrap();
        assert!((scalar(&both.loss) - scalar(&first.loss)).abs() < 1e-6);

        let wrong = [1.0];
        let args = ChunkedLossArgs {
            loss_weights: Some(&wrong),
            ..Default::default()
        };
        assert!(matches!(
            rec.forward(&tokens(&[vec![[1, 1], [2, 2]]]), args),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn forward_returns_logits_and_window_memories() {
        let (_vm, rec) = recurrence(vec![8, 8], 3, 4);
        let seq: Vec<[u32; 2]> = (0..8).map(|i| [1 + i % 7, 1 + (i * 3) % 7]).collect();
        let args = ChunkedLossArgs {
            return_mems: true,
            ..Default::default()
        };
        let out = rec.forward(&tokens(&[seq]), args).unwrap();
        let logits = out.logits.unwrap();
        assert_eq!(logits[0].dims(), &[1, 7, 8]);
        let mems = out.mems.unwrap();
        assert_eq!(mems.len(), 3);
        assert_eq!(mems[0].backbone[0].dim(1).unwrap(), 3);
        assert_eq!(mems[2].backbone[0].dim(1).unwrap(), 4);
    }

    fn opts_with_eos(eos: Option<Vec<u32>>, index_eos: Option<BTreeMap<usize, u32>>) -> GenerateOptions {
        GenerateOptions {
            temperature: 0.0,
            eos_token: eos,
            index_eos_token: index_eos,
            ..Default::default()
        }
    }

    #[test]
    fn joint_end_pads_everything_after_it() {
        let mut rows = vec![(0..10).map(|i| vec![i + 1, i + 11]).collect::<Vec<_>>()];
        rows[0][3] = vec![9, 9];
        let opts = opts_with_eos(Some(vec![9, 9]), None);
        mask_after_end(&mut rows, &opts, &[0, 0]);

        assert_eq!(rows[0][3], vec![9, 9]);
        assert_eq!(rows[0][2], vec![3, 13]);
        for t in &rows[0][4..] {
            assert_eq!(t, &vec![0, 0]);
        }
    }

    #[test]
    fn per_stream_end_masks_independently() {
        let mut rows = vec![
            vec![vec![1, 5], vec![2, 7], vec![3, 5], vec![4, 5]],
            vec![vec![1, 1], vec![2, 2], vec![3, 3], vec![4, 4]],
        ];
        let opts = opts_with_eos(None, Some(BTreeMap::from([(1, 7)])));
        mask_after_end(&mut rows, &opts, &[0, 0]);
        assert_eq!(rows[0], vec![vec![1, 5], vec![2, 7], vec![0, 0], vec![0, 0]]);
        assert_eq!(rows[1][3], vec![4, 4]);
    }

    #[test]
    fn boundary_commits_memories_of_that_call() {
        let device = Device::Cpu;
        let mem = |v: f32| -> Memories {
            BranchState::backbone_only(vec![Tensor::full(v, (1, 2, 4), &device).unwrap()])
        };
        let call = |v: f32| ComposerOutput {
            logits: vec![],
            embeddings: None,
            mems: Some(mem(v)),
            cache: BranchState::backbone_only(StackCache::new(vec![]).unwrap()),
            attn_maps: None,
            intermediates: None,
        };
        let sample = Tensor::zeros((1, 1, 1), DType::U32, &device).unwrap();

        // 3 tokens in a window of 4: the cache is threaded, memory stays.
        let state = GenerationState {
            out: Tensor::zeros((1, 3, 1), DType::U32, &device).unwrap(),
            curr_pos: 0,
            curr_mems: Some(mem(1.0)),
            cache: None,
        };
        let state = state.advance(&sample, call(2.0), 4).unwrap();
        assert_eq!(state.curr_pos, 0);
        assert!(state.cache.is_some());
        let kept: Vec<f32> = state.curr_mems.as_ref().unwrap().backbone[0]
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(kept.iter().all(|&v| v == 1.0));

        // The window now holds 4 tokens: this call's memories are committed.
        let state = state.advance(&sample, call(3.0), 4).unwrap();
        assert_eq!(state.curr_pos, 4);
        assert!(state.cache.is_none());
        let committed: Vec<f32> = state.curr_mems.as_ref().unwrap().backbone[0]
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(committed.iter().all(|&v| v == 3.0));
        assert_eq!(state.window().unwrap().dim(1).unwrap(), 1);
    }

    #[test]
    fn generate_returns_only_new_positions() {
        let (_vm, rec) = recurrence(vec![8, 8], 4, 8);
        let row = vec![[1, 2], [3, 4], [5, 6], [7, 1], [2, 2], [3, 3]];
        let prompt = tokens(&[row.clone(), row]);
        let out = rec.generate(&prompt, 7, &opts_with_eos(None, None)).unwrap();
        assert_eq!(out.dims(), &[2, 7, 2]);

        // Greedy decoding is deterministic.
        let again = rec.generate(&prompt, 7, &opts_with_eos(None, None)).unwrap();
        let a: Vec<Vec<Vec<u32>>> = out.to_vec3().unwrap();
        let b: Vec<Vec<Vec<u32>>> = again.to_vec3().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn nan_loss_terms_are_left_out_of_the_window() {
        let device = Device::Cpu;
        let term = |v: f32| Some(Tensor::new(v, &device).unwrap());
        let weights = [1.0, 2.0, 0.5];

        let terms = [term(1.5), term(f32::NAN), term(4.0)];
        let total = combine_stream_losses(&terms, &weights, 1).unwrap().unwrap();
        assert!((scalar(&total) - 3.5).abs() < 1e-6);

        let terms = [None, term(1.0), None];
        let total = combine_stream_losses(&terms, &weights, 1).unwrap().unwrap();
        assert!((scalar(&total) - 2.0).abs() < 1e-6);

        let terms = [term(f32::NAN), None, term(f32::NAN)];
        assert!(combine_stream_losses(&terms, &weights, 1).unwrap().is_none());
    }

    #[test]
    fn zero_memory_cap_returns_empty_memory_list() {
        let (_vm, rec) = recurrence(vec![8, 8], 3, 0);
        let seq: Vec<[u32; 2]> = (0..8).map(|i| [1 + i % 7, 1 + (i * 3) % 7]).collect();
        let args = ChunkedLossArgs {
            return_mems: true,
            ..Default::default()
        };
        let out = rec.forward(&tokens(&[seq]), args).unwrap();
        assert!(out.mems.unwrap().is_empty());
        assert_eq!(out.logits.unwrap()[0].dim(1).unwrap(), 7);
    }

    fn segmented(window: usize) -> (VarMap, ChunkedRecurrence) {
        let mut composer = ComposerConfig {
            num_tokens: vec![8, 8],
            max_seq_len: window,
            ..Default::default()
        };
        composer.embed_num_tokens.insert("segment".to_string(), 3);
        let cfg = ModelConfig {
            composer,
            backbone: DecoderConfig::new(16, 1, 2),
            pre_stacks: None,
            post_stacks: None,
            recurrence: None,
        };
        let varmap = VarMap::new();
        let net = cfg
            .build(VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu))
            .unwrap();
        let rec = ChunkedRecurrence::new(
            net,
            RecurrenceConfig {
                pad_value: vec![0, 0],
                ..Default::default()
            },
        )
        .unwrap();
        (varmap, rec)
    }

    fn segment_ids(ids: &[u32]) -> Vec<BTreeMap<String, Tensor>> {
        let seg = Tensor::from_slice(ids, (1, ids.len()), &Device::Cpu).unwrap();
        (0..2)
            .map(|_| BTreeMap::from([("segment".to_string(), seg.clone())]))
            .collect()
    }

    #[test]
    fn auxiliary_ids_follow_each_window() {
        // Window 4, memory cap 0: the second window sees only its own slice.
        let (_vm, rec) = segmented(4);
        let seq: Vec<[u32; 2]> = (0..9).map(|i| [1 + i % 7, 1 + (i * 3) % 7]).collect();
        let x = tokens(&[seq]);
        let seg = [0, 0, 0, 1, 1, 2, 2, 2, 0];
        let embed_ids = segment_ids(&seg);
        let out = rec
            .forward(
                &x,
                ChunkedLossArgs {
                    return_outputs: true,
                    embed_ids: Some(&embed_ids),
                    ..Default::default()
                },
            )
            .unwrap();
        let logits = out.logits.unwrap();
        assert_eq!(logits[0].dim(1).unwrap(), 8);

        let window_ids = segment_ids(&seg[4..8]);
        let direct = rec
            .net()
            .forward(
                &x.narrow(1, 4, 4).unwrap(),
                ForwardArgs {
                    embed_ids: Some(&window_ids),
                    ..Default::default()
                },
            )
            .unwrap();
        let second = logits[0].narrow(1, 4, 4).unwrap();
        let diff = scalar(&(second - &direct.logits[0]).unwrap().abs().unwrap().max_all().unwrap());
        assert!(diff < 1e-5, "{diff}");

        // Ids must cover the whole sequence.
        let short = segment_ids(&seg[..6]);
        let args = ChunkedLossArgs {
            embed_ids: Some(&short),
            ..Default::default()
        };
        assert!(matches!(rec.forward(&x, args), Err(Error::Usage(_))));
        assert!(matches!(rec.forward(&x, ChunkedLossArgs::default()), Err(Error::Usage(_))));
    }

    #[test]
    fn generation_reads_auxiliary_ids_of_future_positions() {
        let (_vm, rec) = segmented(4);
        let prompt = tokens(&[vec![[1, 2], [3, 4], [5, 6], [7, 1], [2, 2]]]);
        let opts = GenerateOptions {
            embed_ids: Some(segment_ids(&[0, 0, 1, 1, 1, 2, 2, 2, 2])),
            ..opts_with_eos(None, None)
        };
        let out = rec.generate(&prompt, 4, &opts).unwrap();
        assert_eq!(out.dims(), &[1, 4, 2]);

        // One generated position is not covered.
        let opts = GenerateOptions {
            embed_ids: Some(segment_ids(&[0, 0, 1, 1, 1, 2, 2, 2])),
            ..opts_with_eos(None, None)
        };
        assert!(matches!(rec.generate(&prompt, 4, &opts), Err(Error::Usage(_))));
    }
}
