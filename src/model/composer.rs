//! Multi-stream composer.
//!
//! Every input stream gets its own embedding pipeline:
//!
//! ```text
//! ids[..., i] → token emb + pos emb (+ aux) (+ sum) → norm → [prepend] → grad frac
//!             → dropout → project → narrow to new positions → [pre stack]
//! ```
//!
//! The streams are merged (concat + projection, or sum), run once through the
//! shared backbone, and fanned back out to one head per output stream, each
//! optionally behind its own post stack. Memories, caches and attention maps
//! of every stack are reported per branch in [`BranchState`] bundles.

use std::collections::BTreeMap;

use candle_core::{DType, IndexOp, Module, Tensor, D};
use candle_nn::{Dropout, VarBuilder};

use crate::config::{ComposerConfig, MergeMode};
use crate::loss::attn_z_loss;
use crate::model::branch::{
    extend_memories, shift_memories, AttentionMaps, BranchState, Caches, Memories,
};
use crate::model::embedding::{AuxEmbeddings, PositionalEmbedding, TokenEmbedding};
use crate::model::processor::{OutputHead, StreamProcessor};
use crate::model::stack::{AttentionStack, LayerIntermediates, StackArgs};
use crate::model::transformer::layers::LayerNorm;
use crate::{Error, Result};

/// Attention stacks handed to the composer.
pub struct Stacks {
    pub backbone: Box<dyn AttentionStack>,
    /// One per input stream.
    pub pre: Option<Vec<Box<dyn AttentionStack>>>,
    /// One per output stream.
    pub post: Option<Vec<Box<dyn AttentionStack>>>,
}

/// Which optional branches exist, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub has_pre_stacks: bool,
    pub has_post_stacks: bool,
    pub has_aux_embeddings: bool,
    pub num_inputs: usize,
    pub num_outputs: usize,
}

/// What the output heads return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputKind {
    #[default]
    Logits,
    /// Hidden states in front of the heads.
    Embeddings,
    LogitsAndEmbeddings,
}

/// Per-call options of [`MultiStreamComposer::forward`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardArgs<'a> {
    /// Padding mask `[B, N]`, `1` = padded position.
    pub mask: Option<&'a Tensor>,
    pub mems: Option<&'a Memories>,
    /// Key padding `[B, M]` over the backbone memories, `1` = ignore.
    pub mem_mask: Option<&'a Tensor>,
    /// Caches returned by the previous call on the same segment.
    pub cache: Option<&'a Caches>,
    /// Integer positions `[N]` / `[B, N]`, or float position embeddings added as-is.
    pub pos: Option<&'a Tensor>,
    /// Per-batch start offsets `[B]`.
    pub seq_start_pos: Option<&'a Tensor>,
    /// One `[B, P, width]` tensor per input stream, placed ahead of the sequence.
    pub prepend_embeds: Option<&'a [Tensor]>,
    /// Padding mask `[B, P]` of the prepended span, shared by every stream.
    pub prepend_mask: Option<&'a Tensor>,
    /// One name → ids map per input stream.
    pub embed_ids: Option<&'a [BTreeMap<String, Tensor>]>,
    /// One tensor per input stream added to the embedding before normalisation.
    pub sum_embeds: Option<&'a [Tensor]>,
    pub output: OutputKind,
    pub return_mems: bool,
    pub return_attn: bool,
    pub return_intermediates: bool,
    /// Also turns on `return_intermediates`.
    pub return_attn_z_loss: bool,
    /// Overrides the configured z-loss weight.
    pub attn_z_loss_weight: Option<f64>,
    pub train: bool,
}

/// Result of one composer call.
#[derive(Debug, Clone)]
pub struct ComposerOutput {
    /// `[B, Q, logits_dim[o]]` per output stream; empty for [`OutputKind::Embeddings`].
    pub logits: Vec<Tensor>,
    /// Hidden states per output stream, when requested.
    pub embeddings: Option<Vec<Tensor>>,
    /// Updated memories, when requested and the memory cap is non-zero.
    pub mems: Option<Memories>,
    pub cache: Caches,
    pub attn_maps: Option<AttentionMaps>,
    pub intermediates: Option<BranchState<LayerIntermediates>>,
}

pub struct MultiStreamComposer {
    config: ComposerConfig,
    topology: Topology,
    emb_dim: Vec<usize>,
    token_emb: Vec<TokenEmbedding>,
    pos_emb: Vec<PositionalEmbedding>,
    aux_emb: Option<Vec<AuxEmbeddings>>,
    post_emb_norm: Vec<Option<LayerNorm>>,
    emb_dropout: Dropout,
    project_emb: Vec<StreamProcessor>,
    pre_stacks: Option<Vec<StreamProcessor>>,
    merge_proj: StreamProcessor,
    backbone: Box<dyn AttentionStack>,
    post_mapping: Vec<StreamProcessor>,
    post_stacks: Option<Vec<StreamProcessor>>,
    heads: Vec<OutputHead>,
}

impl MultiStreamComposer {
    pub fn new(cfg: &ComposerConfig, stacks: Stacks, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let num_inputs = cfg.num_inputs();
        let logits_dim = cfg.resolved_logits_dim();
        let num_outputs = logits_dim.len();
        let Stacks {
            backbone,
            pre,
            post,
        } = stacks;
        let dim = backbone.dim();

        if let Some(pre) = &pre {
            if pre.len() != num_inputs {
                return Err(Error::config(format!(
                    "number of pre-attention stacks ({}) must match number of inputs ({num_inputs})",
                    pre.len()
                )));
            }
        }
        if let Some(post) = &post {
            if post.len() != num_outputs {
                return Err(Error::config(format!(
                    "number of post-attention stacks ({}) must match number of outputs ({num_outputs})",
                    post.len()
                )));
            }
        }

        let pre_dim = |i: usize| pre.as_ref().map(|p| p[i].dim());
        let emb_dim: Vec<usize> = match &cfg.emb_dim {
            Some(d) => d.clone(),
            None => (0..num_inputs).map(|i| pre_dim(i).unwrap_or(dim)).collect(),
        };
        // Width of each stream where it enters the merge.
        let widths: Vec<usize> = (0..num_inputs)
            .map(|i| pre_dim(i).unwrap_or(emb_dim[i]))
            .collect();

        let merge_proj = match cfg.merge {
            MergeMode::Concat => {
                let total: usize = widths.iter().sum();
                if total != dim {
                    tracing::info!(
                        concat_width = total,
                        model_dim = dim,
                        "concatenated stream width differs from the model width, adding a linear projection"
                    );
                }
                StreamProcessor::projection(total, dim, vb.pp("pre_attn_layers_map"))?
            }
            MergeMode::Sum => {
                if let Some(i) = widths.iter().position(|&w| w != dim) {
                    return Err(Error::config(format!(
                        "summed streams must all have the model width {dim}, stream {i} has {}",
                        widths[i]
                    )));
                }
                StreamProcessor::Identity
            }
        };

        let mut token_emb = Vec::with_capacity(num_inputs);
        let mut pos_emb = Vec::with_capacity(num_inputs);
        let mut post_emb_norm = Vec::with_capacity(num_inputs);
        let mut project_emb = Vec::with_capacity(num_inputs);
        for i in 0..num_inputs {
            let d = emb_dim[i];
            token_emb.push(TokenEmbedding::new(
                cfg.num_tokens[i],
                d,
                cfg.l2norm_embed,
                vb.pp(format!("token_emb.{i}")),
            )?);

            let stack_positions = backbone.disables_abs_pos_emb()
                || pre.as_ref().is_some_and(|p| p[i].disables_abs_pos_emb());
            let no_abs_pos_emb = cfg.max_seq_len == 0 || !cfg.use_abs_pos_emb || stack_positions;
            pos_emb.push(if no_abs_pos_emb {
                PositionalEmbedding::None
            } else if cfg.scaled_sinu_pos_emb {
                PositionalEmbedding::scaled_sinusoidal(d, vb.pp(format!("pos_emb.{i}")))?
            } else {
                PositionalEmbedding::absolute(
                    d,
                    cfg.max_seq_len,
                    cfg.l2norm_embed,
                    vb.pp(format!("pos_emb.{i}")),
                )?
            });

            post_emb_norm.push(
                cfg.post_emb_norm
                    .then(|| LayerNorm::new(d, 1e-5, vb.pp(format!("post_emb_norm.{i}"))))
                    .transpose()?,
            );
            project_emb.push(StreamProcessor::projection(
                d,
                widths[i],
                vb.pp(format!("project_emb.{i}")),
            )?);
        }

        let aux_emb = if cfg.embed_num_tokens.is_empty() {
            None
        } else {
            let tables = (0..num_inputs)
                .map(|i| AuxEmbeddings::new(&cfg.embed_num_tokens, emb_dim[i], vb.pp(format!("embeds.{i}"))))
                .collect::<candle_core::Result<Vec<_>>>()?;
            Some(tables)
        };

        let head_in: Vec<usize> = (0..num_outputs)
            .map(|o| post.as_ref().map_or(dim, |p| p[o].dim()))
            .collect();
        let post_mapping = match &post {
            Some(post) => {
                if post.iter().any(|s| s.dim() != dim) {
                    tracing::info!(
                        model_dim = dim,
                        "post-attention stack width differs from the model width, adding a linear projection"
                    );
                }
                post.iter()
                    .enumerate()
                    .map(|(o, s)| {
                        StreamProcessor::projection(dim, s.dim(), vb.pp(format!("post_mapping.{o}")))
                    })
                    .collect::<candle_core::Result<Vec<_>>>()?
            }
            None => Vec::new(),
        };

        let mut heads = Vec::with_capacity(num_outputs);
        for o in 0..num_outputs {
            if cfg.tie_embedding {
                if o >= num_inputs
                    || logits_dim[o] != cfg.num_tokens[o]
                    || head_in[o] != emb_dim[o]
                {
                    return Err(Error::config(format!(
                        "cannot tie output {o}: needs a matching input stream with vocabulary {} and width {}",
                        logits_dim[o], head_in[o]
                    )));
                }
                heads.push(OutputHead::Tied(token_emb[o].weight().clone()));
            } else {
                heads.push(OutputHead::untied(
                    head_in[o],
                    logits_dim[o],
                    vb.pp(format!("to_logits.{o}")),
                )?);
            }
        }
        if cfg.tie_embedding {
            tracing::info!(outputs = num_outputs, "output heads tied to the input token embeddings");
        }

        let topology = Topology {
            has_pre_stacks: pre.is_some(),
            has_post_stacks: post.is_some(),
            has_aux_embeddings: aux_emb.is_some(),
            num_inputs,
            num_outputs,
        };
        tracing::debug!(?topology, model_dim = dim, "built multi-stream composer");

        let into_processors = |stacks: Option<Vec<Box<dyn AttentionStack>>>| {
            stacks.map(|s| s.into_iter().map(StreamProcessor::Stack).collect::<Vec<_>>())
        };

        Ok(Self {
            config: cfg.clone(),
            topology,
            emb_dim,
            token_emb,
            pos_emb,
            aux_emb,
            post_emb_norm,
            emb_dropout: Dropout::new(cfg.emb_dropout),
            project_emb,
            pre_stacks: into_processors(pre),
            merge_proj,
            backbone,
            post_mapping,
            post_stacks: into_processors(post),
            heads,
        })
    }

    pub fn config(&self) -> &ComposerConfig {
        &self.config
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }

    pub fn num_inputs(&self) -> usize {
        self.topology.num_inputs
    }

    pub fn num_outputs(&self) -> usize {
        self.topology.num_outputs
    }

    /// Embedding width per input stream.
    pub fn emb_dim(&self) -> &[usize] {
        &self.emb_dim
    }

    pub fn has_merge_projection(&self) -> bool {
        !self.merge_proj.is_identity()
    }

    pub fn token_embedding(&self, stream: usize) -> Option<&TokenEmbedding> {
        self.token_emb.get(stream)
    }

    pub fn set_padding_idx(&mut self, stream: usize, idx: Option<u32>) -> Result<()> {
        let emb = self.token_emb.get_mut(stream).ok_or_else(|| {
            Error::usage(format!("no input stream {stream} to set a padding index on"))
        })?;
        emb.set_padding_idx(idx);
        Ok(())
    }

    /// Run the composer on `x: [B, N, K]` ids (`[B, N]` for a single stream).
    pub fn forward(&self, x: &Tensor, args: ForwardArgs<'_>) -> Result<ComposerOutput> {
        let x = self.stream_ids(x)?;
        let (batch, seq_len, _) = x.dims3()?;
        let device = x.device();
        self.check_state_layout(args.mems, args.cache)?;
        self.check_stream_args(&args)?;

        if let Some(mask) = args.mask {
            if mask.dims() != [batch, seq_len] {
                return Err(Error::usage(format!(
                    "mask {:?} does not match input [{batch}, {seq_len}]",
                    mask.dims()
                )));
            }
        }
        let prepend_len = self.prepend_len(args.prepend_embeds, batch)?;
        let mask = match (prepend_len, args.mask, args.prepend_mask) {
            (0, mask, _) => mask.cloned(),
            (_, None, None) => None,
            (p, mask, prepend_mask) => {
                let mask = match mask {
                    Some(m) => m.to_dtype(DType::U8)?,
                    None => Tensor::zeros((batch, seq_len), DType::U8, device)?,
                };
                let prepend_mask = match prepend_mask {
                    Some(m) if m.dims() == [batch, p] => m.to_dtype(DType::U8)?,
                    Some(m) => {
                        return Err(Error::usage(format!(
                            "prepend mask {:?} does not match prepended span [{batch}, {p}]",
                            m.dims()
                        )))
                    }
                    None => Tensor::zeros((batch, p), DType::U8, device)?,
                };
                Some(Tensor::cat(&[&prepend_mask, &mask], 1)?)
            }
        };

        let total_len = prepend_len + seq_len;
        let cache_len = args.cache.map_or(0, |c| c.backbone.seq_len());
        if cache_len >= total_len {
            return Err(Error::usage(format!(
                "cache already covers {cache_len} positions, input has {total_len}"
            )));
        }
        let new_len = total_len - cache_len;
        let z_weight = args
            .attn_z_loss_weight
            .unwrap_or(self.config.attn_z_loss_weight);

        let mut merged: Option<Tensor> = None;
        let mut pre_inter = Vec::new();
        for i in 0..self.num_inputs() {
            let h = self.embed_stream(&x, i, &args, seq_len)?;
            let mut h = h.narrow(1, cache_len, new_len)?;

            if let Some(pre) = &self.pre_stacks {
                let mems = args
                    .mems
                    .and_then(|m| m.pre_stream(i))
                    .map(|m| shift_memories(m, self.config.shift_mem_down));
                let stack_args = StackArgs {
                    mask: mask.as_ref(),
                    mems: mems.as_deref(),
                    mem_mask: None,
                    cache: args.cache.and_then(|c| c.pre_stream(i)),
                    seq_start_pos: args.seq_start_pos,
                    train: args.train,
                };
                let (out, inter) = run_stack(&pre[i], &h, stack_args)?;
                pre_inter.push(self.finish_branch(inter, mems.as_deref(), &args, z_weight)?);
                h = out;
            }

            merged = Some(match merged {
                None => h,
                Some(acc) => match self.config.merge {
                    MergeMode::Concat => Tensor::cat(&[&acc, &h], D::Minus1)?,
                    MergeMode::Sum => (acc + h)?,
                },
            });
        }
        let merged = merged.ok_or_else(|| Error::config("composer has no input streams"))?;
        let (h, _) = self.merge_proj.forward(&merged, StackArgs::default())?;

        let mems = args
            .mems
            .map(|m| shift_memories(&m.backbone, self.config.shift_mem_down));
        let stack_args = StackArgs {
            mask: mask.as_ref(),
            mems: mems.as_deref(),
            mem_mask: args.mem_mask,
            cache: args.cache.map(|c| &c.backbone),
            seq_start_pos: args.seq_start_pos,
            train: args.train,
        };
        let (h, inter) = self.backbone.forward(&h, stack_args)?;
        let backbone_inter = self.finish_branch(inter, mems.as_deref(), &args, z_weight)?;

        let want_logits = args.output != OutputKind::Embeddings;
        let want_embeddings = args.output != OutputKind::Logits;
        let mut logits = Vec::with_capacity(self.num_outputs());
        let mut embeddings = Vec::new();
        let mut post_inter = Vec::new();
        for o in 0..self.num_outputs() {
            let hidden = match &self.post_stacks {
                Some(post) => {
                    let (mapped, _) = self.post_mapping[o].forward(&h, StackArgs::default())?;
                    let mems = args
                        .mems
                        .and_then(|m| m.post_stream(o))
                        .map(|m| shift_memories(m, self.config.shift_mem_down));
                    let stack_args = StackArgs {
                        mask: mask.as_ref(),
                        mems: mems.as_deref(),
                        mem_mask: None,
                        cache: args.cache.and_then(|c| c.post_stream(o)),
                        seq_start_pos: args.seq_start_pos,
                        train: args.train,
                    };
                    let (out, inter) = run_stack(&post[o], &mapped, stack_args)?;
                    post_inter.push(self.finish_branch(inter, mems.as_deref(), &args, z_weight)?);
                    out
                }
                None => h.clone(),
            };
            if want_logits {
                logits.push(self.heads[o].forward(&hidden)?);
            }
            if want_embeddings {
                embeddings.push(hidden);
            }
        }

        let all = BranchState {
            pre: self.topology.has_pre_stacks.then_some(pre_inter),
            backbone: backbone_inter,
            post: self.topology.has_post_stacks.then_some(post_inter),
        };
        let cache = all.clone().map(|i| i.cache);
        let attn_maps = args
            .return_attn
            .then(|| all.clone().map(|i| i.post_softmax_maps()));
        let mems = (args.return_mems && self.config.max_mem_len > 0)
            .then(|| all.clone().map(|i| i.mems.unwrap_or_default()));
        let return_intermediates = args.return_intermediates || args.return_attn_z_loss;

        Ok(ComposerOutput {
            logits,
            embeddings: want_embeddings.then_some(embeddings),
            mems,
            cache,
            attn_maps,
            intermediates: return_intermediates.then_some(all),
        })
    }

    /// Steps 1-6 of the stream pipeline over the full input (prepend included).
    fn embed_stream(
        &self,
        x: &Tensor,
        i: usize,
        args: &ForwardArgs<'_>,
        seq_len: usize,
    ) -> Result<Tensor> {
        let ids = x.i((.., .., i))?.contiguous()?;
        let mut h = self.token_emb[i].forward(&ids)?;

        match args.pos {
            Some(pos) if pos.dtype().is_float() => h = h.broadcast_add(pos)?,
            pos => {
                if let Some(p) = self.pos_emb[i].forward(seq_len, pos, args.seq_start_pos, x.device())? {
                    h = h.broadcast_add(&p)?;
                }
            }
        }

        if let Some(aux) = &self.aux_emb {
            let ids = args.embed_ids.ok_or_else(|| {
                Error::usage("auxiliary embeddings are configured but no embed_ids were given")
            })?;
            if let Some(e) = aux[i].forward(&ids[i])? {
                h = (h + e)?;
            }
        }
        if let Some(sum) = args.sum_embeds {
            h = h.broadcast_add(&sum[i])?;
        }
        if let Some(norm) = &self.post_emb_norm[i] {
            h = norm.forward(&h)?;
        }

        if let Some(prepend) = args.prepend_embeds {
            let (p, width) = (&prepend[i], h.dim(D::Minus1)?);
            if p.dim(D::Minus1)? != width {
                return Err(Error::usage(format!(
                    "prepended embeddings of stream {i} have width {}, the stream has width {width}",
                    p.dim(D::Minus1)?
                )));
            }
            h = Tensor::cat(&[&p.to_dtype(h.dtype())?, &h], 1)?;
        }

        let alpha = self.config.emb_frac_gradient;
        if alpha < 1.0 {
            h = (h.affine(alpha, 0.0)? + h.detach().affine(1.0 - alpha, 0.0)?)?;
        }
        let h = self.emb_dropout.forward(&h, args.train)?;
        let (h, _) = self.project_emb[i].forward(&h, StackArgs::default())?;
        Ok(h)
    }

    /// Attach z-loss and extended memories to a branch's intermediates.
    fn finish_branch(
        &self,
        mut inter: LayerIntermediates,
        mems_used: Option<&[Tensor]>,
        args: &ForwardArgs<'_>,
        z_weight: f64,
    ) -> Result<LayerIntermediates> {
        if args.return_attn_z_loss {
            inter.attn_z_loss = Some(attn_z_loss(&inter.pre_softmax_maps(), z_weight)?);
        }
        if args.return_mems && self.config.max_mem_len > 0 {
            inter.mems = Some(extend_memories(
                mems_used,
                &inter.hiddens,
                self.config.max_mem_len,
            )?);
        }
        Ok(inter)
    }

    /// `[B, N]` is accepted for a single stream.
    fn stream_ids(&self, x: &Tensor) -> Result<Tensor> {
        let k = self.num_inputs();
        match x.dims() {
            [_, _] if k == 1 => Ok(x.unsqueeze(D::Minus1)?),
            [_, _, last] if *last == k => Ok(x.clone()),
            dims => Err(Error::usage(format!(
                "expected token ids [B, N, {k}], got {dims:?}"
            ))),
        }
    }

    fn prepend_len(&self, prepend: Option<&[Tensor]>, batch: usize) -> Result<usize> {
        let Some(prepend) = prepend else {
            return Ok(0);
        };
        if prepend.len() != self.num_inputs() {
            return Err(Error::usage(format!(
                "got {} prepend embeddings for {} input streams",
                prepend.len(),
                self.num_inputs()
            )));
        }
        let mut len = None;
        for (i, p) in prepend.iter().enumerate() {
            let (b, n, _) = p.dims3()?;
            if b != batch {
                return Err(Error::usage(format!(
                    "prepend embeddings of stream {i} have batch {b}, input has {batch}"
                )));
            }
            match len {
                Some(l) if l != n => {
                    return Err(Error::usage("prepend embeddings must share one length"));
                }
                _ => len = Some(n),
            }
        }
        Ok(len.unwrap_or(0))
    }

    fn check_stream_args(&self, args: &ForwardArgs<'_>) -> Result<()> {
        let k = self.num_inputs();
        if let Some(ids) = args.embed_ids {
            if ids.len() != k {
                return Err(Error::usage(format!(
                    "got {} embed_ids maps for {k} input streams",
                    ids.len()
                )));
            }
        }
        if let Some(sum) = args.sum_embeds {
            if sum.len() != k {
                return Err(Error::usage(format!(
                    "got {} sum_embeds for {k} input streams",
                    sum.len()
                )));
            }
        }
        Ok(())
    }

    /// Memories and caches must have entries for exactly the configured branches.
    fn check_state_layout(&self, mems: Option<&Memories>, cache: Option<&Caches>) -> Result<()> {
        let t = self.topology;
        let check = |what: &str, len: Option<usize>, present: bool, expected: usize| -> Result<()> {
            match len {
                Some(_) if !present => Err(Error::usage(format!(
                    "{what} given but the composer has no such stacks"
                ))),
                Some(n) if n != expected => Err(Error::usage(format!(
                    "{what} has {n} entries, expected {expected}"
                ))),
                _ => Ok(()),
            }
        };
        if let Some(m) = mems {
            check("pre memories", m.pre.as_ref().map(Vec::len), t.has_pre_stacks, t.num_inputs)?;
            check("post memories", m.post.as_ref().map(Vec::len), t.has_post_stacks, t.num_outputs)?;
        }
        if let Some(c) = cache {
            if c.pre.is_some() != t.has_pre_stacks || c.post.is_some() != t.has_post_stacks {
                return Err(Error::usage("cache layout does not match the composer's stacks"));
            }
            check("pre cache", c.pre.as_ref().map(Vec::len), t.has_pre_stacks, t.num_inputs)?;
            check("post cache", c.post.as_ref().map(Vec::len), t.has_post_stacks, t.num_outputs)?;
            let seg = c.backbone.seq_len();
            if c.clone().into_ordered().iter().any(|s| s.seq_len() != seg) {
                return Err(Error::usage("every cached stack must cover the same positions"));
            }
        }
        Ok(())
    }
}

fn run_stack(
    stage: &StreamProcessor,
    x: &Tensor,
    args: StackArgs<'_>,
) -> Result<(Tensor, LayerIntermediates)> {
    match stage.forward(x, args)? {
        (out, Some(inter)) => Ok((out, inter)),
        (_, None) => Err(Error::config(format!(
            "expected an attention stack, found {stage:?}"
        ))),
    }
}
