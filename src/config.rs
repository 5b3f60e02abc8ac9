//! Configuration for the multi-stream composer, its attention stacks and the
//! chunked recurrence.
//!
//! Everything deserializes from JSON with per-field defaults, so a minimal
//! config only names the vocabularies and the backbone shape:
//!
//! ```json
//! {
//!   "composer": { "num_tokens": [128, 32], "max_seq_len": 64, "max_mem_len": 64 },
//!   "backbone": { "dim": 64, "depth": 2, "heads": 4 }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use crate::model::composer::{MultiStreamComposer, Stacks};
use crate::model::transformer::Decoder;
use crate::model::stack::AttentionStack;
use crate::{Error, Result};

/// How per-stream embeddings are combined before the backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Concatenate along the feature axis (projected to the backbone width if needed).
    #[default]
    Concat,
    /// Elementwise sum; every stream must already be at the backbone width.
    Sum,
}

/// Composer configuration. Immutable once the composer is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposerConfig {
    /// Vocabulary size per input stream; its length is the stream count.
    pub num_tokens: Vec<usize>,

    /// Maximum window length (also the absolute position table size).
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,

    /// Embedding width per input stream. Defaults to the pre-stack width of the
    /// stream, or the backbone width when there are no pre-stacks.
    #[serde(default)]
    pub emb_dim: Option<Vec<usize>>,

    #[serde(default)]
    pub merge: MergeMode,

    /// Auxiliary embedding tables (e.g. segment / type ids), name → vocabulary size.
    #[serde(default)]
    pub embed_num_tokens: BTreeMap<String, usize>,

    /// Memory length cap per layer. `0` disables memory.
    #[serde(default)]
    pub max_mem_len: usize,

    /// Number of leading per-layer memories rotated to the tail before reuse.
    #[serde(default)]
    pub shift_mem_down: usize,

    #[serde(default)]
    pub emb_dropout: f32,

    /// LayerNorm after embedding (identity otherwise).
    #[serde(default)]
    pub post_emb_norm: bool,

    /// Output projections reuse the input token embedding matrix.
    #[serde(default)]
    pub tie_embedding: bool,

    /// Logit width per output stream; its length is the output stream count.
    /// Defaults to `num_tokens`.
    #[serde(default)]
    pub logits_dim: Option<Vec<usize>>,

    /// Autoregressive models must predict their own vocabularies.
    #[serde(default)]
    pub autoregressive: bool,

    #[serde(default = "default_true")]
    pub use_abs_pos_emb: bool,

    #[serde(default)]
    pub scaled_sinu_pos_emb: bool,

    #[serde(default)]
    pub l2norm_embed: bool,

    /// Fraction of the gradient that reaches the embeddings, in `(0, 1]`.
    #[serde(default = "default_emb_frac_gradient")]
    pub emb_frac_gradient: f64,

    #[serde(default = "default_attn_z_loss_weight")]
    pub attn_z_loss_weight: f64,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            num_tokens: vec![256],
            max_seq_len: default_max_seq_len(),
            emb_dim: None,
            merge: MergeMode::default(),
            embed_num_tokens: BTreeMap::new(),
            max_mem_len: 0,
            shift_mem_down: 0,
            emb_dropout: 0.0,
            post_emb_norm: false,
            tie_embedding: false,
            logits_dim: None,
            autoregressive: false,
            use_abs_pos_emb: true,
            scaled_sinu_pos_emb: false,
            l2norm_embed: false,
            emb_frac_gradient: default_emb_frac_gradient(),
            attn_z_loss_weight: default_attn_z_loss_weight(),
        }
    }
}

impl ComposerConfig {
    /// Number of input streams.
    pub fn num_inputs(&self) -> usize {
        self.num_tokens.len()
    }

    /// Logit widths per output stream, defaulted to the input vocabularies.
    pub fn resolved_logits_dim(&self) -> Vec<usize> {
        self.logits_dim
            .clone()
            .unwrap_or_else(|| self.num_tokens.clone())
    }

    /// Checks the invariants that do not depend on the attached stacks.
    pub fn validate(&self) -> Result<()> {
        if self.num_tokens.is_empty() {
            return Err(Error::config("num_tokens must name at least one stream"));
        }
        if let Some(i) = self.num_tokens.iter().position(|&n| n == 0) {
            return Err(Error::config(format!(
                "num_tokens[{i}] must be greater than zero"
            )));
        }
        if let Some(emb_dim) = &self.emb_dim {
            if emb_dim.len() != self.num_tokens.len() {
                return Err(Error::config(format!(
                    "number of embeddings ({}) must match number of inputs ({})",
                    emb_dim.len(),
                    self.num_tokens.len()
                )));
            }
            if emb_dim.contains(&0) {
                return Err(Error::config("emb_dim entries must be greater than zero"));
            }
        }
        if !(self.emb_frac_gradient > 0.0 && self.emb_frac_gradient <= 1.0) {
            return Err(Error::config(format!(
                "emb_frac_gradient must be in (0, 1], got {}",
                self.emb_frac_gradient
            )));
        }
        if !(0.0..1.0).contains(&self.emb_dropout) {
            return Err(Error::config("emb_dropout must be in [0, 1)"));
        }
        if let Some(logits_dim) = &self.logits_dim {
            if logits_dim.is_empty() {
                return Err(Error::config("logits_dim must name at least one output"));
            }
            if self.autoregressive && logits_dim != &self.num_tokens {
                return Err(Error::config(
                    "if autoregressive, logits_dim must be equal to num_tokens",
                ));
            }
        }
        if let Some((name, _)) = self.embed_num_tokens.iter().find(|&(_, &n)| n == 0) {
            return Err(Error::config(format!(
                "auxiliary embedding '{name}' needs a non-empty vocabulary"
            )));
        }
        Ok(())
    }
}

/// Configuration of the reference [`Decoder`] attention stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Model width; the stack consumes and produces `[B, N, dim]`.
    pub dim: usize,

    #[serde(default = "default_depth")]
    pub depth: usize,

    #[serde(default = "default_heads")]
    pub heads: usize,

    /// Per-head width. Defaults to `dim / heads`.
    #[serde(default)]
    pub dim_head: Option<usize>,

    #[serde(default = "default_true")]
    pub causal: bool,

    #[serde(default = "default_ff_mult")]
    pub ff_mult: usize,

    /// Rotary positions inside attention (disables absolute positions upstream).
    #[serde(default)]
    pub rotary_pos_emb: bool,

    #[serde(default = "default_rotary_theta")]
    pub rotary_theta: f64,

    #[serde(default)]
    pub attn_dropout: f32,

    #[serde(default)]
    pub ff_dropout: f32,

    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
}

impl DecoderConfig {
    pub fn new(dim: usize, depth: usize, heads: usize) -> Self {
        Self {
            dim,
            depth,
            heads,
            dim_head: None,
            causal: true,
            ff_mult: default_ff_mult(),
            rotary_pos_emb: false,
            rotary_theta: default_rotary_theta(),
            attn_dropout: 0.0,
            ff_dropout: 0.0,
            norm_eps: default_norm_eps(),
        }
    }

    pub fn head_dim(&self) -> usize {
        self.dim_head.unwrap_or(self.dim / self.heads.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 || self.depth == 0 || self.heads == 0 {
            return Err(Error::config(
                "decoder dim, depth and heads must be greater than zero",
            ));
        }
        if self.head_dim() == 0 {
            return Err(Error::config(format!(
                "decoder head width is zero (dim {} / heads {})",
                self.dim, self.heads
            )));
        }
        if self.rotary_pos_emb && self.head_dim() % 2 != 0 {
            return Err(Error::config("rotary positions need an even head width"));
        }
        if !(0.0..1.0).contains(&self.attn_dropout) || !(0.0..1.0).contains(&self.ff_dropout) {
            return Err(Error::config("decoder dropout must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Configuration of the chunked recurrence wrapper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecurrenceConfig {
    /// Padding sentinel per input stream.
    pub pad_value: Vec<u32>,

    /// Extra label value excluded from the loss, on top of each stream's sentinel.
    #[serde(default)]
    pub ignore_index: Option<u32>,

    /// Loss weight per output stream. Defaults to 1 for every output.
    #[serde(default)]
    pub loss_weights: Option<Vec<f64>>,
}

/// Full model description: composer plus the stacks it routes through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub composer: ComposerConfig,
    pub backbone: DecoderConfig,
    #[serde(default)]
    pub pre_stacks: Option<Vec<DecoderConfig>>,
    #[serde(default)]
    pub post_stacks: Option<Vec<DecoderConfig>>,
    #[serde(default)]
    pub recurrence: Option<RecurrenceConfig>,
}

impl ModelConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Build the composer with [`Decoder`] stacks, parameters drawn from `vb`.
    pub fn build(&self, vb: VarBuilder) -> Result<MultiStreamComposer> {
        let backbone = Decoder::new(&self.backbone, vb.pp("attn_layers"))?;
        let pre = build_stacks(self.pre_stacks.as_deref(), &vb.pp("pre_attn_layers"))?;
        let post = build_stacks(self.post_stacks.as_deref(), &vb.pp("post_attn_layers"))?;
        let stacks = Stacks {
            backbone: Box::new(backbone),
            pre,
            post,
        };
        MultiStreamComposer::new(&self.composer, stacks, vb)
    }
}

fn build_stacks(
    cfgs: Option<&[DecoderConfig]>,
    vb: &VarBuilder,
) -> Result<Option<Vec<Box<dyn AttentionStack>>>> {
    let Some(cfgs) = cfgs else {
        return Ok(None);
    };
    let mut stacks: Vec<Box<dyn AttentionStack>> = Vec::with_capacity(cfgs.len());
    for (i, cfg) in cfgs.iter().enumerate() {
        stacks.push(Box::new(Decoder::new(cfg, vb.pp(i.to_string()))?));
    }
    Ok(Some(stacks))
}

fn default_max_seq_len() -> usize {
    1024
}
fn default_true() -> bool {
    true
}
fn default_emb_frac_gradient() -> f64 {
    1.0
}
fn default_attn_z_loss_weight() -> f64 {
    1e-4
}
fn default_depth() -> usize {
    6
}
fn default_heads() -> usize {
    8
}
fn default_ff_mult() -> usize {
    4
}
fn default_rotary_theta() -> f64 {
    10_000.0
}
fn default_norm_eps() -> f64 {
    1e-5
}
