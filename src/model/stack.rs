//! The attention-stack seam.
//!
//! The composer routes every branch (per-stream pre stacks, the shared backbone,
//! per-stream post stacks) through [`AttentionStack`]. The crate ships one
//! implementation, [`Decoder`](super::transformer::Decoder); anything that
//! honours the contract below can be plugged in instead.

use candle_core::{Result, Tensor};

/// Attention scores of one layer.
#[derive(Debug, Clone)]
pub struct AttentionIntermediate {
    /// Scaled, masked scores before softmax: `[B, H, Q, K]`.
    pub pre_softmax: Tensor,
    /// Attention probabilities: `[B, H, Q, K]`.
    pub post_softmax: Tensor,
}

/// Incremental state of one layer for the current segment.
#[derive(Debug, Clone)]
pub struct LayerCache {
    /// Un-rotated keys `[B, H, S, D]`.
    pub keys: Tensor,
    /// Values `[B, H, S, D]`.
    pub values: Tensor,
    /// Layer inputs `[B, S, dim]`.
    pub hiddens: Tensor,
}

/// Incremental state of a whole stack: one [`LayerCache`] per layer, all
/// covering the same `seq_len` segment positions.
#[derive(Debug, Clone)]
pub struct StackCache {
    pub layers: Vec<LayerCache>,
    seq_len: usize,
}

impl StackCache {
    pub fn new(layers: Vec<LayerCache>) -> Result<Self> {
        let seq_len = match layers.first() {
            Some(layer) => layer.hiddens.dim(1)?,
            None => 0,
        };
        Ok(Self { layers, seq_len })
    }

    /// Number of segment positions already processed.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }
}

/// Everything a stack produces besides its output tensor.
#[derive(Debug, Clone)]
pub struct LayerIntermediates {
    /// Input of every layer over the whole segment, `[B, S, dim]` each.
    pub hiddens: Vec<Tensor>,
    /// Scores of every layer.
    pub attn: Vec<AttentionIntermediate>,
    /// State to hand back on the next call of the same segment.
    pub cache: StackCache,
    /// Updated memories, filled in by the composer.
    pub mems: Option<Vec<Tensor>>,
    /// Attention z-loss of this stack, filled in by the composer.
    pub attn_z_loss: Option<Tensor>,
}

impl LayerIntermediates {
    pub fn post_softmax_maps(&self) -> Vec<Tensor> {
        self.attn.iter().map(|a| a.post_softmax.clone()).collect()
    }

    pub fn pre_softmax_maps(&self) -> Vec<Tensor> {
        self.attn.iter().map(|a| a.pre_softmax.clone()).collect()
    }
}

/// Per-call options of [`AttentionStack::forward`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StackArgs<'a> {
    /// Key padding `[B, S]` over the whole segment (cached + new), `1` = ignore.
    pub mask: Option<&'a Tensor>,
    /// Memories, one `[B, M, dim]` per layer, attended to ahead of the segment.
    pub mems: Option<&'a [Tensor]>,
    /// Key padding `[B, M]` over the memories, `1` = ignore. Requires `mems`.
    pub mem_mask: Option<&'a Tensor>,
    /// Cache returned by the previous call on this segment.
    pub cache: Option<&'a StackCache>,
    /// Per-batch start offsets `[B]` subtracted from positions.
    pub seq_start_pos: Option<&'a Tensor>,
    /// Enables dropout.
    pub train: bool,
}

/// A stack of attention layers consuming and producing `[B, N, dim]`.
///
/// With a cache of `c` positions, `x` holds only the `N - c` new positions and
/// the output covers those; `hiddens` and the returned cache span all `N`.
pub trait AttentionStack: Send + Sync {
    /// Feature width expected on input and produced on output.
    fn dim(&self) -> usize;

    /// Number of layers, which is also the number of memories consumed.
    fn depth(&self) -> usize;

    /// Stacks that encode positions themselves turn absolute positions off upstream.
    fn disables_abs_pos_emb(&self) -> bool {
        false
    }

    fn forward(&self, x: &Tensor, args: StackArgs<'_>) -> Result<(Tensor, LayerIntermediates)>;
}
