//! Per-stream processing steps and output heads.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::model::stack::{AttentionStack, LayerIntermediates, StackArgs};

/// One step of a stream's pipeline.
pub enum StreamProcessor {
    Identity,
    Linear(Linear),
    Stack(Box<dyn AttentionStack>),
}

impl std::fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Identity => write!(f, "Identity"),
            Self::Linear(l) => write!(f, "Linear({:?})", l.weight().dims()),
            Self::Stack(s) => write!(f, "Stack(dim={}, depth={})", s.dim(), s.depth()),
        }
    }
}

impl StreamProcessor {
    /// Identity when the widths already agree, a linear map otherwise.
    pub fn projection(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        if in_dim == out_dim {
            Ok(Self::Identity)
        } else {
            Ok(Self::Linear(candle_nn::linear(in_dim, out_dim, vb)?))
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }

    /// Output width for a given input width.
    pub fn out_dim(&self, in_dim: usize) -> Result<usize> {
        match self {
            Self::Identity => Ok(in_dim),
            Self::Linear(l) => l.weight().dim(0),
            Self::Stack(s) => Ok(s.dim()),
        }
    }

    /// Only the `Stack` variant produces intermediates.
    pub fn forward(
        &self,
        x: &Tensor,
        args: StackArgs<'_>,
    ) -> Result<(Tensor, Option<LayerIntermediates>)> {
        match self {
            Self::Identity => Ok((x.clone(), None)),
            Self::Linear(l) => Ok((l.forward(x)?, None)),
            Self::Stack(s) => {
                let (out, inter) = s.forward(x, args)?;
                Ok((out, Some(inter)))
            }
        }
    }
}

/// Projection from hidden states to logits.
#[derive(Debug, Clone)]
pub enum OutputHead {
    /// Owns a `[V, dim]` weight.
    Untied(Linear),
    /// Reads the input token embedding `[V, dim]`.
    Tied(Tensor),
}

impl OutputHead {
    pub fn untied(dim: usize, logits_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self::Untied(candle_nn::linear_no_bias(dim, logits_dim, vb)?))
    }

    /// `[B, N, dim]` → `[B, N, V]`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Untied(l) => l.forward(x),
            Self::Tied(w) => x.broadcast_matmul(&w.t()?),
        }
    }
}
