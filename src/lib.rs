//! Multi-stream transformer composition with chunked XL-style recurrence.
//!
//! A candle-based model wrapper for sequences made of several parallel token
//! streams (e.g. pitch / duration / velocity for symbolic music) that share one
//! attention backbone, plus a segment-recurrent wrapper for sequences longer
//! than the model's context window.
//!
//! ## Architecture
//!
//! ```text
//! tokens [B, N, K] ─┬─ stream 0: embed → (+aux) → norm → proj → [pre stack] ─┐
//!                   ├─ stream 1: ...                                          ├─ merge (concat | sum)
//!                   └─ stream K-1: ...                                        ┘
//!                                              ↓
//!                                   backbone AttentionStack (mems, cache)
//!                                              ↓
//!                   ┌─ out 0: map → [post stack] → head (tied | untied) → logits
//!                   └─ out M-1: ...
//! ```
//!
//! [`model::recurrence::ChunkedRecurrence`] splits long sequences into windows,
//! threads memories and caches between them, and aggregates a length-weighted
//! multi-stream loss or samples new tokens.
//!
//! ## Modules
//!
//! - [`config`]: serde configuration for the composer, stacks and recurrence
//! - [`model`]: embeddings, attention stacks, composer, recurrence
//! - [`loss`]: masked cross-entropy and attention z-loss
//! - [`sampling`]: logit filters and token sampling

pub mod config;
pub mod loss;
pub mod model;
pub mod sampling;

mod error;

pub use error::{Error, Result};
