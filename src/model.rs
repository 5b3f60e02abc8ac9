//! Model components.
//!
//! - [`transformer`]: reference decoder stack with memory, cache and rotary positions
//! - [`stack`]: the `AttentionStack` seam every stack plugs into
//! - [`embedding`]: token, positional and auxiliary embeddings
//! - [`processor`]: per-stream projections and output heads
//! - [`branch`]: pre / backbone / post bookkeeping for memories and caches
//! - [`composer`]: the multi-stream composer
//! - [`recurrence`]: chunked training loss and generation over long sequences

pub mod branch;
pub mod composer;
pub mod embedding;
pub mod processor;
pub mod recurrence;
pub mod stack;
pub mod transformer;
