//! Per-branch state bundles and memory helpers.
//!
//! The composer has up to three kinds of branches: per-stream pre stacks, the
//! shared backbone, and per-stream post stacks. Memories, caches and attention
//! maps are all carried in a [`BranchState`] so every call site addresses a
//! branch by name rather than by tuple position.

use candle_core::{Result, Tensor};

use crate::model::stack::StackCache;

/// One value per active branch.
#[derive(Debug, Clone)]
pub struct BranchState<T> {
    /// One entry per input stream, when pre stacks are configured.
    pub pre: Option<Vec<T>>,
    pub backbone: T,
    /// One entry per output stream, when post stacks are configured.
    pub post: Option<Vec<T>>,
}

impl<T> BranchState<T> {
    pub fn backbone_only(backbone: T) -> Self {
        Self {
            pre: None,
            backbone,
            post: None,
        }
    }

    pub fn pre_stream(&self, stream: usize) -> Option<&T> {
        self.pre.as_ref().and_then(|p| p.get(stream))
    }

    pub fn post_stream(&self, stream: usize) -> Option<&T> {
        self.post.as_ref().and_then(|p| p.get(stream))
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> BranchState<U> {
        BranchState {
            pre: self.pre.map(|v| v.into_iter().map(&mut f).collect()),
            backbone: f(self.backbone),
            post: self.post.map(|v| v.into_iter().map(&mut f).collect()),
        }
    }

    /// Values in branch order: pre streams, backbone, post streams.
    pub fn into_ordered(self) -> Vec<T> {
        let mut out = self.pre.unwrap_or_default();
        out.push(self.backbone);
        out.extend(self.post.unwrap_or_default());
        out
    }
}

/// Per-layer memories of one stack.
pub type Memories = BranchState<Vec<Tensor>>;
/// Incremental caches of every stack.
pub type Caches = BranchState<StackCache>;
/// Post-softmax attention maps, one per layer, of every stack.
pub type AttentionMaps = BranchState<Vec<Tensor>>;

/// Append `hiddens` to `mems` along the sequence axis, keep the most recent
/// `max_len` positions and cut the result out of the gradient graph.
///
/// Without incoming memories the hiddens alone are truncated.
pub fn extend_memories(
    mems: Option<&[Tensor]>,
    hiddens: &[Tensor],
    max_len: usize,
) -> Result<Vec<Tensor>> {
    if let Some(mems) = mems {
        if mems.len() != hiddens.len() {
            candle_core::bail!(
                "cannot extend {} memories with {} hidden states",
                mems.len(),
                hiddens.len()
            );
        }
    }
    hiddens
        .iter()
        .enumerate()
        .map(|(i, hidden)| {
            let joined = match mems {
                Some(mems) => Tensor::cat(&[&mems[i], hidden], 1)?,
                None => hidden.clone(),
            };
            let len = joined.dim(1)?;
            let keep = len.min(max_len);
            Ok(joined.narrow(1, len - keep, keep)?.detach())
        })
        .collect()
}

/// Rotate the first `shift` layer memories to the end of the list.
pub fn shift_memories(mems: &[Tensor], shift: usize) -> Vec<Tensor> {
    let mut out = mems.to_vec();
    let shift = shift.min(out.len());
    out.rotate_left(shift);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn positions(start: usize, len: usize) -> Tensor {
        // [1, len, 1] holding the position index as its only feature
        let data: Vec<f32> = (start..start + len).map(|i| i as f32).collect();
        Tensor::from_vec(data, (1, len, 1), &Device::Cpu).unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn memory_length_is_min_of_total_and_cap() {
        let (window, cap) = (3usize, 7usize);
        let mut mems: Option<Vec<Tensor>> = None;
        for n in 1..=5 {
            let hiddens = vec![positions((n - 1) * window, window)];
            let next = extend_memories(mems.as_deref(), &hiddens, cap).unwrap();
            assert_eq!(next[0].dim(1).unwrap(), (n * window).min(cap));
            mems = Some(next);
        }
        // 15 positions produced, the last 7 kept.
        let kept = values(&mems.unwrap()[0]);
        assert_eq!(kept, (8..15).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn memories_are_detached() {
        let var = candle_core::Var::from_tensor(&positions(0, 4)).unwrap();
        let mems = extend_memories(None, &[var.as_tensor().clone()], 4).unwrap();
        let loss = mems[0].sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(var.as_tensor()).is_none());
    }

    #[test]
    fn layer_count_mismatch_fails() {
        let mems = vec![positions(0, 2), positions(0, 2)];
        assert!(extend_memories(Some(&mems), &[positions(2, 2)], 8).is_err());
    }

    #[test]
    fn shift_rotates_head_to_tail() {
        let mems: Vec<Tensor> = (0..4)
            .map(|i| Tensor::full(i as f32, (1, 1, 1), &Device::Cpu).unwrap())
            .collect();
        let shifted = shift_memories(&mems, 1);
        let firsts: Vec<f32> = shifted.iter().flat_map(values).collect();
        assert_eq!(firsts, vec![1.0, 2.0, 3.0, 0.0]);
        assert_eq!(shift_memories(&mems, 0).len(), 4);
    }

    #[test]
    fn ordered_follows_branch_topology() {
        let state = BranchState {
            pre: Some(vec![0, 1]),
            backbone: 2,
            post: Some(vec![3]),
        };
        assert_eq!(state.clone().map(|v| v * 10).backbone, 20);
        assert_eq!(state.into_ordered(), vec![0, 1, 2, 3]);
        assert_eq!(BranchState::backbone_only(DType::F32).into_ordered().len(), 1);
    }
}
