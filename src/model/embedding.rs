//! Token, positional and auxiliary embeddings.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{init, Embedding, Init, VarBuilder};

use crate::{Error, Result};

fn l2norm(x: &Tensor) -> candle_core::Result<Tensor> {
    let norm = x
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .sqrt()?
        .clamp(1e-12f32, f32::MAX)?;
    x.broadcast_div(&norm)
}

/// Token lookup table with an optional padding index.
///
/// Rows looked up at the padding index are cut out of the gradient graph, so
/// padding never trains its embedding.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    emb: Embedding,
    l2norm: bool,
    padding_idx: Option<u32>,
}

impl TokenEmbedding {
    pub fn new(num_tokens: usize, dim: usize, l2norm: bool, vb: VarBuilder) -> candle_core::Result<Self> {
        let hint = if l2norm {
            Init::Randn {
                mean: 0.0,
                stdev: 1e-5,
            }
        } else {
            init::DEFAULT_KAIMING_NORMAL
        };
        let weight = vb.get_with_hints((num_tokens, dim), "weight", hint)?;
        Ok(Self {
            emb: Embedding::new(weight, dim),
            l2norm,
            padding_idx: None,
        })
    }

    /// `[num_tokens, dim]`
    pub fn weight(&self) -> &Tensor {
        self.emb.embeddings()
    }

    pub fn padding_idx(&self) -> Option<u32> {
        self.padding_idx
    }

    pub fn set_padding_idx(&mut self, idx: Option<u32>) {
        self.padding_idx = idx;
    }

    /// `[B, N]` ids → `[B, N, dim]`
    pub fn forward(&self, ids: &Tensor) -> candle_core::Result<Tensor> {
        let ids = ids.to_dtype(DType::U32)?;
        let x = self.emb.forward(&ids)?;
        let x = match self.padding_idx {
            Some(pad) => {
                let is_pad = ids.eq(pad)?.unsqueeze(D::Minus1)?.broadcast_as(x.shape())?;
                is_pad.where_cond(&x.detach(), &x)?
            }
            None => x,
        };
        if self.l2norm {
            l2norm(&x)
        } else {
            Ok(x)
        }
    }
}

/// Positional embedding added to every stream's token embedding.
#[derive(Debug, Clone)]
pub enum PositionalEmbedding {
    None,
    /// Learned table of `max_seq_len` rows, scaled by `dim^-0.5` unless l2-normed.
    Absolute {
        emb: Embedding,
        scale: f64,
        l2norm: bool,
        max_seq_len: usize,
    },
    /// Fixed sinusoid with a learned scalar scale initialised to `dim^-0.5`.
    ScaledSinusoidal { scale: Tensor, inv_freq: Tensor },
}

impl PositionalEmbedding {
    pub fn absolute(
        dim: usize,
        max_seq_len: usize,
        l2norm: bool,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let weight = vb.get_with_hints((max_seq_len, dim), "emb.weight", init::DEFAULT_KAIMING_NORMAL)?;
        Ok(Self::Absolute {
            emb: Embedding::new(weight, dim),
            scale: if l2norm { 1.0 } else { (dim as f64).powf(-0.5) },
            l2norm,
            max_seq_len,
        })
    }

    pub fn scaled_sinusoidal(dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        if dim % 2 != 0 {
            candle_core::bail!("scaled sinusoidal positions need an even width, got {dim}");
        }
        let half = dim / 2;
        let scale = vb.get_with_hints(1, "scale", Init::Const((dim as f64).powf(-0.5)))?;
        let theta = 10_000f64;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| theta.powf(-(i as f64) / half as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, half, vb.device())?;
        Ok(Self::ScaledSinusoidal { scale, inv_freq })
    }

    /// Positions `0..seq_len` as `[N]`, or `[B, N]` shifted back by per-batch
    /// start offsets and clamped at zero.
    fn default_positions(
        seq_len: usize,
        seq_start_pos: Option<&Tensor>,
        device: &Device,
    ) -> candle_core::Result<Tensor> {
        let pos = Tensor::arange(0u32, seq_len as u32, device)?.to_dtype(DType::F32)?;
        match seq_start_pos {
            Some(start) => pos
                .unsqueeze(0)?
                .broadcast_sub(&start.to_dtype(DType::F32)?.unsqueeze(1)?)?
                .clamp(0f32, f32::MAX),
            None => Ok(pos),
        }
    }

    /// Embeddings for `seq_len` positions, shaped `[N, dim]` or `[B, N, dim]`.
    ///
    /// `pos` overrides the positions (`[N]` or `[B, N]` integer indices).
    pub fn forward(
        &self,
        seq_len: usize,
        pos: Option<&Tensor>,
        seq_start_pos: Option<&Tensor>,
        device: &Device,
    ) -> candle_core::Result<Option<Tensor>> {
        let positions = match pos {
            Some(pos) => pos.to_dtype(DType::F32)?,
            None => Self::default_positions(seq_len, seq_start_pos, device)?,
        };
        match self {
            Self::None => Ok(None),
            Self::Absolute {
                emb,
                scale,
                l2norm: normed,
                max_seq_len,
            } => {
                if seq_len > *max_seq_len {
                    candle_core::bail!(
                        "sequence length {seq_len} exceeds the maximum of {max_seq_len} for absolute positions"
                    );
                }
                let x = emb.forward(&positions.to_dtype(DType::U32)?)?.affine(*scale, 0.0)?;
                if *normed {
                    l2norm(&x).map(Some)
                } else {
                    Ok(Some(x))
                }
            }
            Self::ScaledSinusoidal { scale, inv_freq } => {
                let freqs = positions
                    .unsqueeze(D::Minus1)?
                    .broadcast_mul(inv_freq)?;
                let x = Tensor::cat(&[&freqs.sin()?, &freqs.cos()?], D::Minus1)?;
                x.broadcast_mul(scale).map(Some)
            }
        }
    }
}

/// Auxiliary tables (segment / type ids and the like) of one stream, keyed by name.
#[derive(Debug, Clone)]
pub struct AuxEmbeddings {
    tables: BTreeMap<String, Embedding>,
}

impl AuxEmbeddings {
    pub fn new(
        num_tokens: &BTreeMap<String, usize>,
        dim: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let mut tables = BTreeMap::new();
        for (name, &n) in num_tokens {
            let weight = vb.get_with_hints((n, dim), &format!("{name}.weight"), init::DEFAULT_KAIMING_NORMAL)?;
            tables.insert(name.clone(), Embedding::new(weight, dim));
        }
        Ok(Self { tables })
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Sum of every table looked up at its ids. The key set of `ids` must match
    /// the configured tables exactly.
    pub fn forward(&self, ids: &BTreeMap<String, Tensor>) -> Result<Option<Tensor>> {
        if !ids.keys().eq(self.tables.keys()) {
            return Err(Error::usage(format!(
                "auxiliary embedding ids {:?} do not match the configured tables {:?}",
                ids.keys().collect::<Vec<_>>(),
                self.tables.keys().collect::<Vec<_>>()
            )));
        }
        let mut sum: Option<Tensor> = None;
        for (name, table) in &self.tables {
            let x = table.forward(&ids[name].to_dtype(DType::U32)?)?;
            sum = Some(match sum {
                Some(acc) => (acc + x)?,
                None => x,
            });
        }
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;
    use candle_nn::VarMap;

    fn vb(varmap: &VarMap) -> VarBuilder<'static> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn padding_rows_get_no_gradient() {
        let varmap = VarMap::new();
        let mut emb = TokenEmbedding::new(6, 4, false, vb(&varmap)).unwrap();
        emb.set_padding_idx(Some(0));
        assert_eq!(emb.padding_idx(), Some(0));

        let ids = Tensor::new(&[[0u32, 2, 0, 3]], &Device::Cpu).unwrap();
        let loss = emb.forward(&ids).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();

        let weight: &Var = &varmap.all_vars()[0];
        let grad: Vec<Vec<f32>> = grads.get(weight.as_tensor()).unwrap().to_vec2().unwrap();
        assert!(grad[0].iter().all(|&g| g == 0.0));
        assert!(grad[2].iter().all(|&g| g == 1.0));
        assert!(grad[3].iter().all(|&g| g == 1.0));
    }

    #[test]
    fn l2norm_embeddings_have_unit_norm() {
        let varmap = VarMap::new();
        let emb = TokenEmbedding::new(5, 8, true, vb(&varmap)).unwrap();
        let ids = Tensor::new(&[[1u32, 4]], &Device::Cpu).unwrap();
        let norms: Vec<f32> = emb
            .forward(&ids)
            .unwrap()
            .sqr()
            .unwrap()
            .sum(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for n in norms {
            assert!((n - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn absolute_positions_respect_max_len() {
        let varmap = VarMap::new();
        let pos = PositionalEmbedding::absolute(8, 4, false, vb(&varmap)).unwrap();
        let x = pos.forward(4, None, None, &Device::Cpu).unwrap().unwrap();
        assert_eq!(x.dims(), &[4, 8]);
        assert!(pos.forward(5, None, None, &Device::Cpu).is_err());
    }

    #[test]
    fn start_offsets_shift_positions() {
        let varmap = VarMap::new();
        let pos = PositionalEmbedding::scaled_sinusoidal(8, vb(&varmap)).unwrap();
        let start = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
        let x = pos.forward(3, None, Some(&start), &Device::Cpu).unwrap().unwrap();
        assert_eq!(x.dims(), &[2, 3, 8]);

        // Row 1 sees positions [0, 0, 0] after clamping, matching row 0's position 0.
        let row0: Vec<Vec<f32>> = x.get(0).unwrap().to_vec2().unwrap();
        let row1: Vec<Vec<f32>> = x.get(1).unwrap().to_vec2().unwrap();
        assert_eq!(row1[2], row0[0]);
        assert_eq!(row1[0], row0[0]);
    }

    #[test]
    fn aux_embeddings_require_matching_keys() {
        let varmap = VarMap::new();
        let mut sizes = BTreeMap::new();
        sizes.insert("segment".to_string(), 3);
        let aux = AuxEmbeddings::new(&sizes, 4, vb(&varmap)).unwrap();

        let mut ids = BTreeMap::new();
        ids.insert("segment".to_string(), Tensor::new(&[[0u32, 2]], &Device::Cpu).unwrap());
        let x = aux.forward(&ids).unwrap().unwrap();
        assert_eq!(x.dims(), &[1, 2, 4]);

        ids.insert("type".to_string(), Tensor::new(&[[0u32, 1]], &Device::Cpu).unwrap());
        assert!(matches!(aux.forward(&ids), Err(Error::Usage(_))));
    }
}
