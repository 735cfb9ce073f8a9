use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Dropout, Embedding, Module};

const BASE_THETA: f32 = 10_000.0;

/// Fixed sinusoidal position table, even channels `sin`, odd channels `cos`.
#[derive(Debug)]
pub struct SinusoidalPositions {
    /// (max_positions, hidden_dim)
    table: Tensor,
    max_positions: usize,
}

impl SinusoidalPositions {
    pub fn new(device: &Device, max_positions: usize, hidden_dim: usize) -> Result<Self> {
        ensure!(
            hidden_dim.is_multiple_of(2),
            "hidden_dim must be even for sinusoidal positions"
        );
        let half_dim = hidden_dim / 2;

        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| BASE_THETA.powf(-((2 * i) as f32 / hidden_dim as f32)))
            .collect();

        let positions = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_positions, 1))?;
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;
        let angles = positions.matmul(&inv_freq)?;

        // interleave: (P, half, 2) -> (P, hidden)
        let table = Tensor::stack(&[&angles.sin()?, &angles.cos()?], D::Minus1)?
            .reshape((max_positions, hidden_dim))?;

        Ok(Self {
            table,
            max_positions,
        })
    }

    /// `(1, seq_len, hidden_dim)` slice for positions `0..seq_len`.
    pub fn slice(&self, seq_len: usize) -> Result<Tensor> {
        ensure!(
            seq_len <= self.max_positions,
            "sequence length {} exceeds max {}",
            seq_len,
            self.max_positions
        );
        Ok(self.table.narrow(0, 0, seq_len)?.unsqueeze(0)?)
    }
}

/// Token embedding scaled by `sqrt(hidden_dim)` plus sinusoidal positions.
#[derive(Debug)]
pub struct Embeddings {
    token_embed: Embedding,
    positions: SinusoidalPositions,
    dropout: Dropout,
    scale: f64,
}

impl Embeddings {
    pub fn new(token_embed: Embedding, positions: SinusoidalPositions, dropout_ratio: f32) -> Self {
        let hidden_dim = token_embed.hidden_size();
        Self {
            token_embed,
            positions,
            dropout: Dropout::new(dropout_ratio),
            scale: (hidden_dim as f64).sqrt(),
        }
    }

    pub fn hidden_dim(&self) -> usize {
        self.token_embed.hidden_size()
    }

    /// Maps `(batch, length)` ids to `(batch, length, hidden_dim)`.
    pub fn forward_t(&self, ids: &Tensor, train: bool) -> Result<Tensor> {
        let (_batch, seq_len) = ids.dims2()?;
        ensure!(seq_len > 0, "embedding expects seq_len > 0");
        let tokens = (self.token_embed.forward(ids)? * self.scale)?;
        let xs = tokens.broadcast_add(&self.positions.slice(seq_len)?)?;
        Ok(self.dropout.forward(&xs, train)?)
    }

    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        self.forward_t(ids, false)
    }
}
