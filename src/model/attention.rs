use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Linear, Module};

use crate::error::Error;
use crate::model::ops::{attention_keep_mask, ensure_width, scaled_dot_product_attention};

/// Multi-head attention with separate query/key/value projections.
///
/// Serves as encoder self-attention, decoder masked self-attention and
/// decoder cross-attention over the encoder memory.
#[derive(Debug)]
pub struct MultiHeadAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    n_head: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(
        q: Linear,
        k: Linear,
        v: Linear,
        o: Linear,
        n_head: usize,
        hidden_dim: usize,
    ) -> Result<Self> {
        if n_head == 0 || !hidden_dim.is_multiple_of(n_head) {
            return Err(Error::config(format!(
                "hidden_dim ({hidden_dim}) must be divisible by a non-zero head count ({n_head})"
            ))
            .into());
        }
        Ok(Self {
            q,
            k,
            v,
            o,
            n_head,
            head_dim: hidden_dim / n_head,
        })
    }

    fn hidden_dim(&self) -> usize {
        self.n_head * self.head_dim
    }

    /// `query` is `(batch, q_len, hidden)`, `key` / `value` are
    /// `(batch, k_len, hidden)`.
    ///
    /// `key_padding_mask` is `(batch, k_len)` with `1` at padding positions;
    /// `attn_mask` is `(q_len, k_len)` with `1` where attention is allowed.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_padding_mask: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let hidden = self.hidden_dim();
        let (batch, q_len) = ensure_width("attention query", query, hidden)?;
        let (_, k_len) = ensure_width("attention key", key, hidden)?;
        ensure_width("attention value", value, hidden)?;

        let q = self.split_heads(&self.q.forward(query)?, batch, q_len)?;
        let k = self.split_heads(&self.k.forward(key)?, batch, k_len)?;
        let v = self.split_heads(&self.v.forward(value)?, batch, k_len)?;

        let mask = attention_keep_mask(key_padding_mask, attn_mask, batch, q_len, k_len)?;

        let context = scaled_dot_product_attention(&q, &k, &v, mask.as_ref())?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_len, hidden))?;

        Ok(self.o.forward(&context)?)
    }

    pub fn self_attention(
        &self,
        xs: &Tensor,
        key_padding_mask: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.forward(xs, xs, xs, key_padding_mask, attn_mask)
    }

    // (B, T, H*D) -> (B, H, T, D), contiguous for the matmuls
    fn split_heads(&self, xs: &Tensor, batch: usize, len: usize) -> Result<Tensor> {
        Ok(xs
            .reshape((batch, len, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }
}
