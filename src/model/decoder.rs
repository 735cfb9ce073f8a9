use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{LayerNorm, Module};
use tracing::debug;

use crate::error::Error;
use crate::model::attention::MultiHeadAttention;
use crate::model::embedding::Embeddings;
use crate::model::feed_forward::FeedForward;
use crate::model::ops::{ensure_width, residual_add};

/// Everything a decoder layer attends to besides its own input.
#[derive(Debug, Clone, Copy)]
pub struct DecoderContext<'a> {
    /// Encoder output, `(batch, src_len, hidden_dim)`.
    pub memory: &'a Tensor,
    /// `(tgt_len, tgt_len)`, `1` where attention is allowed.
    pub target_mask: Option<&'a Tensor>,
    /// `(batch, src_len)`, `1` at padding.
    pub source_pad_mask: Option<&'a Tensor>,
    /// `(batch, tgt_len)`, `1` at padding.
    pub target_pad_mask: Option<&'a Tensor>,
}

/// Capability contract for one layer of the decoder stack.
///
/// Implementors that do not supply a body fail with
/// [`Error::NotImplemented`] instead of returning a tensor.
pub trait DecoderLayer: std::fmt::Debug {
    fn forward_t(&self, xs: &Tensor, ctx: &DecoderContext<'_>, train: bool) -> Result<Tensor> {
        let _ = (xs, ctx, train);
        Err(Error::NotImplemented("decoder layer body").into())
    }
}

/// Pre-norm decoder cell: masked self-attention, cross-attention over the
/// encoder memory, then a swish feed-forward, each added back residually.
#[derive(Debug)]
pub struct DecoderCell {
    self_attn_norm: LayerNorm,
    self_attention: MultiHeadAttention,
    cross_attn_norm: LayerNorm,
    cross_attention: MultiHeadAttention,
    ffn_norm: LayerNorm,
    ffn: FeedForward,
    hidden_dim: usize,
}

impl DecoderCell {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_attn_norm: LayerNorm,
        self_attention: MultiHeadAttention,
        cross_attn_norm: LayerNorm,
        cross_attention: MultiHeadAttention,
        ffn_norm: LayerNorm,
        ffn: FeedForward,
        hidden_dim: usize,
    ) -> Self {
        Self {
            self_attn_norm,
            self_attention,
            cross_attn_norm,
            cross_attention,
            ffn_norm,
            ffn,
            hidden_dim,
        }
    }
}

impl DecoderLayer for DecoderCell {
    fn forward_t(&self, xs: &Tensor, ctx: &DecoderContext<'_>, _train: bool) -> Result<Tensor> {
        ensure_width("decoder cell input", xs, self.hidden_dim)?;
        ensure_width("decoder memory", ctx.memory, self.hidden_dim)?;

        let normed = self.self_attn_norm.forward(xs)?;
        let attn = self
            .self_attention
            .self_attention(&normed, ctx.target_pad_mask, ctx.target_mask)?;
        let h = residual_add("decoder self-attention residual", xs, &attn)?;

        let normed = self.cross_attn_norm.forward(&h)?;
        let cross = self.cross_attention.forward(
            &normed,
            ctx.memory,
            ctx.memory,
            ctx.source_pad_mask,
            None,
        )?;
        let h = residual_add("decoder cross-attention residual", &h, &cross)?;

        let ffn = self.ffn.forward(&self.ffn_norm.forward(&h)?)?;
        residual_add("decoder feed-forward residual", &h, &ffn)
    }
}

/// Target embedding followed by a stack of decoder layers.
#[derive(Debug)]
pub struct Decoder<L: DecoderLayer = DecoderCell> {
    embeddings: Embeddings,
    cells: Vec<L>,
}

impl<L: DecoderLayer> Decoder<L> {
    pub fn new(embeddings: Embeddings, cells: Vec<L>) -> Self {
        Self { embeddings, cells }
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn forward_t(&self, tgt_ids: &Tensor, ctx: &DecoderContext<'_>, train: bool) -> Result<Tensor> {
        let mut hidden = self.embeddings.forward_t(tgt_ids, train)?;
        for (idx, cell) in self.cells.iter().enumerate() {
            hidden = cell.forward_t(&hidden, ctx, train)?;
            debug!(cell = idx, shape = ?hidden.dims(), "decoder cell");
        }
        Ok(hidden)
    }

    pub fn forward(&self, tgt_ids: &Tensor, ctx: &DecoderContext<'_>) -> Result<Tensor> {
        self.forward_t(tgt_ids, ctx, false)
    }
}
