use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Conv1d, Dropout, LayerNorm, Linear, Module};
use tracing::debug;

use crate::model::attention::MultiHeadAttention;
use crate::model::conv::{conv_seq, GatedConvolution, SeparableConv1D};
use crate::model::embedding::Embeddings;
use crate::model::feed_forward::FeedForward;
use crate::model::ops::{ensure_width, pad_channels, residual_add};
use crate::model::Sublayer;

pub const NARROW_KERNEL: usize = 3;
pub const SEPARABLE_KERNEL: usize = 9;

/// Dense widening branch: linear to `pff_dim`, relu, dropout.
#[derive(Debug)]
pub struct WideBranch {
    linear: Linear,
    dropout: Dropout,
}

impl WideBranch {
    pub fn new(linear: Linear, dropout_ratio: f32) -> Self {
        Self {
            linear,
            dropout: Dropout::new(dropout_ratio),
        }
    }
}

impl Sublayer for WideBranch {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.linear.forward(xs)?.relu()?;
        Ok(self.dropout.forward(&h, train)?)
    }
}

/// Convolutional branch: kernel-3 conv to `hidden_dim / 2`, relu, dropout.
#[derive(Debug)]
pub struct NarrowBranch {
    conv: Conv1d,
    dropout: Dropout,
}

impl NarrowBranch {
    pub fn new(conv: Conv1d, dropout_ratio: f32) -> Self {
        Self {
            conv,
            dropout: Dropout::new(dropout_ratio),
        }
    }
}

impl Sublayer for NarrowBranch {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = conv_seq(&self.conv, xs)?.relu()?;
        Ok(self.dropout.forward(&h, train)?)
    }
}

/// Layer norms of one cell, one per stage.
#[derive(Debug)]
pub struct CellNorms {
    pub glu: LayerNorm,
    pub branches: LayerNorm,
    /// Over `pff_dim`, the width of the fused branches.
    pub separable: LayerNorm,
    pub attention: LayerNorm,
    pub ffn: LayerNorm,
}

/// One evolved cell: pre-norm residual stages
///
/// ```text
/// B1 = GLU(norm(x))
/// B2 = dropout(relu(linear(norm(B1)))) + pad(dropout(relu(conv3(norm(B1)))))
/// B3 = B1 + pad(sep_conv9(norm(B2)))
/// B4 = B3 + self_attention(norm(B3))
/// y  = B4 + ffn(norm(B4))
/// ```
#[derive(Debug)]
pub struct EncoderCell {
    norms: CellNorms,
    glu: GatedConvolution,
    wide: WideBranch,
    narrow: NarrowBranch,
    sep_conv: SeparableConv1D,
    attention: MultiHeadAttention,
    ffn: FeedForward,
    hidden_dim: usize,
    pff_dim: usize,
}

impl EncoderCell {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        norms: CellNorms,
        glu: GatedConvolution,
        wide: WideBranch,
        narrow: NarrowBranch,
        sep_conv: SeparableConv1D,
        attention: MultiHeadAttention,
        ffn: FeedForward,
        hidden_dim: usize,
        pff_dim: usize,
    ) -> Self {
        Self {
            norms,
            glu,
            wide,
            narrow,
            sep_conv,
            attention,
            ffn,
            hidden_dim,
            pff_dim,
        }
    }

    /// Stage 2: both branches over `norm(B1)`, narrow one padded to `pff_dim`.
    pub fn fuse_branches(&self, b1: &Tensor, train: bool) -> Result<Tensor> {
        let normed = self.norms.branches.forward(b1)?;
        let left = self.wide.forward_t(&normed, train)?;
        let right = self.narrow.forward_t(&normed, train)?;
        let right = pad_channels(&right, self.pff_dim)?;
        residual_add("branch fusion", &left, &right)
    }

    /// `src_pad_mask` is `(batch, length)`, `1` at padding; it only masks
    /// attention keys.
    pub fn forward_t(&self, xs: &Tensor, src_pad_mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        ensure_width("encoder cell input", xs, self.hidden_dim)?;

        let b1 = self.glu.forward(&self.norms.glu.forward(xs)?)?;

        let b2 = self.fuse_branches(&b1, train)?;

        let sep = self
            .sep_conv
            .forward(&self.norms.separable.forward(&b2)?)?;
        let b3 = residual_add("separable residual", &b1, &pad_channels(&sep, self.hidden_dim)?)?;

        let normed = self.norms.attention.forward(&b3)?;
        let attn = self.attention.self_attention(&normed, src_pad_mask, None)?;
        let b4 = residual_add("attention residual", &b3, &attn)?;

        let ffn = self.ffn.forward(&self.norms.ffn.forward(&b4)?)?;
        residual_add("feed-forward residual", &b4, &ffn)
    }

    pub fn forward(&self, xs: &Tensor, src_pad_mask: Option<&Tensor>) -> Result<Tensor> {
        self.forward_t(xs, src_pad_mask, false)
    }
}

/// Embedding followed by a stack of encoder cells.
#[derive(Debug)]
pub struct Encoder {
    embeddings: Embeddings,
    cells: Vec<EncoderCell>,
}

impl Encoder {
    pub fn new(embeddings: Embeddings, cells: Vec<EncoderCell>) -> Self {
        Self { embeddings, cells }
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn embeddings(&self) -> &Embeddings {
        &self.embeddings
    }

    /// Returns the memory tensor `(batch, length, hidden_dim)`.
    pub fn forward_t(&self, src_ids: &Tensor, src_pad_mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let mut hidden = self.embeddings.forward_t(src_ids, train)?;
        for (idx, cell) in self.cells.iter().enumerate() {
            hidden = cell.forward_t(&hidden, src_pad_mask, train)?;
            debug!(cell = idx, shape = ?hidden.dims(), "encoder cell");
        }
        Ok(hidden)
    }

    pub fn forward(&self, src_ids: &Tensor, src_pad_mask: Option<&Tensor>) -> Result<Tensor> {
        self.forward_t(src_ids, src_pad_mask, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{self, Error};
    use crate::model::builder::{load_encoder, load_encoder_cell};
    use crate::model::config::{DeviceSpec, EvolvedConfig};
    use crate::model::ops::padding_mask;
    use candle_core::{DType, Device, D};
    use candle_nn::{VarBuilder, VarMap};

    fn config(hidden_dim: usize, pff_dim: usize, num_heads: usize, num_cells: usize) -> EvolvedConfig {
        EvolvedConfig {
            vocab_size: 50,
            hidden_dim,
            pff_dim,
            num_heads,
            num_cells,
            dropout_ratio: 0.1,
            pad_id: 0,
            device: DeviceSpec::Cpu,
            max_len: 32,
            layer_norm_eps: 1e-5,
        }
    }

    #[test]
    fn cell_preserves_shape() -> Result<()> {
        let device = Device::Cpu;
        for (hidden, pff, heads) in [(8, 16, 2), (8, 4, 4), (12, 48, 3), (16, 8, 1)] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let cell = load_encoder_cell(vb, &config(hidden, pff, heads, 1))?;

            let xs = Tensor::randn(0f32, 1., (2, 7, hidden), &device)?;
            let out = cell.forward(&xs, None)?;
            assert_eq!(out.dims(), xs.dims(), "hidden={hidden} pff={pff}");
            let out_train = cell.forward_t(&xs, None, true)?;
            assert_eq!(out_train.dims(), xs.dims());
        }
        Ok(())
    }

    #[test]
    fn fused_branches_have_pff_width() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cell = load_encoder_cell(vb, &config(8, 24, 2, 1))?;

        let b1 = Tensor::randn(0f32, 1., (1, 5, 8), &device)?;
        let fused = cell.fuse_branches(&b1, false)?;
        assert_eq!(fused.dims(), &[1, 5, 24]);

        // beyond hidden_dim / 2 only the wide branch contributes
        let normed = cell.norms.branches.forward(&b1)?;
        let wide = cell.wide.forward_t(&normed, false)?;
        let diff = (fused.narrow(D::Minus1, 4, 20)? - wide.narrow(D::Minus1, 4, 20)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn sublayers_preserve_length() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cell = load_encoder_cell(vb, &config(8, 16, 2, 1))?;

        let xs = Tensor::randn(0f32, 1., (2, 6, 8), &device)?;
        let b2 = cell.fuse_branches(&xs, false)?;
        let cases: [(&dyn Sublayer, &Tensor, usize); 5] = [
            (&cell.glu, &xs, 8),
            (&cell.wide, &xs, 16),
            (&cell.narrow, &xs, 4),
            (&cell.sep_conv, &b2, 4),
            (&cell.ffn, &xs, 8),
        ];
        for (sublayer, input, width) in cases {
            let out = sublayer.forward_t(input, true)?;
            assert_eq!(out.dims(), &[2, 6, width]);
        }
        Ok(())
    }

    #[test]
    fn eval_mode_is_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cell = load_encoder_cell(vb, &config(8, 16, 2, 1))?;

        let xs = Tensor::randn(0f32, 1., (1, 4, 8), &device)?;
        let a = cell.forward(&xs, None)?;
        let b = cell.forward(&xs, None)?;
        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn cell_rejects_wrong_width() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cell = load_encoder_cell(vb, &config(8, 16, 2, 1))?;

        let xs = Tensor::zeros((1, 4, 10), DType::F32, &device)?;
        let err = cell.forward(&xs, None).unwrap_err();
        assert!(matches!(
            error::kind(&err),
            Some(Error::ShapeMismatch { op: "encoder cell input", .. })
        ));
        Ok(())
    }

    #[test]
    fn zero_cells_is_embedding_only() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = load_encoder(vb, &config(8, 16, 2, 0), &device)?;
        assert_eq!(encoder.num_cells(), 0);

        let ids = Tensor::from_vec(vec![3u32, 4, 5, 0], (1, 4), &device)?;
        let mask = padding_mask(&ids, 0)?;
        let memory = encoder.forward(&ids, Some(&mask))?;
        let embedded = encoder.embeddings().forward(&ids)?;
        let diff = (memory - embedded)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn encoder_stack_output_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = load_encoder(vb, &config(8, 16, 2, 3), &device)?;
        assert_eq!(encoder.num_cells(), 3);

        let ids = Tensor::from_vec(vec![3u32, 4, 5, 0, 7, 8, 0, 0], (2, 4), &device)?;
        let mask = padding_mask(&ids, 0)?;
        let memory = encoder.forward(&ids, Some(&mask))?;
        assert_eq!(memory.dims(), &[2, 4, 8]);
        for value in memory.flatten_all()?.to_vec1::<f32>()? {
            assert!(value.is_finite());
        }
        Ok(())
    }
}
