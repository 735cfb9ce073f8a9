use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{conv1d, Conv1d, Conv1dConfig, Init, Module, VarBuilder};

use crate::error::Error;
use crate::model::ops::{ensure_width, xavier_uniform};
use crate::model::Sublayer;

/// Symmetric "same" padding; only odd kernels keep the length unchanged.
pub(crate) fn same_padding(kernel_size: usize) -> Result<usize> {
    if kernel_size == 0 || kernel_size.is_multiple_of(2) {
        return Err(Error::config(format!(
            "kernel_size ({kernel_size}) must be odd for same padding"
        ))
        .into());
    }
    Ok(kernel_size / 2)
}

/// Runs a conv over a sequence tensor.
pub(crate) fn conv_seq(conv: &Conv1d, xs: &Tensor) -> Result<Tensor> {
    let xs = xs.transpose(1, 2)?.contiguous()?;
    Ok(conv.forward(&xs)?.transpose(1, 2)?.contiguous()?)
}

/// Gated linear unit over a local window: a conv doubles the channels, one
/// half gates the other through a sigmoid.
#[derive(Debug)]
pub struct GatedConvolution {
    conv: Conv1d,
    hidden_dim: usize,
}

impl GatedConvolution {
    pub const DEFAULT_KERNEL: usize = 3;

    pub fn new(vb: VarBuilder, hidden_dim: usize, kernel_size: usize) -> Result<Self> {
        let padding = same_padding(kernel_size)?;
        let out_channels = hidden_dim * 2;
        let weight = xavier_uniform(
            &vb,
            (out_channels, hidden_dim, kernel_size),
            "weight",
            hidden_dim * kernel_size,
            out_channels * kernel_size,
            1.0,
        )?;
        let bound = 1.0 / ((hidden_dim * kernel_size) as f64).sqrt();
        let bias = vb.get_with_hints(
            out_channels,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let cfg = Conv1dConfig {
            padding,
            ..Default::default()
        };
        Ok(Self {
            conv: Conv1d::new(weight, Some(bias), cfg),
            hidden_dim,
        })
    }

    /// Returns `(content, gate)` before the sigmoid is applied.
    pub fn content_and_gate(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        ensure_width("gated_conv input", xs, self.hidden_dim)?;
        let doubled = conv_seq(&self.conv, xs)?;
        let content = doubled.narrow(D::Minus1, 0, self.hidden_dim)?;
        let gate = doubled.narrow(D::Minus1, self.hidden_dim, self.hidden_dim)?;
        Ok((content, gate))
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (content, gate) = self.content_and_gate(xs)?;
        Ok(content.mul(&candle_nn::ops::sigmoid(&gate)?)?)
    }
}

impl Sublayer for GatedConvolution {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        self.forward(xs)
    }
}

/// Depthwise conv (one filter per channel) followed by a pointwise conv.
#[derive(Debug)]
pub struct SeparableConv1D {
    depth_wise: Conv1d,
    point_wise: Conv1d,
    in_channels: usize,
}

impl SeparableConv1D {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
    ) -> Result<Self> {
        let padding = same_padding(kernel_size)?;
        let depth_wise = conv1d(
            in_channels,
            in_channels,
            kernel_size,
            Conv1dConfig {
                padding,
                groups: in_channels,
                ..Default::default()
            },
            vb.pp("depth_wise"),
        )?;
        let point_wise = conv1d(
            in_channels,
            out_channels,
            1,
            Conv1dConfig::default(),
            vb.pp("point_wise"),
        )?;
        Ok(Self {
            depth_wise,
            point_wise,
            in_channels,
        })
    }

    pub fn depthwise(&self, xs: &Tensor) -> Result<Tensor> {
        ensure_width("separable_conv input", xs, self.in_channels)?;
        conv_seq(&self.depth_wise, xs)
    }

    pub fn pointwise(&self, xs: &Tensor) -> Result<Tensor> {
        ensure_width("separable_conv pointwise", xs, self.in_channels)?;
        conv_seq(&self.point_wise, xs)
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.pointwise(&self.depthwise(xs)?)
    }
}

impl Sublayer for SeparableConv1D {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        self.forward(xs)
    }
}
