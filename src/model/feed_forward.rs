use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Linear, Module};
use serde::{Deserialize, Serialize};

use crate::model::Sublayer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    /// Swish, used by the decoder.
    Silu,
}

impl Activation {
    pub fn apply(self, xs: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Activation::Relu => xs.relu()?,
            Activation::Silu => xs.silu()?,
        })
    }
}

/// Position-wise feed-forward: expand, activate, project back.
#[derive(Debug)]
pub struct FeedForward {
    up: Linear,
    down: Linear,
    activation: Activation,
}

impl FeedForward {
    pub fn new(up: Linear, down: Linear, activation: Activation) -> Self {
        Self {
            up,
            down,
            activation,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.activation.apply(&self.up.forward(x)?)?;
        Ok(self.down.forward(&h)?)
    }
}

impl Sublayer for FeedForward {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        self.forward(xs)
    }
}
