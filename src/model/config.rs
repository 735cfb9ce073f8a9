use std::fs;
use std::path::Path;

use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::builder::{pick_device, safe_try_device};

/// Where the model's parameters live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSpec {
    /// CUDA, then Metal, then CPU.
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    pub fn resolve(self) -> Result<Device> {
        let device = match self {
            DeviceSpec::Auto => pick_device(0)?,
            DeviceSpec::Cpu => Device::Cpu,
            DeviceSpec::Cuda(ordinal) => safe_try_device(move || Device::new_cuda(ordinal))
                .ok_or_else(|| Error::config(format!("cuda device {ordinal} is unavailable")))?,
            DeviceSpec::Metal(ordinal) => safe_try_device(move || Device::new_metal(ordinal))
                .ok_or_else(|| Error::config(format!("metal device {ordinal} is unavailable")))?,
        };
        Ok(device)
    }
}

fn default_max_len() -> usize {
    512
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

/// Immutable model configuration. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolvedConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    /// Inner width of the position-wise feed-forward expansion.
    pub pff_dim: usize,
    pub num_heads: usize,
    /// Number of encoder (and decoder) cells.
    pub num_cells: usize,
    pub dropout_ratio: f32,
    pub pad_id: u32,
    #[serde(default)]
    pub device: DeviceSpec,

    // longest sequence the positional table covers
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl EvolvedConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> { Err(Error::config(msg).into()) };

        if self.vocab_size == 0 {
            return fail("vocab_size must be > 0".into());
        }
        if self.hidden_dim == 0 || !self.hidden_dim.is_multiple_of(2) {
            return fail(format!(
                "hidden_dim ({}) must be positive and even",
                self.hidden_dim
            ));
        }
        if self.num_heads == 0 {
            return fail("num_heads must be > 0".into());
        }
        if !self.hidden_dim.is_multiple_of(self.num_heads) {
            return fail(format!(
                "hidden_dim ({}) must be divisible by num_heads ({})",
                self.hidden_dim, self.num_heads
            ));
        }
        // the narrow branch (hidden_dim / 2) is padded up to pff_dim
        if self.pff_dim < self.narrow_dim() {
            return fail(format!(
                "pff_dim ({}) must be >= hidden_dim / 2 ({})",
                self.pff_dim,
                self.narrow_dim()
            ));
        }
        if !(0.0..1.0).contains(&self.dropout_ratio) {
            return fail(format!(
                "dropout_ratio ({}) must be in [0, 1)",
                self.dropout_ratio
            ));
        }
        if self.pad_id as usize >= self.vocab_size {
            return fail(format!(
                "pad_id ({}) must be < vocab_size ({})",
                self.pad_id, self.vocab_size
            ));
        }
        if self.max_len == 0 {
            return fail("max_len must be > 0".into());
        }
        if self.layer_norm_eps <= 0.0 {
            return fail("layer_norm_eps must be > 0".into());
        }
        Ok(())
    }

    /// Width of the convolutional branches inside an encoder cell.
    pub fn narrow_dim(&self) -> usize {
        self.hidden_dim / 2
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Transformer,
    #[default]
    Evolved,
}

/// On-disk model description, expressed in canonical transformer depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArgs {
    #[serde(default)]
    pub model_type: ModelType,
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub pff_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub dropout_ratio: f32,
    pub pad_id: u32,
    #[serde(default)]
    pub device: DeviceSpec,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl ModelArgs {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let args: Self = serde_json::from_str(&content)?;
        Ok(args)
    }

    /// Derives the cell count and validates the result.
    ///
    /// An evolved cell bundles two canonical layers, so evolved models run
    /// `num_layers / 2` cells.
    pub fn into_config(self) -> Result<EvolvedConfig> {
        let num_cells = match self.model_type {
            ModelType::Evolved => self.num_layers / 2,
            ModelType::Transformer => self.num_layers,
        };
        let config = EvolvedConfig {
            vocab_size: self.vocab_size,
            hidden_dim: self.hidden_dim,
            pff_dim: self.pff_dim,
            num_heads: self.num_heads,
            num_cells,
            dropout_ratio: self.dropout_ratio,
            pad_id: self.pad_id,
            device: self.device,
            max_len: self.max_len,
            layer_norm_eps: self.layer_norm_eps,
        };
        config.validate()?;
        Ok(config)
    }
}
