pub mod attention;
pub mod builder;
pub mod config;
pub mod conv;
pub mod decoder;
pub mod embedding;
pub mod encoder;
pub mod evolved;
pub mod feed_forward;
pub mod loss;
pub mod ops;

use anyhow::Result;
use candle_core::Tensor;

pub use config::{DeviceSpec, EvolvedConfig, ModelArgs, ModelType};
pub use decoder::{Decoder, DecoderCell, DecoderLayer};
pub use encoder::{Encoder, EncoderCell};
pub use evolved::{EvolvedTransformer, ModelOutput};
pub use loss::{cross_entropy_loss, LossReduction};

pub type TokenId = u32;

/// A sequence-to-sequence sublayer: `(batch, length, _)` in, `(batch, length, _)` out.
///
/// `train` enables dropout where the sublayer has any.
pub trait Sublayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor>;
}
