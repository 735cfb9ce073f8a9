use std::env;
use std::path::Path;

use anyhow::Result;
use candle_core::Tensor;
use evolved_transformer::model::{DeviceSpec, ModelArgs, ModelType};
use evolved_transformer::EvolvedTransformer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

const BATCH: usize = 2;
const SEQ_LEN: usize = 16;

fn default_args() -> ModelArgs {
    ModelArgs {
        model_type: ModelType::Evolved,
        vocab_size: 1000,
        hidden_dim: 64,
        pff_dim: 256,
        num_heads: 4,
        num_layers: 4,
        dropout_ratio: 0.1,
        pad_id: 0,
        device: DeviceSpec::Auto,
        max_len: 128,
        layer_norm_eps: 1e-5,
    }
}

fn random_ids(rng: &mut StdRng, vocab_size: usize, shape: (usize, usize)) -> Vec<u32> {
    (0..shape.0 * shape.1)
        .map(|_| rng.gen_range(0..vocab_size as u32))
        .collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let model_args = match args.get(1) {
        Some(path) => ModelArgs::from_file(Path::new(path))?,
        None => default_args(),
    };
    let config = model_args.into_config()?;
    let (model, _varmap) = EvolvedTransformer::new_random(&config)?;
    let device = model.device().clone();

    let mut rng = StdRng::seed_from_u64(42);
    let shape = (BATCH, SEQ_LEN);
    let src = Tensor::from_vec(random_ids(&mut rng, config.vocab_size, shape), shape, &device)?;
    let tgt = Tensor::from_vec(random_ids(&mut rng, config.vocab_size, shape), shape, &device)?;
    let labels = Tensor::from_vec(random_ids(&mut rng, config.vocab_size, shape), shape, &device)?;

    let out = model.forward(&src, &tgt, &labels)?;
    info!(
        logit = ?out.logit.dims(),
        loss = out.loss.to_scalar::<f32>()?,
        "forward pass complete"
    );
    Ok(())
}
