use std::panic::{catch_unwind, UnwindSafe};

use anyhow::Result;
use candle_core::{utils, DType, Device};
use candle_nn::{conv1d, embedding, layer_norm, linear, Conv1dConfig, Init, Linear, VarBuilder, VarMap};
use tracing::info;

use crate::model::attention::MultiHeadAttention;
use crate::model::config::EvolvedConfig;
use crate::model::conv::{same_padding, GatedConvolution, SeparableConv1D};
use crate::model::decoder::{Decoder, DecoderCell};
use crate::model::embedding::{Embeddings, SinusoidalPositions};
use crate::model::encoder::{
    CellNorms, Encoder, EncoderCell, NarrowBranch, WideBranch, NARROW_KERNEL, SEPARABLE_KERNEL,
};
use crate::model::feed_forward::{Activation, FeedForward};
use crate::model::ops::xavier_uniform;
use crate::model::EvolvedTransformer;

/// Builds the full model. Parameter names follow `encoder.*`, `decoder.*`
/// and `generator`.
pub fn build_model(vb: VarBuilder, config: &EvolvedConfig) -> Result<EvolvedTransformer> {
    config.validate()?;
    let device = vb.device().clone();
    let encoder = load_encoder(vb.pp("encoder"), config, &device)?;
    let decoder = load_decoder(vb.pp("decoder"), config, &device)?;
    let generator = linear(config.hidden_dim, config.vocab_size, vb.pp("generator"))?;
    info!(
        cells = config.num_cells,
        hidden_dim = config.hidden_dim,
        pff_dim = config.pff_dim,
        heads = config.num_heads,
        vocab = config.vocab_size,
        device = ?device,
        "built evolved transformer"
    );
    Ok(EvolvedTransformer::new(config.clone(), encoder, decoder, generator))
}

/// Fresh randomly initialised model on the configured device.
pub fn build_random(config: &EvolvedConfig) -> Result<(EvolvedTransformer, VarMap)> {
    config.validate()?;
    let device = config.device.resolve()?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = build_model(vb, config)?;
    Ok((model, varmap))
}

pub fn load_embeddings(vb: VarBuilder, config: &EvolvedConfig, device: &Device) -> Result<Embeddings> {
    config.validate()?;
    let token_embed = embedding(config.vocab_size, config.hidden_dim, vb.pp("tok"))?;
    let positions = SinusoidalPositions::new(device, config.max_len, config.hidden_dim)?;
    Ok(Embeddings::new(token_embed, positions, config.dropout_ratio))
}

pub fn load_encoder(vb: VarBuilder, config: &EvolvedConfig, device: &Device) -> Result<Encoder> {
    config.validate()?;
    let embeddings = load_embeddings(vb.pp("emb"), config, device)?;
    let mut cells = Vec::with_capacity(config.num_cells);
    for idx in 0..config.num_cells {
        cells.push(load_encoder_cell(vb.pp(format!("cells.{idx}")), config)?);
    }
    Ok(Encoder::new(embeddings, cells))
}

pub fn load_decoder(vb: VarBuilder, config: &EvolvedConfig, device: &Device) -> Result<Decoder> {
    config.validate()?;
    let embeddings = load_embeddings(vb.pp("emb"), config, device)?;
    let mut cells = Vec::with_capacity(config.num_cells);
    for idx in 0..config.num_cells {
        cells.push(load_decoder_cell(vb.pp(format!("cells.{idx}")), config)?);
    }
    Ok(Decoder::new(embeddings, cells))
}

pub fn load_encoder_cell(vb: VarBuilder, config: &EvolvedConfig) -> Result<EncoderCell> {
    config.validate()?;
    let hidden = config.hidden_dim;
    let pff = config.pff_dim;
    let narrow = config.narrow_dim();
    let eps = config.layer_norm_eps;

    let norms = CellNorms {
        glu: layer_norm(hidden, eps, vb.pp("glu_norm"))?,
        branches: layer_norm(hidden, eps, vb.pp("branch_norm"))?,
        separable: layer_norm(pff, eps, vb.pp("mid_norm"))?,
        attention: layer_norm(hidden, eps, vb.pp("attn_norm"))?,
        ffn: layer_norm(hidden, eps, vb.pp("ffn_norm"))?,
    };

    let glu = GatedConvolution::new(vb.pp("glu"), hidden, GatedConvolution::DEFAULT_KERNEL)?;
    let wide = WideBranch::new(linear(hidden, pff, vb.pp("left_branch"))?, config.dropout_ratio);
    let narrow_conv = conv1d(
        hidden,
        narrow,
        NARROW_KERNEL,
        Conv1dConfig {
            padding: same_padding(NARROW_KERNEL)?,
            ..Default::default()
        },
        vb.pp("right_branch"),
    )?;
    let narrow_branch = NarrowBranch::new(narrow_conv, config.dropout_ratio);
    let sep_conv = SeparableConv1D::new(vb.pp("sep_conv"), pff, narrow, SEPARABLE_KERNEL)?;
    let attention = load_attention(vb.pp("attention"), config)?;
    let ffn = load_ffn(vb.pp("pff"), config, Activation::Relu)?;

    Ok(EncoderCell::new(
        norms,
        glu,
        wide,
        narrow_branch,
        sep_conv,
        attention,
        ffn,
        hidden,
        pff,
    ))
}

pub fn load_decoder_cell(vb: VarBuilder, config: &EvolvedConfig) -> Result<DecoderCell> {
    config.validate()?;
    let hidden = config.hidden_dim;
    let eps = config.layer_norm_eps;
    Ok(DecoderCell::new(
        layer_norm(hidden, eps, vb.pp("self_attn_norm"))?,
        load_attention(vb.pp("self_attention"), config)?,
        layer_norm(hidden, eps, vb.pp("cross_attn_norm"))?,
        load_attention(vb.pp("cross_attention"), config)?,
        layer_norm(hidden, eps, vb.pp("ffn_norm"))?,
        load_ffn(vb.pp("pff"), config, Activation::Silu)?,
        hidden,
    ))
}

/// Input projections use Xavier-uniform weights and zero biases.
fn load_attention(vb: VarBuilder, config: &EvolvedConfig) -> Result<MultiHeadAttention> {
    let hidden = config.hidden_dim;
    let proj = |name: &str| -> Result<Linear> {
        let vb = vb.pp(name);
        let weight = xavier_uniform(&vb, (hidden, hidden), "weight", hidden, hidden, 1.0)?;
        let bias = vb.get_with_hints(hidden, "bias", Init::Const(0.0))?;
        Ok(Linear::new(weight, Some(bias)))
    };
    let q = proj("q_proj")?;
    let k = proj("k_proj")?;
    let v = proj("v_proj")?;
    let o = linear(hidden, hidden, vb.pp("out_proj"))?;
    MultiHeadAttention::new(q, k, v, o, config.num_heads, hidden)
}

fn load_ffn(vb: VarBuilder, config: &EvolvedConfig, activation: Activation) -> Result<FeedForward> {
    let up = linear(config.hidden_dim, config.pff_dim, vb.pp("up"))?;
    let down = linear(config.pff_dim, config.hidden_dim, vb.pp("down"))?;
    Ok(FeedForward::new(up, down, activation))
}

pub fn pick_device(local_rank: usize) -> candle_core::Result<Device> {
    if utils::cuda_is_available() {
        // Try CUDA, fall back to CPU if unavailable/unusable.
        if let Some(device) = safe_try_device(|| Device::new_cuda(local_rank)) {
            return Ok(device);
        }
    }
    if utils::metal_is_available() {
        // Candle Metal initialization may panic on misconfigured environments.
        if let Some(device) = safe_try_device(|| Device::new_metal(0)) {
            return Ok(device);
        }
    }
    Ok(Device::Cpu)
}

pub(crate) fn safe_try_device<F>(f: F) -> Option<Device>
where
    F: FnOnce() -> candle_core::Result<Device> + UnwindSafe,
{
    match catch_unwind(f) {
        Ok(Ok(device)) => Some(device),
        Ok(Err(_)) | Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{self, Error};
    use crate::model::config::DeviceSpec;

    fn config() -> EvolvedConfig {
        EvolvedConfig {
            vocab_size: 30,
            hidden_dim: 8,
            pff_dim: 16,
            num_heads: 2,
            num_cells: 2,
            dropout_ratio: 0.1,
            pad_id: 0,
            device: DeviceSpec::Cpu,
            max_len: 16,
            layer_norm_eps: 1e-5,
        }
    }

    #[test]
    fn safe_try_device_returns_none_on_panic() {
        let got = safe_try_device(|| -> candle_core::Result<Device> {
            panic!("simulated backend panic");
        });
        assert!(got.is_none());
    }

    #[test]
    fn safe_try_device_returns_device_on_success() {
        let got = safe_try_device(|| Ok(Device::Cpu));
        assert!(matches!(got, Some(Device::Cpu)));
    }

    #[test]
    fn parameter_names_follow_layout() -> Result<()> {
        let (_model, varmap) = build_random(&config())?;
        let data = varmap.data().lock().unwrap();
        for name in [
            "encoder.emb.tok.weight",
            "encoder.cells.0.glu.weight",
            "encoder.cells.1.sep_conv.depth_wise.weight",
            "encoder.cells.1.mid_norm.weight",
            "encoder.cells.0.right_branch.weight",
            "decoder.cells.1.cross_attention.q_proj.weight",
            "generator.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        let sep = data["encoder.cells.0.sep_conv.depth_wise.weight"].as_tensor();
        assert_eq!(sep.dims(), &[16, 1, 9]);
        let right = data["encoder.cells.0.right_branch.weight"].as_tensor();
        assert_eq!(right.dims(), &[4, 8, 3]);
        Ok(())
    }

    #[test]
    fn attention_biases_start_at_zero() -> Result<()> {
        let (_model, varmap) = build_random(&config())?;
        let data = varmap.data().lock().unwrap();
        let bias = data["encoder.cells.0.attention.k_proj.bias"].as_tensor();
        assert_eq!(bias.abs()?.max_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn encoder_cell_rejects_invalid_config() {
        let device = Device::Cpu;
        for bad in [
            EvolvedConfig {
                num_heads: 0,
                ..config()
            },
            EvolvedConfig {
                num_heads: 3,
                ..config()
            },
            EvolvedConfig {
                pff_dim: 2,
                ..config()
            },
        ] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let err = load_encoder_cell(vb, &bad).unwrap_err();
            assert!(
                matches!(error::kind(&err), Some(Error::Config(_))),
                "heads={} pff={}: {err}",
                bad.num_heads,
                bad.pff_dim
            );
        }
    }

    #[test]
    fn stack_loaders_reject_zero_heads() {
        let device = Device::Cpu;
        let bad = EvolvedConfig {
            num_heads: 0,
            ..config()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = load_encoder(vb.pp("encoder"), &bad, &device).unwrap_err();
        let decoder = load_decoder(vb.pp("decoder"), &bad, &device).unwrap_err();
        let cell = load_decoder_cell(vb.pp("cell"), &bad).unwrap_err();
        for err in [encoder, decoder, cell] {
            assert!(matches!(error::kind(&err), Some(Error::Config(_))));
        }
    }

    #[test]
    fn invalid_config_fails_before_allocation() {
        let config = EvolvedConfig {
            num_heads: 3,
            ..config()
        };
        let err = build_random(&config).err().unwrap();
        assert!(matches!(error::kind(&err), Some(Error::Config(_))));
    }
}
