use anyhow::Result;
use candle_core::{DType, Device, Shape, Tensor, D};
use candle_nn::ops::softmax_last_dim;
use candle_nn::{Init, VarBuilder};

use crate::error::Error;

// Finite so that a fully masked row softmaxes to a uniform average, not NaN.
const MASK_FILL: f32 = -1e9;

/// Fails with a shape error unless `xs` is `(batch, length, width)`.
pub fn ensure_width(op: &'static str, xs: &Tensor, width: usize) -> Result<(usize, usize)> {
    let dims = xs.dims();
    match *dims {
        [batch, len, w] if w == width => Ok((batch, len)),
        [batch, len, _] => Err(Error::shape_mismatch(op, &[batch, len, width], dims).into()),
        _ => Err(Error::shape_mismatch(op, &[0, 0, width], dims).into()),
    }
}

/// Zero-pads the channel (last) dimension of a `(batch, length, channels)`
/// tensor up to `width`. Never truncates.
pub fn pad_channels(xs: &Tensor, width: usize) -> Result<Tensor> {
    let (batch, len, channels) = xs.dims3()?;
    if channels > width {
        return Err(Error::shape_mismatch("pad_channels", &[batch, len, width], xs.dims()).into());
    }
    if channels == width {
        return Ok(xs.clone());
    }
    Ok(xs.pad_with_zeros(D::Minus1, 0, width - channels)?)
}

/// Elementwise add that refuses to broadcast.
pub fn residual_add(op: &'static str, residual: &Tensor, update: &Tensor) -> Result<Tensor> {
    if residual.dims() != update.dims() {
        return Err(Error::shape_mismatch(op, residual.dims(), update.dims()).into());
    }
    Ok(residual.add(update)?)
}

/// Xavier (Glorot) uniform initialisation.
pub fn xavier_uniform<S: Into<Shape>>(
    vb: &VarBuilder,
    shape: S,
    name: &str,
    fan_in: usize,
    fan_out: usize,
    gain: f64,
) -> Result<Tensor> {
    let bound = gain * (6.0 / (fan_in + fan_out) as f64).sqrt();
    Ok(vb.get_with_hints(
        shape,
        name,
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?)
}

/// `1` where `ids == pad_id`, shape `(batch, length)`, dtype u8.
pub fn padding_mask(ids: &Tensor, pad_id: u32) -> Result<Tensor> {
    let pad = Tensor::full(pad_id, ids.dims(), ids.device())?.to_dtype(ids.dtype())?;
    Ok(ids.eq(&pad)?)
}

/// Square causal mask of shape `(len, len)`: `1` where the query may attend to
/// the key (key position <= query position), `0` for future positions.
pub fn causal_mask(device: &Device, len: usize) -> Result<Tensor> {
    // Build explicit (len, len) grids to avoid ambiguous broadcasting
    let query_positions = Tensor::arange(0u32, len as u32, device)?.reshape((len, 1))?;
    let key_positions = Tensor::arange(0u32, len as u32, device)?.reshape((1, len))?;

    let q_grid = query_positions.repeat((1, len))?;
    let k_grid = key_positions.repeat((len, 1))?;
    Ok(q_grid.ge(&k_grid)?)
}

/// Combines a key padding mask `(batch, k_len)` (`1` = padding) and an
/// attention mask `(q_len, k_len)` (`1` = allowed) into a keep mask of shape
/// `(batch, 1, q_len, k_len)`.
pub fn attention_keep_mask(
    key_padding: Option<&Tensor>,
    attn_mask: Option<&Tensor>,
    batch: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Option<Tensor>> {
    let target = (batch, 1, q_len, k_len);
    let keys = match key_padding {
        Some(pad) => {
            let (b, k) = pad.dims2()?;
            if (b, k) != (batch, k_len) {
                return Err(
                    Error::shape_mismatch("key_padding_mask", &[batch, k_len], pad.dims()).into(),
                );
            }
            let pad = pad.to_dtype(DType::U8)?;
            let keep = pad.eq(&pad.zeros_like()?)?;
            Some(keep.reshape((batch, 1, 1, k_len))?.broadcast_as(target)?)
        }
        None => None,
    };
    let attn = match attn_mask {
        Some(mask) => {
            let (q, k) = mask.dims2()?;
            if (q, k) != (q_len, k_len) {
                return Err(Error::shape_mismatch("attn_mask", &[q_len, k_len], mask.dims()).into());
            }
            let mask = mask.to_dtype(DType::U8)?;
            Some(mask.reshape((1, 1, q_len, k_len))?.broadcast_as(target)?)
        }
        None => None,
    };
    Ok(match (keys, attn) {
        (Some(a), Some(b)) => Some(a.mul(&b)?),
        (Some(m), None) | (None, Some(m)) => Some(m.contiguous()?),
        (None, None) => None,
    })
}

/// Scaled dot-product attention.
///
/// Expects `q`, `k`, `v` shaped `[batch, heads, q_len, head_dim]`,
/// `[batch, heads, k_len, head_dim]`, `[batch, heads, k_len, head_dim]`.
/// If `mask` is provided, it should be a u8 tensor broadcastable to
/// `[batch, heads, q_len, k_len]` where `1` means keep and `0` means mask.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
) -> Result<Tensor> {
    let in_dtype = q.dtype();
    let (_, _, _, hd) = q.dims4()?;

    let scale = (hd as f64).sqrt();
    let q_f = q.to_dtype(DType::F32)?.contiguous()?;
    let k_t = k.to_dtype(DType::F32)?.transpose(2, 3)?.contiguous()?;
    let v_f = v.to_dtype(DType::F32)?.contiguous()?;

    let mut scores = (q_f.matmul(&k_t)? / scale)?;

    if let Some(m) = mask {
        let m = m.broadcast_as(scores.shape())?;
        let fill = Tensor::full(MASK_FILL, scores.dims().to_vec(), scores.device())?;
        scores = m.where_cond(&scores, &fill)?;
    }

    let attn = softmax_last_dim(&scores)?;
    let ctx = attn.matmul(&v_f)?;
    Ok(ctx.to_dtype(in_dtype)?)
}
