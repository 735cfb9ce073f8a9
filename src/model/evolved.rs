use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::{Linear, Module, VarMap};
use tracing::debug;

use crate::model::builder::build_random;
use crate::model::config::EvolvedConfig;
use crate::model::decoder::{Decoder, DecoderCell, DecoderContext, DecoderLayer};
use crate::model::encoder::Encoder;
use crate::model::loss::{cross_entropy_loss, LossReduction};
use crate::model::ops::{causal_mask, padding_mask};

/// Result of a full forward pass, built fresh per call.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// (batch, tgt_len, vocab_size)
    pub logit: Tensor,
    /// Scalar mean cross entropy over non-pad labels.
    pub loss: Tensor,
}

/// Encoder-decoder model with evolved encoder cells and a vocabulary head.
#[derive(Debug)]
pub struct EvolvedTransformer<L: DecoderLayer = DecoderCell> {
    config: EvolvedConfig,
    encoder: Encoder,
    decoder: Decoder<L>,
    generator: Linear,
}

impl EvolvedTransformer {
    /// Randomly initialised model on the configured device, with the
    /// `VarMap` that owns its parameters.
    pub fn new_random(config: &EvolvedConfig) -> Result<(Self, VarMap)> {
        build_random(config)
    }
}

impl<L: DecoderLayer> EvolvedTransformer<L> {
    pub fn new(config: EvolvedConfig, encoder: Encoder, decoder: Decoder<L>, generator: Linear) -> Self {
        Self {
            config,
            encoder,
            decoder,
            generator,
        }
    }

    pub fn config(&self) -> &EvolvedConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        self.generator.weight().device()
    }

    /// `1` where `ids == pad_id`.
    pub fn pad_mask(&self, ids: &Tensor) -> Result<Tensor> {
        padding_mask(ids, self.config.pad_id)
    }

    pub fn encode(&self, src_ids: &Tensor, src_pad_mask: &Tensor) -> Result<Tensor> {
        self.encoder.forward(src_ids, Some(src_pad_mask))
    }

    pub fn decode(
        &self,
        tgt_ids: &Tensor,
        memory: &Tensor,
        tgt_mask: &Tensor,
        src_pad_mask: &Tensor,
        tgt_pad_mask: &Tensor,
    ) -> Result<Tensor> {
        let ctx = DecoderContext {
            memory,
            target_mask: Some(tgt_mask),
            source_pad_mask: Some(src_pad_mask),
            target_pad_mask: Some(tgt_pad_mask),
        };
        self.decoder.forward(tgt_ids, &ctx)
    }

    /// Evaluation-mode forward pass.
    pub fn forward(&self, src_ids: &Tensor, tgt_ids: &Tensor, labels: &Tensor) -> Result<ModelOutput> {
        self.forward_t(src_ids, tgt_ids, labels, false)
    }

    pub fn forward_t(
        &self,
        src_ids: &Tensor,
        tgt_ids: &Tensor,
        labels: &Tensor,
        train: bool,
    ) -> Result<ModelOutput> {
        let (_batch, tgt_len) = tgt_ids.dims2()?;
        let src_pad_mask = self.pad_mask(src_ids)?;
        let tgt_pad_mask = self.pad_mask(tgt_ids)?;
        let tgt_mask = causal_mask(tgt_ids.device(), tgt_len)?;

        let memory = self.encoder.forward_t(src_ids, Some(&src_pad_mask), train)?;
        let ctx = DecoderContext {
            memory: &memory,
            target_mask: Some(&tgt_mask),
            source_pad_mask: Some(&src_pad_mask),
            target_pad_mask: Some(&tgt_pad_mask),
        };
        let dec_out = self.decoder.forward_t(tgt_ids, &ctx, train)?;
        let logit = self.generator.forward(&dec_out)?;

        let loss = cross_entropy_loss(
            &logit,
            labels,
            i64::from(self.config.pad_id),
            LossReduction::Mean,
        )?;
        debug!(logit = ?logit.dims(), "forward pass");
        Ok(ModelOutput { logit, loss })
    }
}
