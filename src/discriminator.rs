use candle_core::{Result, Tensor};
use candle_nn as nn;
use nn::{Module, ModuleT};
use serde::{Deserialize, Serialize};

use crate::generator::IMAGE_CHANNELS;
use crate::error::Error;
use crate::layers::{conv_config, sigmoid, Layer, Sequential};

/// (out_channels, stride) of conv2..conv8.
const STAGES: [(usize, usize); 7] = [
    (64, 2),
    (128, 1),
    (128, 2),
    (256, 1),
    (256, 2),
    (512, 1),
    (512, 2),
];

/// Spatial extent reaching the last batch norm for an `h x w` input.
pub fn body_extent(h: usize, w: usize) -> (usize, usize) {
    STAGES
        .iter()
        .filter(|(_, stride)| *stride == 2)
        .fold((h, w), |(h, w), _| (h.div_ceil(2), w.div_ceil(2)))
}

/// Training-mode batch norm needs at least two values per channel at every
/// stage, otherwise its unbiased running variance becomes NaN.
pub fn check_train_shape(batch: usize, h: usize, w: usize) -> crate::Result<()> {
    let (bh, bw) = body_extent(h, w);
    if batch * bh * bw < 2 {
        return Err(Error::Config(format!(
            "a training batch of {batch} at {h}x{w} leaves {} value(s) per channel at the \
             last discriminator batch norm, need at least 2",
            batch * bh * bw
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscriminatorConfig {
    /// Channel count of the entry convolution.
    pub base_channels: usize,
    /// Padding of the final 1x1 convolution. Nonzero padding adds a border of
    /// bias-only activations that the global pool averages in.
    pub head_padding: usize,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            base_channels: 64,
            head_padding: 1,
        }
    }
}

/// Fully-convolutional classifier returning one probability per sample, shape `[batch, 1]`.
#[derive(Debug)]
pub struct Discriminator {
    body: Sequential,
    conv9: nn::Conv2d,
    config: DiscriminatorConfig,
}

impl Discriminator {
    pub fn load(vb: nn::VarBuilder, config: DiscriminatorConfig) -> crate::Result<Self> {
        if config.base_channels == 0 {
            return Err(Error::Architecture(
                "discriminator needs at least one channel".into(),
            ));
        }
        let scale = |c: usize| c * config.base_channels / 64;
        let mut body = Sequential::with_capacity(2 + 3 * STAGES.len());
        let mut channels = scale(64);
        body.add(Layer::Conv2d(nn::conv2d(
            IMAGE_CHANNELS,
            channels,
            3,
            conv_config(1, 1),
            vb.pp("conv1"),
        )?));
        body.add(Layer::Swish);
        for (i, &(out, stride)) in STAGES.iter().enumerate() {
            let out = scale(out).max(1);
            body.add(Layer::Conv2d(nn::conv2d(
                channels,
                out,
                3,
                conv_config(1, stride),
                vb.pp(format!("conv{}", i + 2)),
            )?));
            body.add(Layer::BatchNorm(nn::batch_norm(
                out,
                nn::BatchNormConfig::default(),
                vb.pp(format!("bn{}", i + 2)),
            )?));
            body.add(Layer::Swish);
            channels = out;
        }
        let conv9 = nn::conv2d(
            channels,
            1,
            1,
            conv_config(config.head_padding, 1),
            vb.pp("conv9"),
        )?;
        Ok(Self {
            body,
            conv9,
            config,
        })
    }

    pub fn config(&self) -> &DiscriminatorConfig {
        &self.config
    }
}

impl ModuleT for Discriminator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if train {
            let (b, _, h, w) = xs.dims4()?;
            check_train_shape(b, h, w).map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        }
        let x = self.body.forward_t(xs, train)?;
        let x = self.conv9.forward(&x)?;
        // pool over the conv output's own extent, whatever the head padding
        let pooled = x.mean_keepdim(3)?.mean_keepdim(2)?;
        sigmoid(&pooled)?.flatten_from(1)
    }
}
