use candle_core::{Result, Tensor};
use candle_nn as nn;
use nn::{Module, ModuleT};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::layers::{conv_config, swish};

/// Weight of the residual path relative to the identity path.
pub const RESIDUAL_SCALE: f64 = 0.1;

/// Channel-to-space factor of one upsample block.
pub const SHUFFLE_FACTOR: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidualBlockConfig {
    pub in_channels: usize,
    pub channels: usize,
    pub kernel: usize,
    pub stride: usize,
}

impl Default for ResidualBlockConfig {
    fn default() -> Self {
        Self {
            in_channels: 64,
            channels: 64,
            kernel: 3,
            stride: 1,
        }
    }
}

impl ResidualBlockConfig {
    pub fn new(channels: usize) -> Self {
        Self {
            in_channels: channels,
            channels,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.in_channels != self.channels {
            return Err(Error::Architecture(format!(
                "residual block skip needs matching channels, got {} -> {}",
                self.in_channels, self.channels
            )));
        }
        // padding is fixed at 1, so only 3x3 / stride 1 keeps the spatial size
        if self.kernel != 3 || self.stride != 1 {
            return Err(Error::Architecture(format!(
                "residual block with kernel {} stride {} does not preserve spatial size",
                self.kernel, self.stride
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ResidualBlock {
    conv1: nn::Conv2d,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2d,
    bn2: nn::BatchNorm,
}

impl ResidualBlock {
    pub fn load(vb: nn::VarBuilder, cfg: ResidualBlockConfig) -> crate::Result<Self> {
        cfg.validate()?;
        let config = conv_config(1, cfg.stride);
        let conv1 = nn::conv2d(cfg.in_channels, cfg.channels, cfg.kernel, config, vb.pp("conv1"))?;
        let bn1 = nn::batch_norm(cfg.channels, nn::BatchNormConfig::default(), vb.pp("bn1"))?;
        let conv2 = nn::conv2d(cfg.channels, cfg.channels, cfg.kernel, config, vb.pp("conv2"))?;
        let bn2 = nn::batch_norm(cfg.channels, nn::BatchNormConfig::default(), vb.pp("bn2"))?;
        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
        })
    }
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ys = swish(&self.bn1.forward_t(&self.conv1.forward(xs)?, train)?)?;
        let ys = self.bn2.forward_t(&self.conv2.forward(&ys)?, train)?;
        Ok((ys * RESIDUAL_SCALE + xs)?)
    }
}

/// Conv followed by a factor-2 pixel shuffle: doubles height and width,
/// leaves `out_channels / 4` channels.
#[derive(Debug)]
pub struct UpsampleBlock {
    conv: nn::Conv2d,
}

impl UpsampleBlock {
    pub fn load(vb: nn::VarBuilder, in_channels: usize, out_channels: usize) -> crate::Result<Self> {
        let cells = SHUFFLE_FACTOR * SHUFFLE_FACTOR;
        if out_channels == 0 || out_channels % cells != 0 {
            return Err(Error::Architecture(format!(
                "upsample block needs out_channels divisible by {cells}, got {out_channels}"
            )));
        }
        let conv = nn::conv2d(in_channels, out_channels, 3, conv_config(1, 1), vb.pp("conv"))?;
        Ok(Self { conv })
    }
}

impl ModuleT for UpsampleBlock {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        let out = self.conv.forward(xs)?;
        let out = nn::ops::pixel_shuffle(&out, SHUFFLE_FACTOR)?;
        swish(&out)
    }
}
