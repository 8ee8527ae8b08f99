use std::collections::{HashMap, HashSet};

use candle_core::{Result, Tensor};
use candle_nn as nn;
use nn::{Module, ModuleT};
use serde::{Deserialize, Serialize};

use crate::blocks::{ResidualBlock, ResidualBlockConfig, UpsampleBlock, SHUFFLE_FACTOR};
use crate::error::Error;
use crate::layers::{conv_config, swish, Layer, Sequential};

pub const IMAGE_CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub n_residual_blocks: usize,
    pub upsample_factor: usize,
    pub channel: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            n_residual_blocks: 16,
            upsample_factor: 4,
            channel: 64,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.channel == 0 {
            return Err(Error::Architecture("generator needs at least one channel".into()));
        }
        if self.upsample_factor < SHUFFLE_FACTOR || !self.upsample_factor.is_power_of_two() {
            return Err(Error::Architecture(format!(
                "upsample factor must be a power of two >= 2, got {}",
                self.upsample_factor
            )));
        }
        Ok(())
    }

    /// Each upsample block doubles the resolution.
    pub fn num_upsample_blocks(&self) -> usize {
        self.upsample_factor.trailing_zeros() as usize
    }

    /// Recovers the architecture from a generator parameter mapping.
    ///
    /// Residual blocks are counted from the distinct `res_layer.{i}.*` keys,
    /// upsample blocks from the distinct `up_layer.{i}.*` keys, and the trunk
    /// width from the entry convolution's output channels.
    pub fn infer(state_dict: &HashMap<String, Tensor>) -> crate::Result<Self> {
        let channel = match state_dict.get("conv1.weight") {
            Some(w) => w.dims()[0],
            None => return Err(Error::MissingParameter("conv1.weight".into())),
        };
        let n_residual_blocks = count_indexed(state_dict, "res_layer.");
        let num_ups = count_indexed(state_dict, "up_layer.");
        let cfg = Self {
            n_residual_blocks,
            upsample_factor: 1 << num_ups,
            channel,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

fn count_indexed(state_dict: &HashMap<String, Tensor>, prefix: &str) -> usize {
    state_dict
        .keys()
        .filter_map(|k| k.strip_prefix(prefix))
        .filter_map(|rest| rest.split('.').next())
        .filter_map(|i| i.parse::<usize>().ok())
        .collect::<HashSet<_>>()
        .len()
}

#[derive(Debug)]
pub struct Generator {
    conv1: nn::Conv2d,
    res_layer: Sequential,
    conv2: nn::Conv2d,
    bn2: nn::BatchNorm,
    up_layer: Sequential,
    conv3: nn::Conv2d,
    config: GeneratorConfig,
}

impl Generator {
    pub fn load(vb: nn::VarBuilder, config: GeneratorConfig) -> crate::Result<Self> {
        config.validate()?;
        let channel = config.channel;
        let conv = conv_config(1, 1);

        let conv1 = nn::conv2d(IMAGE_CHANNELS, channel, 3, conv, vb.pp("conv1"))?;
        let mut res_layer = Sequential::with_capacity(config.n_residual_blocks);
        for i in 0..config.n_residual_blocks {
            res_layer.add(Layer::Residual(ResidualBlock::load(
                vb.pp(format!("res_layer.{i}")),
                ResidualBlockConfig::new(channel),
            )?));
        }
        let conv2 = nn::conv2d(channel, channel, 3, conv, vb.pp("conv2"))?;
        let bn2 = nn::batch_norm(channel, nn::BatchNormConfig::default(), vb.pp("bn2"))?;

        let num_ups = config.num_upsample_blocks();
        let mut up_layer = Sequential::with_capacity(num_ups);
        for i in 0..num_ups {
            up_layer.add(Layer::Upsample(UpsampleBlock::load(
                vb.pp(format!("up_layer.{i}")),
                channel,
                channel * SHUFFLE_FACTOR * SHUFFLE_FACTOR,
            )?));
        }
        let conv3 = nn::conv2d(channel, IMAGE_CHANNELS, 3, conv, vb.pp("conv3"))?;

        Ok(Self {
            conv1,
            res_layer,
            conv2,
            bn2,
            up_layer,
            conv3,
            config,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }
}

impl ModuleT for Generator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let feat = swish(&self.conv1.forward(xs)?)?;
        let body = self.res_layer.forward_t(&feat, train)?;
        let body = self.bn2.forward_t(&self.conv2.forward(&body)?, train)?;
        let feat = (body + feat)?;
        let feat = self.up_layer.forward_t(&feat, train)?;
        self.conv3.forward(&feat)
    }
}
