//! Truncated VGG19 `features` stack used as a frozen perceptual embedding.
//!
//! Parameter names follow torchvision (`features.{index}.weight`), so a
//! torchvision state dict exported to safetensors loads directly.

use std::path::Path;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn as nn;
use nn::ModuleT;

use crate::error::Error;
use crate::generator::IMAGE_CHANNELS;
use crate::layers::{conv_config, Layer, Sequential};

pub const DEFAULT_FEATURE_LAYER: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Conv(usize),
    Pool,
}

/// Configuration "E" of the VGG paper (19 weight layers).
const VGG19: [Entry; 21] = {
    use Entry::{Conv, Pool};
    [
        Conv(64),
        Conv(64),
        Pool,
        Conv(128),
        Conv(128),
        Pool,
        Conv(256),
        Conv(256),
        Conv(256),
        Conv(256),
        Pool,
        Conv(512),
        Conv(512),
        Conv(512),
        Conv(512),
        Pool,
        Conv(512),
        Conv(512),
        Conv(512),
        Conv(512),
        Pool,
    ]
};

/// Number of entries in torchvision's `vgg19().features`, each conv counting
/// as two (conv, relu).
pub fn vgg19_depth() -> usize {
    VGG19
        .iter()
        .map(|e| match e {
            Entry::Conv(_) => 2,
            Entry::Pool => 1,
        })
        .sum()
}

#[derive(Debug)]
pub struct FeatureExtractor {
    features: Sequential,
}

impl FeatureExtractor {
    /// Builds the stack up to and including `feature_layer`.
    pub fn load(vb: nn::VarBuilder, feature_layer: usize) -> crate::Result<Self> {
        let depth = vgg19_depth();
        if feature_layer >= depth {
            return Err(Error::Config(format!(
                "feature layer {feature_layer} is beyond the {depth} VGG19 feature layers"
            )));
        }
        let mut features = Sequential::with_capacity(feature_layer + 1);
        let mut channels = IMAGE_CHANNELS;
        let mut index = 0;
        for entry in VGG19 {
            if index > feature_layer {
                break;
            }
            match entry {
                Entry::Conv(out) => {
                    features.add(Layer::Conv2d(nn::conv2d(
                        channels,
                        out,
                        3,
                        conv_config(1, 1),
                        vb.pp(format!("features.{index}")),
                    )?));
                    channels = out;
                    index += 1;
                    if index <= feature_layer {
                        features.add(Layer::Relu);
                        index += 1;
                    }
                }
                Entry::Pool => {
                    features.add(Layer::MaxPool2d(2));
                    index += 1;
                }
            }
        }
        Ok(Self { features })
    }

    /// Loads pretrained weights from a safetensors file. The resulting
    /// tensors are constants, so no optimizer can reach them.
    pub fn from_safetensors(
        path: impl AsRef<Path>,
        feature_layer: usize,
        device: &Device,
    ) -> crate::Result<Self> {
        let vb = unsafe { nn::VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? };
        Self::load(vb, feature_layer)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.features.forward_t(xs, false)
    }
}
