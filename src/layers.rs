use candle_core::{Result, Tensor};
use candle_nn as nn;
use nn::{Module, ModuleT};

use crate::blocks::{ResidualBlock, UpsampleBlock};

/// Swish / SiLU: `x * sigmoid(x)`.
pub fn swish(xs: &Tensor) -> Result<Tensor> {
    xs.silu()
}

pub fn sigmoid(xs: &Tensor) -> Result<Tensor> {
    nn::ops::sigmoid(xs)
}

pub(crate) fn conv_config(padding: usize, stride: usize) -> nn::Conv2dConfig {
    nn::Conv2dConfig {
        padding,
        stride,
        dilation: 1,
        groups: 1,
        ..Default::default()
    }
}

#[derive(Debug)]
pub enum Layer {
    Conv2d(nn::Conv2d),
    BatchNorm(nn::BatchNorm),
    Swish,
    Relu,
    MaxPool2d(usize),
    Residual(ResidualBlock),
    Upsample(UpsampleBlock),
}

impl ModuleT for Layer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Layer::Conv2d(conv) => conv.forward(xs),
            Layer::BatchNorm(bn) => bn.forward_t(xs, train),
            Layer::Swish => swish(xs),
            Layer::Relu => xs.relu(),
            Layer::MaxPool2d(size) => xs.max_pool2d(*size),
            Layer::Residual(block) => block.forward_t(xs, train),
            Layer::Upsample(block) => block.forward_t(xs, train),
        }
    }
}

/// Ordered stack of layers applied front to back.
#[derive(Debug, Default)]
pub struct Sequential {
    modules: Vec<Layer>,
}

impl Sequential {
    pub fn new(modules: Vec<Layer>) -> Self {
        Self { modules }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            modules: Vec::with_capacity(capacity),
        }
    }

    pub fn add(&mut self, module: Layer) {
        self.modules.push(module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.modules
    }
}

impl ModuleT for Sequential {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut out = xs.clone();
        for module in &self.modules {
            out = module.forward_t(&out, train)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, D};

    #[test]
    fn swish_matches_definition() -> Result<()> {
        let xs = Tensor::new(&[-3f32, -0.5, 0.0, 0.5, 3.0], &Device::Cpu)?;
        let got = swish(&xs)?.to_vec1::<f32>()?;
        for (x, y) in [-3f32, -0.5, 0.0, 0.5, 3.0].iter().zip(got) {
            let want = x / (1.0 + (-x).exp());
            assert!((want - y).abs() < 1e-5, "swish({x}) = {y}, want {want}");
        }
        Ok(())
    }

    #[test]
    fn sequential_applies_in_order() -> Result<()> {
        let seq = Sequential::new(vec![Layer::Relu, Layer::MaxPool2d(2)]);
        let xs = Tensor::from_vec(vec![-1f32, 2.0, 3.0, -4.0], (1, 1, 2, 2), &Device::Cpu)?;
        let out = seq.forward_t(&xs, false)?;
        assert_eq!(out.dims(), &[1, 1, 1, 1]);
        let max = out.flatten_all()?.max(D::Minus1)?.to_scalar::<f32>()?;
        assert_eq!(max, 3.0);
        Ok(())
    }
}
