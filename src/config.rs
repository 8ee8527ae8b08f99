use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;
use serde::Serialize;
use tracing::warn;

use crate::data::{Degradation, PairConfig};
use crate::discriminator::{check_train_shape, DiscriminatorConfig};
use crate::error::{Error, Result};
use crate::generator::GeneratorConfig;
use crate::train::TrainConfig;
use crate::vgg::{vgg19_depth, DEFAULT_FEATURE_LAYER};

/// Train an SRGAN generator and discriminator on an image folder.
#[derive(Parser, Debug, Clone, Serialize)]
#[command(version, about)]
pub struct Args {
    /// Dataset root holding `train/` and `test/` image folders
    #[arg(long, default_value = "set")]
    pub inputs: PathBuf,

    /// Number of data loading workers
    #[arg(long, default_value_t = 12)]
    pub threads: usize,

    #[arg(long, alias = "batchSize", default_value_t = 16)]
    pub batch_size: usize,

    #[arg(long, alias = "test_batchSize", default_value_t = 10)]
    pub test_batch_size: usize,

    /// Low-resolution patch size
    #[arg(long, default_value_t = 80)]
    pub crop_size: u32,

    /// Low to high resolution scaling factor
    #[arg(long, alias = "upFactor", default_value_t = 4)]
    pub up_factor: usize,

    #[arg(long, alias = "nPreEpochs", default_value_t = 300)]
    pub pre_epochs: usize,

    #[arg(long, alias = "nEpochs", default_value_t = 500)]
    pub epochs: usize,

    #[arg(long, alias = "generatorLR", default_value_t = 1e-4)]
    pub generator_lr: f64,

    #[arg(long, alias = "discriminatorLR", default_value_t = 1e-4)]
    pub discriminator_lr: f64,

    /// JPEG quality bucket (1-15) applied to training inputs, 0 disables
    #[arg(long, default_value_t = 0)]
    pub train_jpeg: u8,

    /// Gaussian noise std on the 0..255 scale
    #[arg(long, default_value_t = 0.0)]
    pub train_noise: f32,

    /// Gaussian blur std in low-resolution pixels
    #[arg(long, default_value_t = 0.0)]
    pub train_blur: f32,

    /// Run on the first CUDA device
    #[arg(long)]
    pub cuda: bool,

    #[arg(long, alias = "nGPU", default_value_t = 1)]
    pub ngpu: usize,

    #[arg(long, default_value_t = 123)]
    pub seed: u64,

    /// Generator parameters to continue training from
    #[arg(long, alias = "generatorWeights")]
    pub generator_weights: Option<PathBuf>,

    /// Discriminator parameters to continue training from
    #[arg(long, alias = "discriminatorWeights")]
    pub discriminator_weights: Option<PathBuf>,

    /// Checkpoint directory
    #[arg(long, default_value = "checkpoints")]
    pub out: PathBuf,

    /// Evaluation sample directory
    #[arg(long, default_value = "train_output")]
    pub train_output: PathBuf,

    #[arg(long, default_value_t = 16)]
    pub residual_blocks: usize,

    #[arg(long, default_value_t = 64)]
    pub channels: usize,

    /// VGG19 `features.*` weights in safetensors format
    #[arg(long)]
    pub vgg_weights: Option<PathBuf>,

    /// Index into the VGG19 feature stack used for the content loss
    #[arg(long, default_value_t = DEFAULT_FEATURE_LAYER)]
    pub feature_layer: usize,

    #[arg(long, default_value_t = 0.0)]
    pub feature_weight: f64,

    #[arg(long, default_value_t = 1e-3)]
    pub adversarial_weight: f64,

    /// Default log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        self.generator().validate()?;
        self.degradation().validate()?;
        if self.crop_size == 0 {
            return Err(Error::Config("crop size must be positive".into()));
        }
        if self.batch_size == 0 || self.test_batch_size == 0 {
            return Err(Error::Config("batch sizes must be positive".into()));
        }
        let hr = self.pairs().hr_size() as usize;
        check_train_shape(self.batch_size, hr, hr)?;
        if !(self.generator_lr > 0.0 && self.discriminator_lr > 0.0) {
            return Err(Error::Config("learning rates must be positive".into()));
        }
        if !(self.feature_weight >= 0.0 && self.adversarial_weight >= 0.0) {
            return Err(Error::Config("loss weights must be >= 0".into()));
        }
        if self.feature_weight > 0.0 && self.vgg_weights.is_none() {
            return Err(Error::Config(
                "--feature-weight needs --vgg-weights".into(),
            ));
        }
        if self.feature_layer >= vgg19_depth() {
            return Err(Error::Config(format!(
                "feature layer must be below {}",
                vgg19_depth()
            )));
        }
        Ok(())
    }

    pub fn generator(&self) -> GeneratorConfig {
        GeneratorConfig {
            n_residual_blocks: self.residual_blocks,
            upsample_factor: self.up_factor,
            channel: self.channels,
        }
    }

    pub fn discriminator(&self) -> DiscriminatorConfig {
        DiscriminatorConfig::default()
    }

    pub fn degradation(&self) -> Degradation {
        Degradation {
            jpeg: self.train_jpeg,
            noise: self.train_noise,
            blur: self.train_blur,
        }
    }

    pub fn pairs(&self) -> PairConfig {
        PairConfig {
            crop_size: self.crop_size,
            up_factor: self.up_factor as u32,
            degradation: self.degradation(),
        }
    }

    pub fn train(&self) -> TrainConfig {
        TrainConfig {
            generator_lr: self.generator_lr,
            discriminator_lr: self.discriminator_lr,
            feature_weight: self.feature_weight,
            adversarial_weight: self.adversarial_weight,
            sample_dir: Some(self.train_output.clone()),
            seed: self.seed,
            ..Default::default()
        }
    }

    /// CPU unless `--cuda` was given. Only the first device is used.
    pub fn device(&self) -> Result<Device> {
        let available = candle_core::utils::cuda_is_available();
        if !self.cuda {
            if available {
                warn!("a CUDA device is available, you should probably run with --cuda");
            }
            return Ok(Device::Cpu);
        }
        if !available {
            return Err(Error::DeviceUnavailable(
                "--cuda was given but this build has no usable CUDA device".into(),
            ));
        }
        if self.ngpu > 1 {
            warn!(ngpu = self.ngpu, "multi-GPU training is not supported, using device 0");
        }
        let device = Device::new_cuda(0)?;
        device.set_seed(self.seed)?;
        Ok(device)
    }

    pub fn train_dir(&self) -> PathBuf {
        self.inputs.join("train")
    }

    pub fn test_dir(&self) -> PathBuf {
        self.inputs.join("test")
    }
}
