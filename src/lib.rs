//! SRGAN super-resolution training on candle.

pub mod blocks;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod imageio;
pub mod layers;
pub mod loss;
pub mod train;
pub mod vgg;

pub use checkpoint::CheckpointStore;
pub use config::Args;
pub use data::{Batch, DataLoader, Degradation, ImageFolder, PairConfig};
pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use error::{Error, Result};
pub use generator::{Generator, GeneratorConfig};
pub use train::{Checkpoint, TrainConfig, Trainer};
pub use vgg::FeatureExtractor;
