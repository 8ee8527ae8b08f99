use std::path::PathBuf;

use candle_core::Shape;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid architecture: {0}")]
    Architecture(String),

    #[error("checkpoint is missing parameter `{0}`")]
    MissingParameter(String),

    #[error("shape mismatch for parameter `{name}`: model expects {expected:?}, checkpoint has {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Shape,
        found: Shape,
    },

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("data error in {path}: {msg}")]
    Data { path: PathBuf, msg: String },

    #[error("non-finite {loss} loss ({value}) in {phase} epoch {epoch}, batch {batch}")]
    NonFiniteLoss {
        phase: &'static str,
        loss: &'static str,
        epoch: usize,
        batch: usize,
        value: f32,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
