use std::path::Path;

use candle_core::{DType, Device, Result, Tensor};
use image::{DynamicImage, RgbImage};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// `[3, h, w]` tensor with values in `[0, 1]`.
pub fn img2tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let height = img.height() as usize;
    let width = img.width() as usize;
    let data = img.to_rgb8().into_raw();
    let tensor = Tensor::from_vec(data, (height, width, 3), device)?.permute((2, 0, 1))?;
    tensor.to_dtype(DType::F32)? / 255.
}

/// Inverse of [`img2tensor`]; values are clamped to `[0, 1]` first.
pub fn tensor2img(tensor: &Tensor) -> Result<RgbImage> {
    let result = (tensor.clamp(0f32, 1f32)? * 255.)?
        .round()?
        .permute((1, 2, 0))?
        .to_device(&Device::Cpu)?
        .to_dtype(DType::U8)?;

    let (height, width, _) = result.dims3()?;
    let data = result.flatten_all()?.to_vec1::<u8>()?;
    match RgbImage::from_vec(width as u32, height as u32, data) {
        Some(img) => Ok(img),
        None => candle_core::bail!("tensor does not fit a {width}x{height} RGB image"),
    }
}

fn channel_stats(values: [f32; 3], like: &Tensor) -> Result<Tensor> {
    Tensor::new(&values, like.device())?
        .to_dtype(like.dtype())?
        .reshape((3, 1, 1))
}

/// Per-channel ImageNet normalization of a `[.., 3, h, w]` tensor.
pub fn normalize(xs: &Tensor) -> Result<Tensor> {
    let mean = channel_stats(IMAGENET_MEAN, xs)?;
    let std = channel_stats(IMAGENET_STD, xs)?;
    xs.broadcast_sub(&mean)?.broadcast_div(&std)
}

pub fn denormalize(xs: &Tensor) -> Result<Tensor> {
    let mean = channel_stats(IMAGENET_MEAN, xs)?;
    let std = channel_stats(IMAGENET_STD, xs)?;
    xs.broadcast_mul(&std)?.broadcast_add(&mean)
}

/// Writes a `[3, h, w]` tensor in `[0, 1]` as an 8-bit image; format follows the extension.
pub fn save_image(tensor: &Tensor, path: impl AsRef<Path>) -> crate::Result<()> {
    tensor2img(tensor)?.save(path)?;
    Ok(())
}
