use candle_core::{DType, Device, Result, Tensor};
use candle_nn as nn;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

/// Probabilities are clamped to `[PROB_EPS, 1 - PROB_EPS]` before taking logs.
pub const PROB_EPS: f64 = 1e-7;

/// Half-open interval `[low, high)` that noisy labels are drawn from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelRange {
    pub low: f32,
    pub high: f32,
}

pub const REAL_LABELS: LabelRange = LabelRange {
    low: 0.7,
    high: 1.2,
};

pub const FAKE_LABELS: LabelRange = LabelRange {
    low: 0.0,
    high: 0.3,
};

/// One label per sample, shape `[batch, 1]`.
pub fn soft_labels<R: Rng + ?Sized>(
    rng: &mut R,
    batch: usize,
    range: LabelRange,
    device: &Device,
) -> Result<Tensor> {
    let dist = Uniform::new(range.low, range.high);
    let labels: Vec<f32> = (0..batch).map(|_| dist.sample(rng)).collect();
    Tensor::from_vec(labels, (batch, 1), device)
}

/// Binary cross entropy between probabilities and (possibly soft) targets, mean-reduced.
pub fn bce(probs: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let p = probs.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
    let pos = (targets * p.log()?)?;
    let neg = (targets.affine(-1.0, 1.0)? * p.affine(-1.0, 1.0)?.log()?)?;
    (pos + neg)?.neg()?.mean_all()
}

pub fn mse(prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
    nn::loss::mse(prediction, target)
}

/// Peak signal-to-noise ratio in dB for signals with peak value 1.0.
pub fn psnr(prediction: &Tensor, target: &Tensor) -> Result<f64> {
    let mse = mse(prediction, target)?
        .to_dtype(DType::F64)?
        .to_scalar::<f64>()?;
    if mse == 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(10.0 * (1.0 / mse).log10())
}
