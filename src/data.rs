//! Image-folder dataset producing normalized (low-res, high-res) pairs.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::imageio::{img2tensor, normalize};

const EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

pub const MAX_JPEG_BUCKET: u8 = 15;

/// Synthetic low-res degradation. Zero disables a stage.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Degradation {
    /// Quality bucket `b`: JPEG quality is drawn from `[100 - 5b, 100]`.
    pub jpeg: u8,
    /// Gaussian noise std on the 0..255 scale.
    pub noise: f32,
    /// Gaussian blur sigma in low-res pixels.
    pub blur: f32,
}

impl Degradation {
    pub fn validate(&self) -> Result<()> {
        if self.jpeg > MAX_JPEG_BUCKET {
            return Err(Error::Config(format!(
                "jpeg bucket must be in 0..={MAX_JPEG_BUCKET}, got {}",
                self.jpeg
            )));
        }
        if !(self.noise >= 0.0 && self.blur >= 0.0) {
            return Err(Error::Config("noise and blur must be >= 0".into()));
        }
        Ok(())
    }

    fn jpeg_floor(&self) -> u8 {
        100 - 5 * self.jpeg
    }

    /// Evaluation keeps the JPEG stage at its fixed floor quality and skips
    /// the random stages.
    fn apply(&self, lr: RgbImage, rng: &mut StdRng, train: bool) -> Result<RgbImage> {
        let mut lr = lr;
        if self.jpeg > 0 {
            let quality = if train {
                rng.gen_range(self.jpeg_floor()..=100)
            } else {
                self.jpeg_floor()
            };
            lr = jpeg_roundtrip(&lr, quality)?;
        }
        if !train {
            return Ok(lr);
        }
        if self.blur > 0.0 {
            lr = imageops::blur(&lr, self.blur);
        }
        if self.noise > 0.0 {
            let normal = Normal::new(0f32, self.noise)
                .map_err(|e| Error::Config(format!("noise std {}: {e}", self.noise)))?;
            for v in lr.iter_mut() {
                *v = (*v as f32 + normal.sample(rng)).round().clamp(0.0, 255.0) as u8;
            }
        }
        Ok(lr)
    }
}

fn jpeg_roundtrip(img: &RgbImage, quality: u8) -> Result<RgbImage> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(img)?;
    Ok(image::load_from_memory(&buf)?.to_rgb8())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairConfig {
    /// Low-res patch side.
    pub crop_size: u32,
    pub up_factor: u32,
    pub degradation: Degradation,
}

impl PairConfig {
    pub fn hr_size(&self) -> u32 {
        self.crop_size * self.up_factor
    }
}

/// One batch of normalized pairs: `low_res` is `[b, 3, s, s]`, `high_res`
/// is `[b, 3, s * up, s * up]`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub low_res: Tensor,
    pub high_res: Tensor,
}

#[derive(Debug, Clone)]
pub struct ImageFolder {
    paths: Vec<PathBuf>,
    config: PairConfig,
    train: bool,
}

impl ImageFolder {
    /// Lists the images directly under `dir`, sorted by path.
    pub fn open(dir: impl AsRef<Path>, config: PairConfig, train: bool) -> Result<Self> {
        let dir = dir.as_ref();
        config.degradation.validate()?;
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(Error::Data {
                path: dir.to_path_buf(),
                msg: "no images found".into(),
            });
        }
        paths.sort();
        Ok(Self {
            paths,
            config,
            train,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn config(&self) -> &PairConfig {
        &self.config
    }

    /// Crops a high-res patch (random when training, centered otherwise),
    /// downscales it and degrades the low-res side.
    pub fn pair(&self, index: usize, rng: &mut StdRng) -> Result<(RgbImage, RgbImage)> {
        let path = &self.paths[index];
        let img = image::open(path).map_err(|e| Error::Data {
            path: path.clone(),
            msg: e.to_string(),
        })?;
        let size = self.config.hr_size();
        let (w, h) = (img.width(), img.height());
        if w < size || h < size {
            return Err(Error::Data {
                path: path.clone(),
                msg: format!("{w}x{h} is smaller than the {size}x{size} high-res patch"),
            });
        }
        let (x, y) = if self.train {
            (rng.gen_range(0..=w - size), rng.gen_range(0..=h - size))
        } else {
            ((w - size) / 2, (h - size) / 2)
        };
        let hr = img.crop_imm(x, y, size, size).to_rgb8();
        let crop = self.config.crop_size;
        let lr = imageops::resize(&hr, crop, crop, FilterType::CatmullRom);
        let lr = self.config.degradation.apply(lr, rng, self.train)?;
        Ok((lr, hr))
    }
}

fn to_normalized(img: RgbImage, device: &Device) -> Result<Tensor> {
    Ok(normalize(&img2tensor(&DynamicImage::ImageRgb8(img), device)?)?)
}

/// Batches an [`ImageFolder`], decoding the samples of each batch on a
/// worker pool. Incomplete trailing batches are dropped.
pub struct DataLoader {
    dataset: ImageFolder,
    batch_size: usize,
    shuffle: bool,
    pool: rayon::ThreadPool,
    device: Device,
}

impl DataLoader {
    pub fn new(
        dataset: ImageFolder,
        batch_size: usize,
        shuffle: bool,
        threads: usize,
        device: &Device,
    ) -> Result<Self> {
        if batch_size == 0 || dataset.len() < batch_size {
            return Err(Error::Config(format!(
                "batch size {batch_size} does not fit a dataset of {} images",
                dataset.len()
            )));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build()
            .map_err(|e| Error::Config(format!("data worker pool: {e}")))?;
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            pool,
            device: device.clone(),
        })
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// One pass over the dataset. Shuffling and per-sample randomness are
    /// derived from `rng`, so a seeded run is reproducible.
    pub fn epoch(&self, rng: &mut StdRng) -> Epoch<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(rng);
        }
        Epoch {
            loader: self,
            order,
            next: 0,
            rng: StdRng::seed_from_u64(rng.gen()),
        }
    }

    fn load_batch(&self, indices: &[usize], seeds: &[u64]) -> Result<Batch> {
        let pairs = self.pool.install(|| {
            indices
                .par_iter()
                .zip(seeds.par_iter())
                .map(|(&index, &seed)| {
                    let mut rng = StdRng::seed_from_u64(seed);
                    let (lr, hr) = self.dataset.pair(index, &mut rng)?;
                    Ok((to_normalized(lr, &self.device)?, to_normalized(hr, &self.device)?))
                })
                .collect::<Result<Vec<_>>>()
        })?;
        let (lrs, hrs): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        Ok(Batch {
            low_res: Tensor::stack(&lrs, 0)?,
            high_res: Tensor::stack(&hrs, 0)?,
        })
    }
}

pub struct Epoch<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    next: usize,
    rng: StdRng,
}

impl Iterator for Epoch<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let size = self.loader.batch_size;
        if self.next + size > self.order.len() {
            return None;
        }
        let indices = &self.order[self.next..self.next + size];
        self.next += size;
        let seeds: Vec<u64> = (0..size).map(|_| self.rng.gen()).collect();
        Some(self.loader.load_batch(indices, &seeds))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.next) / self.loader.batch_size;
        (left, Some(left))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_images(dir: &Path, count: u32, size: u32) {
        std::fs::create_dir_all(dir).unwrap();
        for i in 0..count {
            let img = RgbImage::from_fn(size, size + i, |x, y| {
                image::Rgb([(x * 7 + i) as u8, (y * 3) as u8, ((x + y) * 5) as u8])
            });
            img.save(dir.join(format!("{i:03}.png"))).unwrap();
        }
        std::fs::write(dir.join("notes.txt"), "not an image").unwrap();
    }

    fn config(degradation: Degradation) -> PairConfig {
        PairConfig {
            crop_size: 6,
            up_factor: 4,
            degradation,
        }
    }

    #[test]
    fn batches_have_scaled_pairs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_images(dir.path(), 5, 30);
        let degradation = Degradation {
            jpeg: 10,
            noise: 2.0,
            blur: 0.5,
        };
        let dataset = ImageFolder::open(dir.path(), config(degradation), true)?;
        assert_eq!(dataset.len(), 5);
        let loader = DataLoader::new(dataset, 2, true, 2, &Device::Cpu)?;
        assert_eq!(loader.num_batches(), 2);

        let mut rng = StdRng::seed_from_u64(3);
        let batches: Vec<Batch> = loader.epoch(&mut rng).collect::<Result<_>>()?;
        assert_eq!(batches.len(), 2);
        for batch in batches {
            assert_eq!(batch.low_res.dims(), &[2, 3, 6, 6]);
            assert_eq!(batch.high_res.dims(), &[2, 3, 24, 24]);
        }
        Ok(())
    }

    #[test]
    fn evaluation_epochs_are_identical() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_images(dir.path(), 4, 28);
        let degradation = Degradation {
            jpeg: 5,
            noise: 10.0,
            blur: 1.0,
        };
        let dataset = ImageFolder::open(dir.path(), config(degradation), false)?;
        let loader = DataLoader::new(dataset, 2, false, 1, &Device::Cpu)?;

        let first: Vec<Batch> = loader
            .epoch(&mut StdRng::seed_from_u64(1))
            .collect::<Result<_>>()?;
        let second: Vec<Batch> = loader
            .epoch(&mut StdRng::seed_from_u64(2))
            .collect::<Result<_>>()?;
        for (a, b) in first.iter().zip(&second) {
            let a = a.low_res.flatten_all()?.to_vec1::<f32>()?;
            let b = b.low_res.flatten_all()?.to_vec1::<f32>()?;
            assert_eq!(a, b);
        }
        Ok(())
    }

    #[test]
    fn seeded_training_epochs_repeat() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_images(dir.path(), 4, 40);
        let dataset = ImageFolder::open(dir.path(), config(Degradation::default()), true)?;
        let loader = DataLoader::new(dataset, 4, true, 3, &Device::Cpu)?;
        let run = |seed| -> Result<Vec<f32>> {
            let batch = loader
                .epoch(&mut StdRng::seed_from_u64(seed))
                .next()
                .unwrap()?;
            Ok(batch.high_res.flatten_all()?.to_vec1::<f32>()?)
        };
        assert_eq!(run(9)?, run(9)?);
        Ok(())
    }

    #[test]
    fn small_images_are_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_images(dir.path(), 2, 10);
        let dataset = ImageFolder::open(dir.path(), config(Degradation::default()), false)?;
        let err = dataset.pair(0, &mut StdRng::seed_from_u64(0)).unwrap_err();
        assert!(matches!(err, Error::Data { .. }), "{err}");
        Ok(())
    }

    #[test]
    fn invalid_degradation_is_rejected() {
        let bad = Degradation {
            jpeg: 16,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = Degradation {
            noise: -1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn empty_folder_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let err = ImageFolder::open(dir.path(), config(Degradation::default()), true).unwrap_err();
        assert!(matches!(err, Error::Data { .. }));
        Ok(())
    }
}
