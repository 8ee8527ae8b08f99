//! Two-phase SRGAN training: pixel-MSE pretraining of the generator, then
//! adversarial fine-tuning of both networks.

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, ModuleT, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::checkpoint::{dict_name, load_params, CheckpointStore, Phase, DISCRIMINATOR, GENERATOR};
use crate::data::{Batch, DataLoader};
use crate::discriminator::{Discriminator, DiscriminatorConfig};
use crate::error::{Error, Result};
use crate::generator::{Generator, GeneratorConfig};
use crate::imageio::{denormalize, save_image};
use crate::loss::{bce, mse, psnr, soft_labels, FAKE_LABELS, REAL_LABELS};
use crate::vgg::FeatureExtractor;

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub generator_lr: f64,
    pub discriminator_lr: f64,
    /// Learning-rate multiplier for the adversarial phase.
    pub adversarial_lr_scale: f64,
    /// Weight of the feature-space term in the content loss.
    pub feature_weight: f64,
    /// Weight of the adversarial term in the generator loss.
    pub adversarial_weight: f64,
    /// Where the first evaluation batch of every evaluation is written.
    pub sample_dir: Option<PathBuf>,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            generator_lr: 1e-4,
            discriminator_lr: 1e-4,
            adversarial_lr_scale: 0.1,
            feature_weight: 0.0,
            adversarial_weight: 1e-3,
            sample_dir: None,
            seed: 123,
        }
    }
}

/// Per-epoch mean of the pretraining loss.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PretrainStats {
    pub content: f64,
    pub batches: usize,
}

/// Losses of one adversarial step, or their per-epoch means.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdversarialStats {
    pub discriminator: f64,
    pub content: f64,
    pub adversarial: f64,
    pub total: f64,
    pub batches: usize,
}

impl AdversarialStats {
    fn add(&mut self, step: &AdversarialStats) {
        self.discriminator += step.discriminator;
        self.content += step.content;
        self.adversarial += step.adversarial;
        self.total += step.total;
        self.batches += 1;
    }

    fn mean(mut self) -> Self {
        let n = self.batches.max(1) as f64;
        self.discriminator /= n;
        self.content /= n;
        self.adversarial /= n;
        self.total /= n;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Parameter maps after a completed epoch, counted from 1.
    Epoch(usize),
    /// Whole models at the end of the run.
    Final,
}

/// Writes `{j:04}x{up}_GT.png`, `_LR.png` and `_SR.png` for each sample of a batch.
#[derive(Debug, Clone)]
pub struct SampleWriter {
    pub dir: PathBuf,
    pub up_factor: usize,
}

impl SampleWriter {
    pub fn write(&self, batch: &Batch, prediction: &Tensor) -> Result<()> {
        let gt = denormalize(&batch.high_res)?;
        let lr = denormalize(&batch.low_res)?;
        let sr = denormalize(prediction)?;
        for j in 0..gt.dim(0)? {
            for (tag, images) in [("GT", &gt), ("LR", &lr), ("SR", &sr)] {
                let path = self.dir.join(format!("{j:04}x{}_{tag}.png", self.up_factor));
                save_image(&images.get(j)?, path)?;
            }
        }
        Ok(())
    }
}

/// Variables an optimizer may update. Batch-norm running statistics live in
/// the same map but are maintained by the forward pass.
pub fn trainable_vars(varmap: &VarMap) -> Result<Vec<Var>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("parameter map lock poisoned: {e}")))?;
    Ok(data
        .iter()
        .filter(|(name, _)| !name.ends_with("running_mean") && !name.ends_with("running_var"))
        .map(|(_, var)| var.clone())
        .collect())
}

/// Adam: AdamW without weight decay.
pub fn adam(varmap: &VarMap, lr: f64) -> Result<AdamW> {
    let params = ParamsAdamW {
        lr,
        weight_decay: 0.0,
        ..Default::default()
    };
    Ok(AdamW::new(trainable_vars(varmap)?, params)?)
}

const ADVERSARIAL: &str = "adversarial";

fn finite(
    loss: &Tensor,
    phase: &'static str,
    name: &'static str,
    epoch: usize,
    batch: usize,
) -> Result<f32> {
    let value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    if !value.is_finite() {
        return Err(Error::NonFiniteLoss {
            phase,
            loss: name,
            epoch,
            batch,
            value,
        });
    }
    Ok(value)
}

/// Mean PSNR over the batches, computed on denormalized tensors. The first
/// batch is written out through `samples` when given.
pub fn evaluate<M, I>(model: &M, batches: I, samples: Option<&SampleWriter>) -> Result<f64>
where
    M: ModuleT,
    I: IntoIterator<Item = Result<Batch>>,
{
    let mut total = 0.0;
    let mut count = 0usize;
    for batch in batches {
        let batch = batch?;
        let prediction = model.forward_t(&batch.low_res, false)?.detach();
        if count == 0 {
            if let Some(samples) = samples {
                samples.write(&batch, &prediction)?;
            }
        }
        total += psnr(&denormalize(&prediction)?, &denormalize(&batch.high_res)?)?;
        count += 1;
    }
    if count == 0 {
        return Err(Error::Config("evaluation set produced no batches".into()));
    }
    Ok(total / count as f64)
}

pub struct Trainer {
    device: Device,
    gen_vars: VarMap,
    generator: Generator,
    disc_vars: VarMap,
    discriminator: Discriminator,
    feature_extractor: Option<FeatureExtractor>,
    config: TrainConfig,
    rng: StdRng,
}

impl Trainer {
    pub fn new(
        device: &Device,
        generator: GeneratorConfig,
        discriminator: DiscriminatorConfig,
        config: TrainConfig,
    ) -> Result<Self> {
        let gen_vars = VarMap::new();
        let generator = Generator::load(VarBuilder::from_varmap(&gen_vars, DType::F32, device), generator)?;
        let disc_vars = VarMap::new();
        let discriminator = Discriminator::load(
            VarBuilder::from_varmap(&disc_vars, DType::F32, device),
            discriminator,
        )?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            device: device.clone(),
            gen_vars,
            generator,
            disc_vars,
            discriminator,
            feature_extractor: None,
            config,
            rng,
        })
    }

    pub fn with_feature_extractor(mut self, feature_extractor: FeatureExtractor) -> Self {
        self.feature_extractor = Some(feature_extractor);
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    pub fn generator_vars(&self) -> &VarMap {
        &self.gen_vars
    }

    pub fn discriminator_vars(&self) -> &VarMap {
        &self.disc_vars
    }

    pub fn load_generator_weights(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        load_params(&self.gen_vars, path, &self.device)
    }

    pub fn load_discriminator_weights(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        load_params(&self.disc_vars, path, &self.device)
    }

    /// Pixel MSE of the generator on `batch`, without updating anything
    /// but batch-norm statistics.
    pub fn pixel_loss(&self, batch: &Batch) -> Result<f32> {
        let fake = self.generator.forward_t(&batch.low_res, true)?;
        Ok(mse(&fake, &batch.high_res)?.to_scalar::<f32>()?)
    }

    /// One generator update on pixel MSE; returns the loss before the update.
    pub fn pretrain_step(&self, opt: &mut AdamW, batch: &Batch, epoch: usize, index: usize) -> Result<f32> {
        let fake = self.generator.forward_t(&batch.low_res, true)?;
        let loss = mse(&fake, &batch.high_res)?;
        let value = finite(&loss, "pretrain", "content", epoch, index)?;
        opt.backward_step(&loss)?;
        Ok(value)
    }

    /// Discriminator loss on real images and on a detached copy of `fake`, so
    /// its gradients never reach the generator.
    pub fn discriminator_loss(&mut self, batch: &Batch, fake: &Tensor) -> Result<Tensor> {
        let size = batch.high_res.dim(0)?;
        let target_real = soft_labels(&mut self.rng, size, REAL_LABELS, &self.device)?;
        let target_fake = soft_labels(&mut self.rng, size, FAKE_LABELS, &self.device)?;
        let real_probs = self.discriminator.forward_t(&batch.high_res, true)?;
        let fake_probs = self.discriminator.forward_t(&fake.detach(), true)?;
        Ok((bce(&real_probs, &target_real)? + bce(&fake_probs, &target_fake)?)?)
    }

    pub fn discriminator_step(
        &mut self,
        d_opt: &mut AdamW,
        batch: &Batch,
        fake: &Tensor,
        epoch: usize,
        index: usize,
    ) -> Result<f32> {
        let loss = self.discriminator_loss(batch, fake)?;
        let value = finite(&loss, ADVERSARIAL, "discriminator", epoch, index)?;
        d_opt.backward_step(&loss)?;
        Ok(value)
    }

    /// Content plus weighted adversarial loss against the current
    /// discriminator; only `g_opt` steps.
    pub fn generator_step(
        &self,
        g_opt: &mut AdamW,
        batch: &Batch,
        fake: &Tensor,
        epoch: usize,
        index: usize,
    ) -> Result<AdversarialStats> {
        let mut content = mse(fake, &batch.high_res)?;
        if let Some(fe) = &self.feature_extractor {
            let real_features = fe.forward(&batch.high_res)?.detach();
            let fake_features = fe.forward(fake)?;
            let feature_loss = mse(&fake_features, &real_features)?;
            content = (content + (feature_loss * self.config.feature_weight)?)?;
        }
        let ones = Tensor::ones((fake.dim(0)?, 1), DType::F32, &self.device)?;
        let adversarial = bce(&self.discriminator.forward_t(fake, true)?, &ones)?;
        let total = (&content + (&adversarial * self.config.adversarial_weight)?)?;

        let stats = AdversarialStats {
            content: finite(&content, ADVERSARIAL, "content", epoch, index)? as f64,
            adversarial: finite(&adversarial, ADVERSARIAL, "adversarial", epoch, index)? as f64,
            total: finite(&total, ADVERSARIAL, "total", epoch, index)? as f64,
            batches: 1,
            ..Default::default()
        };
        g_opt.backward_step(&total)?;
        Ok(stats)
    }

    /// Discriminator update followed by a generator update on the same batch.
    pub fn adversarial_step(
        &mut self,
        g_opt: &mut AdamW,
        d_opt: &mut AdamW,
        batch: &Batch,
        epoch: usize,
        index: usize,
    ) -> Result<AdversarialStats> {
        let fake = self.generator.forward_t(&batch.low_res, true)?;
        let discriminator = self.discriminator_step(d_opt, batch, &fake, epoch, index)?;
        let stats = self.generator_step(g_opt, batch, &fake, epoch, index)?;
        Ok(AdversarialStats {
            discriminator: discriminator as f64,
            ..stats
        })
    }

    pub fn pretrain_epoch<I>(&self, opt: &mut AdamW, epoch: usize, batches: I) -> Result<PretrainStats>
    where
        I: IntoIterator<Item = Result<Batch>>,
    {
        let mut stats = PretrainStats::default();
        for (i, batch) in batches.into_iter().enumerate() {
            let loss = self.pretrain_step(opt, &batch?, epoch, i + 1)?;
            debug!(epoch, batch = i + 1, loss, "pretrain step");
            stats.content += loss as f64;
            stats.batches += 1;
        }
        stats.content /= stats.batches.max(1) as f64;
        Ok(stats)
    }

    pub fn adversarial_epoch<I>(
        &mut self,
        g_opt: &mut AdamW,
        d_opt: &mut AdamW,
        epoch: usize,
        batches: I,
    ) -> Result<AdversarialStats>
    where
        I: IntoIterator<Item = Result<Batch>>,
    {
        if self.config.feature_weight != 0.0 && self.feature_extractor.is_none() {
            return Err(Error::Config(
                "a nonzero feature weight needs a feature extractor".into(),
            ));
        }
        let mut sum = AdversarialStats::default();
        for (i, batch) in batches.into_iter().enumerate() {
            let step = self.adversarial_step(g_opt, d_opt, &batch?, epoch, i + 1)?;
            debug!(
                epoch,
                batch = i + 1,
                d = step.discriminator,
                content = step.content,
                adversarial = step.adversarial,
                total = step.total,
                "adversarial step"
            );
            sum.add(&step);
        }
        Ok(sum.mean())
    }

    pub fn evaluate<I>(&self, batches: I, samples: Option<&SampleWriter>) -> Result<f64>
    where
        I: IntoIterator<Item = Result<Batch>>,
    {
        evaluate(&self.generator, batches, samples)
    }

    pub fn checkpoint(&self, store: &CheckpointStore, at: Checkpoint, phase: Phase) -> Result<()> {
        match at {
            Checkpoint::Epoch(0) => {
                return Err(Error::Config("epochs are numbered from 1".into()));
            }
            Checkpoint::Epoch(_) => {
                store.save_params(&dict_name(GENERATOR, phase), &self.gen_vars)?;
                if phase == Phase::Final {
                    store.save_params(&dict_name(DISCRIMINATOR, phase), &self.disc_vars)?;
                }
                info!("model dict saved to {}", store.dir().display());
            }
            Checkpoint::Final => {
                store.save_model(GENERATOR, &self.gen_vars, self.generator.config())?;
                store.save_model(DISCRIMINATOR, &self.disc_vars, self.discriminator.config())?;
                info!("whole model saved to {}", store.dir().display());
            }
        }
        Ok(())
    }

    /// Runs both phases, evaluating and checkpointing after every epoch.
    pub fn run(
        &mut self,
        train: &DataLoader,
        test: &DataLoader,
        store: &CheckpointStore,
        pre_epochs: usize,
        epochs: usize,
    ) -> Result<()> {
        let samples = self.config.sample_dir.clone().map(|dir| SampleWriter {
            dir,
            up_factor: self.generator.config().upsample_factor,
        });

        info!("===> Generator pre-training");
        let mut g_opt = adam(&self.gen_vars, self.config.generator_lr)?;
        for epoch in 1..=pre_epochs {
            let pb = progress(train.num_batches(), format!("pretrain {epoch}/{pre_epochs}"))?;
            let batches = pb.wrap_iter(train.epoch(&mut self.rng));
            let stats = self.pretrain_epoch(&mut g_opt, epoch, batches)?;
            pb.finish_and_clear();
            info!(epoch, "[{epoch}/{pre_epochs}] Generator_MSE_Loss: {:.4}", stats.content);
            let batches = test.epoch(&mut self.rng);
            let avg_psnr = self.evaluate(batches, samples.as_ref())?;
            info!("Avg. PSNR: {avg_psnr:.4} dB");
            self.checkpoint(store, Checkpoint::Epoch(epoch), Phase::Pretrain)?;
        }

        info!("===> SRGAN training");
        let scale = self.config.adversarial_lr_scale;
        let mut g_opt = adam(&self.gen_vars, self.config.generator_lr * scale)?;
        let mut d_opt = adam(&self.disc_vars, self.config.discriminator_lr * scale)?;
        for epoch in 1..=epochs {
            let pb = progress(train.num_batches(), format!("srgan {epoch}/{epochs}"))?;
            let batches = pb.wrap_iter(train.epoch(&mut self.rng));
            let stats = self.adversarial_epoch(&mut g_opt, &mut d_opt, epoch, batches)?;
            pb.finish_and_clear();
            info!(
                "[{epoch}/{epochs}] Discriminator_Loss: {:.4} Generator_Loss (Content/Advers/Total): {:.4}/{:.4}/{:.4}",
                stats.discriminator, stats.content, stats.adversarial, stats.total
            );
            let batches = test.epoch(&mut self.rng);
            let avg_psnr = self.evaluate(batches, samples.as_ref())?;
            info!("Avg. PSNR: {avg_psnr:.4} dB");
            self.checkpoint(store, Checkpoint::Epoch(epoch), Phase::Final)?;
        }
        self.checkpoint(store, Checkpoint::Final, Phase::Final)
    }
}

fn progress(len: usize, msg: String) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .map_err(|e| Error::Config(format!("progress template: {e}")))?
            .progress_chars("##-"),
    );
    pb.set_message(msg);
    Ok(pb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::Module;

    const SMALL_GEN: GeneratorConfig = GeneratorConfig {
        n_residual_blocks: 1,
        upsample_factor: 2,
        channel: 8,
    };

    const SMALL_DISC: DiscriminatorConfig = DiscriminatorConfig {
        base_channels: 8,
        head_padding: 1,
    };

    fn trainer() -> Result<Trainer> {
        Trainer::new(&Device::Cpu, SMALL_GEN, SMALL_DISC, TrainConfig::default())
    }

    fn batch(size: usize, lr: usize, factor: usize) -> Result<Batch> {
        Ok(Batch {
            low_res: Tensor::randn(0f32, 1., (size, 3, lr, lr), &Device::Cpu)?,
            high_res: Tensor::randn(0f32, 1., (size, 3, lr * factor, lr * factor), &Device::Cpu)?,
        })
    }

    #[test]
    fn pretrain_step_does_not_increase_loss() -> Result<()> {
        let trainer = trainer()?;
        let batch = batch(4, 8, 2)?;
        let mut opt = adam(trainer.generator_vars(), 1e-4)?;
        let before = trainer.pretrain_step(&mut opt, &batch, 1, 1)?;
        let after = trainer.pixel_loss(&batch)?;
        assert!(after <= before + 1e-6, "loss went from {before} to {after}");
        Ok(())
    }

    #[test]
    fn optimizer_skips_running_statistics() -> Result<()> {
        let trainer = trainer()?;
        let all = trainer.generator_vars().all_vars().len();
        let trainable = trainable_vars(trainer.generator_vars())?.len();
        // bn1, bn2 in the residual block and the trunk bn2
        assert_eq!(all - trainable, 3 * 2);
        Ok(())
    }

    #[test]
    fn adversarial_step_updates_both_models() -> Result<()> {
        let mut trainer = trainer()?;
        let batch = batch(2, 8, 2)?;
        let xs = Tensor::randn(0f32, 1., (2, 3, 8, 8), &Device::Cpu)?;
        let probe = Tensor::randn(0f32, 1., (2, 3, 16, 16), &Device::Cpu)?;
        let g_before = trainer.generator().forward_t(&xs, false)?;
        let d_before = trainer.discriminator().forward_t(&probe, false)?;

        let mut g_opt = adam(trainer.generator_vars(), 1e-3)?;
        let mut d_opt = adam(trainer.discriminator_vars(), 1e-3)?;
        let stats = trainer.adversarial_step(&mut g_opt, &mut d_opt, &batch, 1, 1)?;
        assert!(stats.discriminator > 0.0 && stats.adversarial > 0.0);
        let want_total = stats.content + 1e-3 * stats.adversarial;
        assert!((stats.total - want_total).abs() < 1e-4);

        let changed = |a: &Tensor, b: &Tensor| -> Result<bool> {
            Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()? > 0.0)
        };
        assert!(changed(&g_before, &trainer.generator().forward_t(&xs, false)?)?);
        assert!(changed(&d_before, &trainer.discriminator().forward_t(&probe, false)?)?);
        Ok(())
    }

    fn values(varmap: &VarMap) -> Result<Vec<(String, Vec<f32>)>> {
        let data = varmap.data().lock().unwrap();
        let mut values = data
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().flatten_all()?.to_vec1::<f32>()?)))
            .collect::<Result<Vec<_>>>()?;
        values.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(values)
    }

    #[test]
    fn discriminator_step_leaves_generator_untouched() -> Result<()> {
        let mut trainer = trainer()?;
        let batch = batch(2, 8, 2)?;
        let fake = trainer.generator().forward_t(&batch.low_res, true)?;

        let grads = trainer.discriminator_loss(&batch, &fake)?.backward()?;
        for var in trainable_vars(trainer.generator_vars())? {
            assert!(grads.get(var.as_tensor()).is_none());
        }
        assert!(trainable_vars(trainer.discriminator_vars())?
            .iter()
            .any(|var| grads.get(var.as_tensor()).is_some()));

        let gen_before = values(trainer.generator_vars())?;
        let disc_before = values(trainer.discriminator_vars())?;
        let mut d_opt = adam(trainer.discriminator_vars(), 1e-3)?;
        trainer.discriminator_step(&mut d_opt, &batch, &fake, 1, 1)?;
        assert_eq!(values(trainer.generator_vars())?, gen_before);
        assert_ne!(values(trainer.discriminator_vars())?, disc_before);
        Ok(())
    }

    #[test]
    fn generator_is_scored_by_updated_discriminator() -> Result<()> {
        let mut trainer = trainer()?;
        let batch = batch(2, 8, 2)?;
        let fake = trainer.generator().forward_t(&batch.low_res, true)?.detach();
        let ones = Tensor::ones((2, 1), DType::F32, &Device::Cpu)?;
        let score = |trainer: &Trainer| -> Result<f64> {
            let probs = trainer.discriminator().forward_t(&fake, true)?;
            Ok(bce(&probs, &ones)?.to_scalar::<f32>()? as f64)
        };
        let stale = score(&trainer)?;

        let mut g_opt = adam(trainer.generator_vars(), 1e-4)?;
        let mut d_opt = adam(trainer.discriminator_vars(), 1e-2)?;
        let stats = trainer.adversarial_step(&mut g_opt, &mut d_opt, &batch, 1, 1)?;
        let updated = score(&trainer)?;
        assert!((stats.adversarial - updated).abs() < 1e-5, "{} vs {updated}", stats.adversarial);
        assert!((stats.adversarial - stale).abs() > 1e-5, "discriminator was not updated first");
        Ok(())
    }

    #[test]
    fn nan_loss_is_reported() -> Result<()> {
        let trainer = trainer()?;
        let mut bad = batch(2, 4, 2)?;
        bad.high_res = (bad.high_res * f64::NAN)?;
        let mut opt = adam(trainer.generator_vars(), 1e-4)?;
        let err = trainer.pretrain_step(&mut opt, &bad, 3, 7).unwrap_err();
        assert!(
            matches!(err, Error::NonFiniteLoss { epoch: 3, batch: 7, .. }),
            "{err}"
        );
        Ok(())
    }

    #[test]
    fn feature_weight_requires_extractor() -> Result<()> {
        let config = TrainConfig {
            feature_weight: 0.006,
            ..Default::default()
        };
        let mut trainer = Trainer::new(&Device::Cpu, SMALL_GEN, SMALL_DISC, config)?;
        let mut g_opt = adam(trainer.generator_vars(), 1e-4)?;
        let mut d_opt = adam(trainer.discriminator_vars(), 1e-4)?;
        let err = trainer
            .adversarial_epoch(&mut g_opt, &mut d_opt, 1, vec![batch(2, 4, 2)])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        Ok(())
    }

    #[test]
    fn feature_term_enters_content_loss() -> Result<()> {
        let config = TrainConfig {
            feature_weight: 1.0,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let fe = FeatureExtractor::load(VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu), 3)?;
        let mut trainer =
            Trainer::new(&Device::Cpu, SMALL_GEN, SMALL_DISC, config)?.with_feature_extractor(fe);
        let batch = batch(2, 8, 2)?;
        let pixel = trainer.pixel_loss(&batch)? as f64;
        let mut g_opt = adam(trainer.generator_vars(), 1e-4)?;
        let mut d_opt = adam(trainer.discriminator_vars(), 1e-4)?;
        let stats = trainer.adversarial_step(&mut g_opt, &mut d_opt, &batch, 1, 1)?;
        assert!(stats.content > pixel, "{} <= {pixel}", stats.content);
        Ok(())
    }

    #[derive(Debug)]
    struct Nearest(usize);

    impl Module for Nearest {
        fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
            let (_b, _c, h, w) = xs.dims4()?;
            xs.upsample_nearest2d(self.0 * h, self.0 * w)
        }
    }

    #[test]
    fn evaluation_psnr_matches_direct_computation() -> Result<()> {
        let batches = vec![batch(2, 4, 2)?, batch(2, 4, 2)?];
        let got = evaluate(&Nearest(2), batches.iter().cloned().map(Ok), None)?;

        let mut want = 0.0;
        for b in &batches {
            let pred = denormalize(&b.low_res.upsample_nearest2d(8, 8)?)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            let target = denormalize(&b.high_res)?.flatten_all()?.to_vec1::<f32>()?;
            let mse = pred
                .iter()
                .zip(&target)
                .map(|(p, t)| ((p - t) as f64).powi(2))
                .sum::<f64>()
                / pred.len() as f64;
            want += 10.0 * (1.0 / mse).log10();
        }
        want /= batches.len() as f64;
        assert!((got - want).abs() < 1e-3, "{got} vs {want}");
        Ok(())
    }

    #[test]
    fn evaluation_writes_first_batch_samples() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let samples = SampleWriter {
            dir: dir.path().to_path_buf(),
            up_factor: 2,
        };
        let trainer = trainer()?;
        let batches = vec![batch(2, 4, 2), batch(2, 4, 2)];
        trainer.evaluate(batches, Some(&samples))?;
        for j in 0..2 {
            for tag in ["GT", "LR", "SR"] {
                assert!(dir.path().join(format!("{j:04}x2_{tag}.png")).exists());
            }
        }
        assert!(!dir.path().join("0002x2_GT.png").exists());
        Ok(())
    }

    #[test]
    fn checkpoints_follow_phase_names() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path())?;
        let trainer = trainer()?;
        trainer.checkpoint(&store, Checkpoint::Epoch(1), Phase::Pretrain)?;
        assert!(store.params_path("generator_pretrain_dict").exists());
        assert!(!store.params_path("discriminator_pretrain_dict").exists());

        trainer.checkpoint(&store, Checkpoint::Epoch(1), Phase::Final)?;
        assert!(store.params_path("generator_final_dict").exists());
        assert!(store.params_path("discriminator_final_dict").exists());

        trainer.checkpoint(&store, Checkpoint::Final, Phase::Final)?;
        assert!(store.config_path(GENERATOR).exists());
        assert!(store.config_path(DISCRIMINATOR).exists());

        let err = trainer
            .checkpoint(&store, Checkpoint::Epoch(0), Phase::Pretrain)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
        Ok(())
    }
}
