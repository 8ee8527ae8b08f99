use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use srgan::{Args, CheckpointStore, DataLoader, FeatureExtractor, ImageFolder, Trainer};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    args.validate()?;
    info!("{args:?}");

    let device = args.device()?;
    let store = CheckpointStore::new(&args.out)
        .with_context(|| format!("creating {}", args.out.display()))?;
    std::fs::create_dir_all(&args.train_output)
        .with_context(|| format!("creating {}", args.train_output.display()))?;
    std::fs::write(args.out.join("config.json"), serde_json::to_string_pretty(&args)?)?;

    let train_set = ImageFolder::open(args.train_dir(), args.pairs(), true)
        .context("opening the training set")?;
    let test_set =
        ImageFolder::open(args.test_dir(), args.pairs(), false).context("opening the test set")?;
    info!(train = train_set.len(), test = test_set.len(), "datasets loaded");
    let train = DataLoader::new(train_set, args.batch_size, true, args.threads, &device)?;
    let test = DataLoader::new(test_set, args.test_batch_size, false, args.threads, &device)?;

    let mut trainer = Trainer::new(&device, args.generator(), args.discriminator(), args.train())?;
    if let Some(path) = &args.vgg_weights {
        let fe = FeatureExtractor::from_safetensors(path, args.feature_layer, &device)
            .with_context(|| format!("loading VGG19 weights from {}", path.display()))?;
        trainer = trainer.with_feature_extractor(fe);
    } else {
        info!("no --vgg-weights given, the content loss is pixel MSE only");
    }
    if let Some(path) = &args.generator_weights {
        trainer
            .load_generator_weights(path)
            .with_context(|| format!("loading generator weights from {}", path.display()))?;
        info!("generator weights loaded from {}", path.display());
    }
    if let Some(path) = &args.discriminator_weights {
        trainer
            .load_discriminator_weights(path)
            .with_context(|| format!("loading discriminator weights from {}", path.display()))?;
        info!("discriminator weights loaded from {}", path.display());
    }

    let now = Instant::now();
    trainer.run(&train, &test, &store, args.pre_epochs, args.epochs)?;
    info!("training took {:?}", now.elapsed());
    Ok(())
}
