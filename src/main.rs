mod config;
mod error;
mod layers;
mod mnist;
mod network;
mod optim;
mod persist;
mod report;
mod train;

use std::{fs, path::PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use crate::{
    config::{PredictionsMode, TrainingConfig},
    mnist::{FashionMNIST, Order},
    network::Network,
    optim::Sgd,
    train::History,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

/// Trains a small convolutional classifier on Fashion-MNIST and plots how it went
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Folder holding the Fashion-MNIST idx files
    #[arg(default_value = "fashiondata")]
    data_folder: PathBuf,

    /// Where plots, parameters and predictions are written
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// JSON file overriding hyperparameters and topology
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Replace the predictions file instead of appending to it
    #[arg(long)]
    truncate_predictions: bool,
}

impl Args {
    fn training_config(&self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => TrainingConfig::default(),
        };

        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.truncate_predictions {
            config.predictions = PredictionsMode::Truncate;
        }

        config.validate()?;

        Ok(config)
    }
}

fn train_network(args: &Args, config: &TrainingConfig, data: FashionMNIST) -> Result<()> {
    let model = &config.model;
    let seed = config.seed.unwrap_or_else(|| rand::thread_rng().gen());
    let mut rng = StdRng::seed_from_u64(seed);

    tracing::info!("Seed {}", seed);

    if data.training.images.nrows() != model.image_len()
        || (data.training.height, data.training.width) != (model.image_height, model.image_width)
    {
        bail!(
            "dataset images are {}x{} single channel, model expects {}x{} with {} channels",
            data.training.height,
            data.training.width,
            model.image_height,
            model.image_width,
            model.in_channels
        );
    }

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("creating {}", args.out_dir.display()))?;
    let out = |name: &str| args.out_dir.join(name);
    let dims = (model.image_height, model.image_width);

    if let Some(batch) = data.test.batches(config.batch_size, Order::Sequential).next() {
        report::plot_samples(
            &out("samples_ground_truth.svg"),
            &batch,
            &batch.labels,
            "Ground truth",
            dims,
            &config.normalization,
        )?;
    }

    let mut network = Network::new(model, &mut rng)?;
    let mut sgd = Sgd::new(config.learning_rate, config.momentum);
    let mut history = History::default();
    let train_len = data.training.len();

    tracing::info!(
        "Training for {} epochs, batch size {}, learning rate {}, momentum {}",
        config.epochs,
        config.batch_size,
        sgd.learning_rate(),
        sgd.momentum()
    );

    train::test(&network, &data.test, config.batch_size, 0, &mut history);

    for epoch in 1..=config.epochs {
        train::train_epoch(
            &mut network,
            &mut sgd,
            &data.training,
            epoch,
            rng.gen(),
            config,
            &mut history,
        );
        train::test(
            &network,
            &data.test,
            config.batch_size,
            epoch * train_len,
            &mut history,
        );
    }

    report::plot_curves(
        &out("loss.svg"),
        &history.train_loss,
        &history.test_loss,
        "negative log likelihood loss",
    )?;
    report::plot_curves(
        &out("error.svg"),
        &history.train_error,
        &history.test_error,
        "error (%)",
    )?;

    if let Some((batch, predicted)) =
        train::predict_batch(&network, &data.test, config.batch_size)
    {
        report::plot_samples(
            &out("samples_predicted.svg"),
            &batch,
            &predicted,
            "Predicted",
            dims,
            &config.normalization,
        )?;
    }

    let params = out("mymodel.bin");
    persist::save_parameters(&params, &network)?;

    let reloaded = persist::load_parameters(&params, network.config())
        .with_context(|| format!("reloading {}", params.display()))?;

    if let Some(batch) = data.test.batches(config.batch_size, Order::Sequential).next() {
        persist::verify_round_trip(&network, &reloaded, &batch.images)?;
    }

    persist::write_predictions(
        &out("predictions.txt"),
        &reloaded,
        &data.test,
        config.batch_size,
        config.predictions,
    )?;

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fashion_cnn=info")),
        )
        .init();

    let args = Args::parse();
    let config = args.training_config()?;

    tracing::info!("Loading Fashion-MNIST data");

    let data = FashionMNIST::load_or_fetch(
        &args.data_folder,
        config.model.classes,
        &config.normalization,
    )
    .context("Error loading Fashion-MNIST data")?;

    tracing::info!(
        "Loaded {} training and {} test images",
        data.training.len(),
        data.test.len()
    );

    train_network(&args, &config, data)
}
