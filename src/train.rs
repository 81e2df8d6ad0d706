use std::time::Instant;

use crate::{
    config::TrainingConfig,
    layers::{self, Mode},
    mnist::{Batch, DataSet, Order},
    network::Network,
    optim::Sgd,
};

/// Loss and error curves, each point keyed by the number of training samples seen.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct History {
    pub train_loss: Vec<(usize, f32)>,
    pub train_error: Vec<(usize, f32)>,
    pub test_loss: Vec<(usize, f32)>,
    pub test_error: Vec<(usize, f32)>,
}

/// `100 · (1 − correct / total)`
pub fn error_rate(correct: usize, total: usize) -> f32 {
    if total == 0 {
        return 0.0;
    }

    100.0 * (1.0 - correct as f32 / total as f32)
}

fn count_correct(log_probs: &nalgebra::DMatrix<f32>, labels: &[u8]) -> usize {
    layers::argmax_columns(log_probs)
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvalReport {
    /// Mean negative log likelihood per sample.
    pub loss: f32,
    pub correct: usize,
    pub total: usize,
}

impl EvalReport {
    pub fn error_rate(&self) -> f32 {
        error_rate(self.correct, self.total)
    }

    pub fn accuracy(&self) -> f32 {
        100.0 - self.error_rate()
    }
}

/// One pass over the shuffled training split, one optimizer step per batch.
pub fn train_epoch(
    network: &mut Network,
    sgd: &mut Sgd,
    data: &DataSet,
    epoch: usize,
    shuffle_key: u64,
    config: &TrainingConfig,
    history: &mut History,
) -> EvalReport {
    let data_len = data.len();
    let batches_len = data.batch_count(config.batch_size);
    let start = Instant::now();

    let mut correct = 0;
    let mut loss_sum = 0.0f64;

    for (batch_idx, batch) in data
        .batches(config.batch_size, Order::Shuffled(shuffle_key))
        .enumerate()
    {
        let fwd = network.forward(&batch.images, Mode::Train);
        let batch_loss = layers::nll_loss_sum(&fwd.log_probs, &batch.labels);
        let loss = batch_loss / batch.len() as f32;
        let grads = network.backward(&fwd, &batch.labels);

        network.update_running_stats(&fwd);
        sgd.step(network.parameters_mut(), grads.slices());

        correct += count_correct(&fwd.log_probs, &batch.labels);
        loss_sum += batch_loss as f64;

        if batch_idx % config.log_interval == 0 {
            tracing::info!(
                "Train Epoch: {} [{}/{} ({:.0}%)]\tLoss: {:.6}",
                epoch,
                batch_idx * config.batch_size,
                data_len,
                100.0 * batch_idx as f32 / batches_len as f32,
                loss
            );

            history.train_loss.push((
                batch_idx * config.batch_size + (epoch - 1) * data_len,
                loss,
            ));
        }
    }

    let report = EvalReport {
        loss: (loss_sum / data_len.max(1) as f64) as f32,
        correct,
        total: data_len,
    };

    history.train_error.push((epoch * data_len, report.error_rate()));

    tracing::debug!(
        "Epoch {} trained in {}ms, error {:.2}%",
        epoch,
        start.elapsed().as_millis(),
        report.error_rate()
    );

    report
}

/// Summed loss and correct predictions over a split in evaluation mode.
pub fn evaluate(network: &Network, data: &DataSet, batch_size: usize) -> EvalReport {
    let mut loss_sum = 0.0f64;
    let mut correct = 0;

    for batch in data.batches(batch_size, Order::Sequential) {
        let log_probs = network.predict(&batch.images);

        loss_sum += layers::nll_loss_sum(&log_probs, &batch.labels) as f64;
        correct += count_correct(&log_probs, &batch.labels);
    }

    EvalReport {
        loss: (loss_sum / data.len().max(1) as f64) as f32,
        correct,
        total: data.len(),
    }
}

/// Evaluates the test split and records the result at `samples_seen`.
pub fn test(
    network: &Network,
    data: &DataSet,
    batch_size: usize,
    samples_seen: usize,
    history: &mut History,
) -> EvalReport {
    let report = evaluate(network, data, batch_size);

    tracing::info!(
        "Test set: Average loss: {:.4}, Accuracy: {}/{} ({:.0}%)",
        report.loss,
        report.correct,
        report.total,
        report.accuracy()
    );

    history.test_loss.push((samples_seen, report.loss));
    history.test_error.push((samples_seen, report.error_rate()));

    report
}

/// The first evaluation batch together with the predicted label of every sample.
pub fn predict_batch(network: &Network, data: &DataSet, batch_size: usize) -> Option<(Batch, Vec<u8>)> {
    let batch = data.batches(batch_size, Order::Sequential).next()?;
    let predicted = layers::argmax_columns(&network.predict(&batch.images));

    Some((batch, predicted))
}

#[cfg(test)]
pub(crate) mod tests {
    use nalgebra::DMatrix;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::network::tests::small_config;

    /// Images whose mean brightness encodes the label, so the task is learnable.
    pub(crate) fn synthetic(rng: &mut StdRng, count: usize, classes: u8) -> DataSet {
        let labels: Vec<u8> = (0..count).map(|i| (i % classes as usize) as u8).collect();
        let images = DMatrix::from_fn(64, count, |r, c| {
            let level = labels[c] as f32 / classes as f32;
            let stripe = if r % 8 < (labels[c] as usize % 8) { 1.0 } else { -1.0 };
            level + 0.5 * stripe + rng.gen_range(-0.1..0.1)
        });

        DataSet {
            height: 8,
            width: 8,
            images,
            labels,
        }
    }

    fn config(batch_size: usize, log_interval: usize) -> TrainingConfig {
        TrainingConfig {
            epochs: 2,
            batch_size,
            log_interval,
            learning_rate: 0.05,
            model: small_config(),
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn error_rate_bounds() {
        assert_eq!(error_rate(0, 10), 100.0);
        assert_eq!(error_rate(10, 10), 0.0);
        assert_eq!(error_rate(3, 4), 25.0);
    }

    #[test]
    fn logged_points_follow_sample_counter() {
        let mut rng = StdRng::seed_from_u64(20);
        let data = synthetic(&mut rng, 100, 10);
        let config = config(8, 5);
        let mut network = Network::new(&config.model, &mut rng).unwrap();
        let mut sgd = Sgd::new(config.learning_rate, config.momentum);
        let mut history = History::default();

        for epoch in 1..=2 {
            train_epoch(&mut network, &mut sgd, &data, epoch, epoch as u64, &config, &mut history);
        }

        // 13 batches per epoch, logged at batch 0, 5 and 10
        let counters: Vec<usize> = history.train_loss.iter().map(|p| p.0).collect();
        assert_eq!(counters, vec![0, 40, 80, 100, 140, 180]);

        let error_points: Vec<usize> = history.train_error.iter().map(|p| p.0).collect();
        assert_eq!(error_points, vec![100, 200]);

        for &(_, e) in &history.train_error {
            assert!((0.0..=100.0).contains(&e));
        }
    }

    #[test]
    fn evaluation_counts_every_sample_and_leaves_model_untouched() {
        let mut rng = StdRng::seed_from_u64(21);
        let data = synthetic(&mut rng, 37, 10);
        let network = Network::new(&small_config(), &mut rng).unwrap();
        let mut history = History::default();

        let first = test(&network, &data, 16, 0, &mut history);
        let second = test(&network, &data, 5, 0, &mut history);

        assert_eq!(first.total, 37);
        assert_eq!(first.correct, second.correct);
        approx::assert_relative_eq!(first.loss, second.loss, epsilon = 1e-4);
        assert_eq!(history.test_loss.len(), 2);
        assert_eq!(history.test_error[0], (0, first.error_rate()));
        assert!((0.0..=100.0).contains(&first.error_rate()));
    }

    #[test]
    fn fresh_model_is_near_chance() {
        let mut rng = StdRng::seed_from_u64(22);
        let mut data = synthetic(&mut rng, 500, 10);
        // labels independent of the images
        for l in data.labels.iter_mut() {
            *l = rng.gen_range(0..10);
        }
        let network = Network::new(&small_config(), &mut rng).unwrap();

        let report = evaluate(&network, &data, 64);

        assert!(report.error_rate() > 60.0, "error {}", report.error_rate());
    }

    #[test]
    fn training_reduces_loss() {
        let mut rng = StdRng::seed_from_u64(23);
        let data = synthetic(&mut rng, 200, 4);
        let config = config(20, 100);
        let mut network = Network::new(&config.model, &mut rng).unwrap();
        let mut sgd = Sgd::new(config.learning_rate, config.momentum);
        let mut history = History::default();

        let before = evaluate(&network, &data, 50);
        for epoch in 1..=5 {
            train_epoch(&mut network, &mut sgd, &data, epoch, rng.gen(), &config, &mut history);
        }
        let after = evaluate(&network, &data, 50);

        assert!(after.loss < before.loss, "{} -> {}", before.loss, after.loss);
    }

    #[test]
    fn predict_batch_labels_first_batch() {
        let mut rng = StdRng::seed_from_u64(24);
        let data = synthetic(&mut rng, 30, 10);
        let network = Network::new(&small_config(), &mut rng).unwrap();

        let (batch, predicted) = predict_batch(&network, &data, 12).unwrap();

        assert_eq!(batch.labels, data.labels[..12].to_vec());
        assert_eq!(predicted.len(), 12);
        assert!(predicted.iter().all(|&p| p < 10));
    }
}
