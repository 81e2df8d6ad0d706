use itertools::izip;
use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::{
    config::ModelConfig,
    error::Result,
    layers::{
        self, BatchNorm2d, Conv2d, ConvGrads, Linear, LinearGrads, MaxPool2d, Mode, NormCache,
        NormGrads,
    },
};

struct Stage {
    conv: Conv2d,
    norm: BatchNorm2d,
    pool: MaxPool2d,
    /// Spatial size of the stage input.
    dims: (usize, usize),
}

struct StageTrace {
    cols: Vec<DMatrix<f32>>,
    norm: NormCache,
    activated: Vec<DMatrix<f32>>,
    argmax: Vec<Vec<usize>>,
}

/// Everything a forward pass produced; consumed by [`Network::backward`] and
/// [`Network::update_running_stats`].
pub struct Forward {
    pub log_probs: DMatrix<f32>,
    stages: Vec<StageTrace>,
    flat: DMatrix<f32>,
    hidden: DMatrix<f32>,
}

pub struct StageGrads {
    pub conv: ConvGrads,
    pub norm: NormGrads,
}

pub struct Gradients {
    pub stages: Vec<StageGrads>,
    pub fc1: LinearGrads,
    pub fc2: LinearGrads,
}

impl Gradients {
    /// Gradient slices in the order of [`Network::parameters_mut`].
    pub fn slices(&self) -> Vec<&[f32]> {
        let mut out: Vec<&[f32]> = Vec::with_capacity(4 * self.stages.len() + 4);

        for s in &self.stages {
            out.push(s.conv.weight.as_slice());
            out.push(s.conv.bias.as_slice());
            out.push(s.norm.gamma.as_slice());
            out.push(s.norm.beta.as_slice());
        }

        out.extend([
            self.fc1.weight.as_slice(),
            self.fc1.bias.as_slice(),
            self.fc2.weight.as_slice(),
            self.fc2.bias.as_slice(),
        ]);

        out
    }
}

/// A named tensor in row-major order.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

fn matrix_tensor(name: String, shape: Vec<usize>, m: &DMatrix<f32>) -> NamedTensor {
    NamedTensor {
        name,
        shape,
        data: m.transpose().as_slice().to_vec(),
    }
}

fn vector_tensor(name: String, v: &DVector<f32>) -> NamedTensor {
    NamedTensor {
        name,
        shape: vec![v.len()],
        data: v.as_slice().to_vec(),
    }
}

/// Convolution stages, then `fc1 → ReLU → fc2 → log-softmax`.
pub struct Network {
    config: ModelConfig,
    stages: Vec<Stage>,
    fc1: Linear,
    fc2: Linear,
}

impl Network {
    pub fn new<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;

        let shapes = config.stage_shapes()?;
        let stages = config
            .stages
            .iter()
            .zip(&shapes)
            .map(|(stage, shape)| Stage {
                conv: Conv2d::new(shape.in_channels, stage, rng),
                norm: BatchNorm2d::new(stage.out_channels, config.bn_epsilon, config.bn_momentum),
                pool: MaxPool2d { size: stage.pool },
                dims: (shape.height, shape.width),
            })
            .collect();

        let flat = config.flat_features()?;

        Ok(Network {
            config: config.clone(),
            stages,
            fc1: Linear::new(flat, config.hidden, rng),
            fc2: Linear::new(config.hidden, config.classes, rng),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Runs a batch of images (one per column) through the network.
    pub fn forward(&self, images: &DMatrix<f32>, mode: Mode) -> Forward {
        let batch = images.ncols();
        let channels = self.config.in_channels;
        let pixels = self.config.image_height * self.config.image_width;

        // image columns are channel-major, maps are channels × pixels
        let mut maps: Vec<DMatrix<f32>> = images
            .column_iter()
            .map(|col| DMatrix::from_column_slice(pixels, channels, col.as_slice()).transpose())
            .collect();
        let mut traces = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let conv_dims = stage.conv.output_dims(stage.dims);
            let (conv_out, cols) = stage.conv.forward(&maps, stage.dims);
            let (mut activated, norm) = stage.norm.forward(&conv_out, mode);

            layers::relu_in_place(&mut activated);

            let (pooled, argmax): (Vec<_>, Vec<_>) = activated
                .iter()
                .map(|a| stage.pool.forward(a, conv_dims))
                .unzip();

            maps = pooled;
            traces.push(StageTrace {
                cols,
                norm,
                activated,
                argmax,
            });
        }

        let features = maps.first().map(|m| m.len()).unwrap_or(0);
        let mut flat = DMatrix::zeros(features, batch);

        for (mut col, m) in flat.column_iter_mut().zip(&maps) {
            col.copy_from_slice(m.transpose().as_slice());
        }

        let mut hidden = self.fc1.forward(&flat);
        hidden.apply(|v| *v = v.max(0.0));

        let log_probs = layers::log_softmax(&self.fc2.forward(&hidden));

        Forward {
            log_probs,
            stages: traces,
            flat,
            hidden,
        }
    }

    /// Log-probabilities in evaluation mode.
    pub fn predict(&self, images: &DMatrix<f32>) -> DMatrix<f32> {
        self.forward(images, Mode::Eval).log_probs
    }

    /// Gradients of the mean negative log likelihood of `labels`.
    pub fn backward(&self, fwd: &Forward, labels: &[u8]) -> Gradients {
        let grad = layers::nll_logits_grad(&fwd.log_probs, labels);

        let (fc2, mut grad) = self.fc2.backward(&fwd.hidden, &grad);
        layers::relu_backward(&fwd.hidden, &mut grad);

        let (fc1, grad) = self.fc1.backward(&fwd.flat, &grad);

        let last = self.stages.len() - 1;
        let last_channels = self.stages[last].conv.out_channels;
        let mut maps: Vec<DMatrix<f32>> = grad
            .column_iter()
            .map(|col| {
                let len = col.len() / last_channels;
                DMatrix::from_column_slice(len, last_channels, col.as_slice()).transpose()
            })
            .collect();

        let mut stage_grads = Vec::with_capacity(self.stages.len());

        for (idx, (stage, trace)) in self.stages.iter().zip(&fwd.stages).enumerate().rev() {
            let conv_dims = stage.conv.output_dims(stage.dims);

            let mut unpooled: Vec<DMatrix<f32>> = izip!(&maps, &trace.argmax)
                .map(|(g, argmax)| stage.pool.backward(g, argmax, conv_dims))
                .collect();

            for (g, a) in unpooled.iter_mut().zip(&trace.activated) {
                layers::relu_backward(a, g);
            }

            let (norm, grad) = stage.norm.backward(&trace.norm, &unpooled);
            let (conv, input_grad) = stage.conv.backward(&trace.cols, &grad, stage.dims, idx > 0);

            stage_grads.push(StageGrads { conv, norm });
            maps = input_grad.unwrap_or_default();
        }

        stage_grads.reverse();

        Gradients {
            stages: stage_grads,
            fc1,
            fc2,
        }
    }

    /// Folds the batch statistics of a training-mode pass into the running estimates.
    pub fn update_running_stats(&mut self, fwd: &Forward) {
        for (stage, trace) in self.stages.iter_mut().zip(&fwd.stages) {
            if let Some(stats) = &trace.norm.stats {
                stage.norm.update_running_stats(stats);
            }
        }
    }

    /// Trainable parameters, matching the order of [`Gradients::slices`].
    pub fn parameters_mut(&mut self) -> Vec<&mut [f32]> {
        let mut out: Vec<&mut [f32]> = Vec::with_capacity(4 * self.stages.len() + 4);

        for s in &mut self.stages {
            out.push(s.conv.weight.as_mut_slice());
            out.push(s.conv.bias.as_mut_slice());
            out.push(s.norm.gamma.as_mut_slice());
            out.push(s.norm.beta.as_mut_slice());
        }

        out.push(self.fc1.weight.as_mut_slice());
        out.push(self.fc1.bias.as_mut_slice());
        out.push(self.fc2.weight.as_mut_slice());
        out.push(self.fc2.bias.as_mut_slice());

        out
    }

    /// Every parameter and running statistic, keyed by layer name.
    pub fn state(&self) -> Vec<NamedTensor> {
        let mut out = Vec::new();

        for (idx, s) in self.stages.iter().enumerate() {
            let conv = format!("conv{}", idx + 1);
            let batch = format!("batch{}", idx + 1);
            let c = &s.conv;

            out.push(matrix_tensor(
                format!("{}.weight", conv),
                vec![c.out_channels, c.in_channels, c.kernel, c.kernel],
                &c.weight,
            ));
            out.push(vector_tensor(format!("{}.bias", conv), &c.bias));
            out.push(vector_tensor(format!("{}.weight", batch), &s.norm.gamma));
            out.push(vector_tensor(format!("{}.bias", batch), &s.norm.beta));
            out.push(vector_tensor(format!("{}.running_mean", batch), &s.norm.running_mean));
            out.push(vector_tensor(format!("{}.running_var", batch), &s.norm.running_var));
        }

        for (name, fc) in [("fc1", &self.fc1), ("fc2", &self.fc2)] {
            out.push(matrix_tensor(
                format!("{}.weight", name),
                vec![fc.weight.nrows(), fc.weight.ncols()],
                &fc.weight,
            ));
            out.push(vector_tensor(format!("{}.bias", name), &fc.bias));
        }

        out
    }

    /// Overwrites parameters from tensors shaped like those of [`Network::state`].
    ///
    /// Callers check names and shapes first; `tensors` must follow `state()` order.
    pub(crate) fn set_state(&mut self, tensors: &[NamedTensor]) {
        let mut it = tensors.iter();
        let mut next = || it.next().map(|t| t.data.as_slice()).unwrap_or_default();

        for s in &mut self.stages {
            let (rows, cols) = s.conv.weight.shape();
            s.conv.weight = DMatrix::from_row_slice(rows, cols, next());
            s.conv.bias.copy_from_slice(next());
            s.norm.gamma.copy_from_slice(next());
            s.norm.beta.copy_from_slice(next());
            s.norm.running_mean.copy_from_slice(next());
            s.norm.running_var.copy_from_slice(next());
        }

        for fc in [&mut self.fc1, &mut self.fc2] {
            let (rows, cols) = fc.weight.shape();
            fc.weight = DMatrix::from_row_slice(rows, cols, next());
            fc.bias.copy_from_slice(next());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::config::ConvStage;

    pub(crate) fn small_config() -> ModelConfig {
        let stage = |out_channels| ConvStage {
            out_channels,
            kernel: 3,
            stride: 1,
            padding: 1,
            pool: 2,
        };

        ModelConfig {
            image_height: 8,
            image_width: 8,
            in_channels: 1,
            stages: vec![stage(3), stage(4)],
            hidden: 12,
            classes: 10,
            bn_epsilon: 1e-3,
            bn_momentum: 0.1,
        }
    }

    pub(crate) fn random_images(rng: &mut StdRng, pixels: usize, count: usize) -> DMatrix<f32> {
        DMatrix::from_fn(pixels, count, |_, _| rng.gen_range(-1.0..2.0))
    }

    fn nll_mean(net: &Network, images: &DMatrix<f32>, labels: &[u8]) -> f32 {
        let fwd = net.forward(images, Mode::Train);
        layers::nll_loss_sum(&fwd.log_probs, labels) / labels.len() as f32
    }

    #[test]
    fn output_is_a_log_distribution_per_sample() {
        let mut rng = StdRng::seed_from_u64(10);
        let net = Network::new(&small_config(), &mut rng).unwrap();
        let images = random_images(&mut rng, 64, 5);

        for mode in [Mode::Train, Mode::Eval] {
            let out = net.forward(&images, mode).log_probs;

            assert_eq!(out.shape(), (10, 5));
            for col in out.column_iter() {
                assert_relative_eq!(col.iter().map(|v| v.exp()).sum::<f32>(), 1.0, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn eval_forward_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut net = Network::new(&small_config(), &mut rng).unwrap();
        let images = random_images(&mut rng, 64, 4);

        let fwd = net.forward(&images, Mode::Train);
        net.update_running_stats(&fwd);

        let a = net.predict(&images);
        let b = net.predict(&images);

        assert_eq!(a, b);
    }

    #[test]
    fn running_stats_only_change_when_applied() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut net = Network::new(&small_config(), &mut rng).unwrap();
        let images = random_images(&mut rng, 64, 4);

        let before = net.predict(&images);
        let _ = net.forward(&images, Mode::Train);
        assert_eq!(before, net.predict(&images));

        let fwd = net.forward(&images, Mode::Train);
        net.update_running_stats(&fwd);
        assert_ne!(before, net.predict(&images));
    }

    #[test]
    fn state_lists_every_tensor_with_shapes() {
        let mut rng = StdRng::seed_from_u64(13);
        let net = Network::new(&ModelConfig::default(), &mut rng).unwrap();
        let state = net.state();

        let names: Vec<_> = state.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "conv1.weight", "conv1.bias", "batch1.weight", "batch1.bias",
                "batch1.running_mean", "batch1.running_var",
                "conv2.weight", "conv2.bias", "batch2.weight", "batch2.bias",
                "batch2.running_mean", "batch2.running_var",
                "fc1.weight", "fc1.bias", "fc2.weight", "fc2.bias",
            ]
        );

        assert_eq!(state[0].shape, vec![16, 1, 5, 5]);
        assert_eq!(state[6].shape, vec![32, 16, 5, 5]);
        assert_eq!(state[12].shape, vec![128, 1568]);
        assert_eq!(state[14].shape, vec![10, 128]);
        for t in &state {
            assert_eq!(t.data.len(), t.shape.iter().product::<usize>());
        }
    }

    #[test]
    fn conv_bias_before_batch_norm_gets_no_gradient() {
        let mut rng = StdRng::seed_from_u64(14);
        let net = Network::new(&small_config(), &mut rng).unwrap();
        let images = random_images(&mut rng, 64, 6);
        let labels = [0, 1, 2, 3, 4, 5];

        let grads = net.backward(&net.forward(&images, Mode::Train), &labels);

        for s in &grads.stages {
            for g in s.conv.bias.iter() {
                assert!(g.abs() < 1e-4, "bias gradient {}", g);
            }
        }
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(15);
        let mut net = Network::new(&small_config(), &mut rng).unwrap();
        let images = random_images(&mut rng, 64, 6);
        let labels = [3, 1, 4, 1, 5, 9];

        let grads = net.backward(&net.forward(&images, Mode::Train), &labels);
        let analytic: Vec<Vec<f32>> = grads.slices().iter().map(|s| s.to_vec()).collect();
        let eps = 5e-3;

        // fc2 weight, fc1 weight, batch2 gamma, conv1 weight
        let probes = [(10, 3), (8, 7), (6, 1), (0, 4)];

        for (param, idx) in probes {
            let original = net.parameters_mut()[param][idx];

            net.parameters_mut()[param][idx] = original + eps;
            let plus = nll_mean(&net, &images, &labels);
            net.parameters_mut()[param][idx] = original - eps;
            let minus = nll_mean(&net, &images, &labels);
            net.parameters_mut()[param][idx] = original;

            let numeric = (plus - minus) / (2.0 * eps);
            let expected = analytic[param][idx];

            assert!(
                (numeric - expected).abs() < 2e-2 + 0.1 * expected.abs(),
                "param {} idx {}: numeric {} analytic {}",
                param,
                idx,
                numeric,
                expected
            );
        }
    }
}
