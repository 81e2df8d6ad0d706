//! Building blocks of the classifier.
//!
//! Feature maps are kept one matrix per sample, `channels × (height · width)`, with
//! pixel `y · width + x` in column `p`. Dense activations are one column per sample.
//! Every layer is a pure function of its parameters: forward passes return whatever
//! the matching backward pass needs, and training-mode statistics are handed back to
//! the caller instead of being written into the layer.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use crate::config::ConvStage;

/// Whether batch normalization uses batch statistics or its running estimates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

fn kaiming_normal<R: Rng + ?Sized>(rows: usize, cols: usize, fan_in: usize, rng: &mut R) -> DMatrix<f32> {
    let std = (2.0 / fan_in as f32).sqrt();

    DMatrix::from_fn(rows, cols, |_, _| rng.sample::<f32, _>(StandardNormal) * std)
}

fn uniform_bias<R: Rng + ?Sized>(len: usize, fan_in: usize, rng: &mut R) -> DVector<f32> {
    let bound = 1.0 / (fan_in as f32).sqrt();

    DVector::from_fn(len, |_, _| rng.gen_range(-bound..bound))
}

#[derive(Clone, Debug)]
pub struct Conv2d {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    /// `out_channels × (in_channels · kernel · kernel)`
    pub weight: DMatrix<f32>,
    pub bias: DVector<f32>,
}

#[derive(Clone, Debug)]
pub struct ConvGrads {
    pub weight: DMatrix<f32>,
    pub bias: DVector<f32>,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(in_channels: usize, stage: &ConvStage, rng: &mut R) -> Self {
        let fan_in = in_channels * stage.kernel * stage.kernel;

        Self {
            in_channels,
            out_channels: stage.out_channels,
            kernel: stage.kernel,
            stride: stage.stride,
            padding: stage.padding,
            weight: kaiming_normal(stage.out_channels, fan_in, fan_in, rng),
            bias: uniform_bias(stage.out_channels, fan_in, rng),
        }
    }

    pub fn output_dims(&self, (h, w): (usize, usize)) -> (usize, usize) {
        let out = |s: usize| (s + 2 * self.padding - self.kernel) / self.stride + 1;

        (out(h), out(w))
    }

    /// Source pixel of kernel tap `(ky, kx)` for output `(oy, ox)`, if inside the image.
    fn source(&self, (h, w): (usize, usize), (oy, ox): (usize, usize), (ky, kx): (usize, usize)) -> Option<usize> {
        let y = (oy * self.stride + ky).checked_sub(self.padding)?;
        let x = (ox * self.stride + kx).checked_sub(self.padding)?;

        (y < h && x < w).then(|| y * w + x)
    }

    fn im2col(&self, input: &DMatrix<f32>, dims: (usize, usize)) -> DMatrix<f32> {
        let (oh, ow) = self.output_dims(dims);
        let k = self.kernel;
        let mut cols = DMatrix::zeros(self.in_channels * k * k, oh * ow);

        for oy in 0..oh {
            for ox in 0..ow {
                let col = oy * ow + ox;

                for ky in 0..k {
                    for kx in 0..k {
                        if let Some(src) = self.source(dims, (oy, ox), (ky, kx)) {
                            for c in 0..self.in_channels {
                                cols[((c * k + ky) * k + kx, col)] = input[(c, src)];
                            }
                        }
                    }
                }
            }
        }

        cols
    }

    fn col2im(&self, cols: &DMatrix<f32>, dims: (usize, usize)) -> DMatrix<f32> {
        let (oh, ow) = self.output_dims(dims);
        let k = self.kernel;
        let mut image = DMatrix::zeros(self.in_channels, dims.0 * dims.1);

        for oy in 0..oh {
            for ox in 0..ow {
                let col = oy * ow + ox;

                for ky in 0..k {
                    for kx in 0..k {
                        if let Some(src) = self.source(dims, (oy, ox), (ky, kx)) {
                            for c in 0..self.in_channels {
                                image[(c, src)] += cols[((c * k + ky) * k + kx, col)];
                            }
                        }
                    }
                }
            }
        }

        image
    }

    /// Returns the output maps and the unfolded inputs needed by [`Conv2d::backward`].
    pub fn forward(&self, input: &[DMatrix<f32>], dims: (usize, usize)) -> (Vec<DMatrix<f32>>, Vec<DMatrix<f32>>) {
        input
            .par_iter()
            .map(|x| {
                let cols = self.im2col(x, dims);
                let mut out = &self.weight * &cols;

                for (mut row, &b) in out.row_iter_mut().zip(self.bias.iter()) {
                    row.add_scalar_mut(b);
                }

                (out, cols)
            })
            .unzip()
    }

    /// Gradients for the parameters and, when `input_grad` is set, for the input maps.
    pub fn backward(
        &self,
        cols: &[DMatrix<f32>],
        grad: &[DMatrix<f32>],
        dims: (usize, usize),
        input_grad: bool,
    ) -> (ConvGrads, Option<Vec<DMatrix<f32>>>) {
        let per_sample: Vec<_> = cols
            .par_iter()
            .zip(grad.par_iter())
            .map(|(c, g)| {
                let dx = input_grad.then(|| self.col2im(&(self.weight.transpose() * g), dims));

                (g * c.transpose(), g.column_sum(), dx)
            })
            .collect();

        let mut grads = ConvGrads {
            weight: DMatrix::zeros(self.weight.nrows(), self.weight.ncols()),
            bias: DVector::zeros(self.out_channels),
        };
        let mut dxs = Vec::with_capacity(if input_grad { per_sample.len() } else { 0 });

        for (dw, db, dx) in per_sample {
            grads.weight += dw;
            grads.bias += db;
            dxs.extend(dx);
        }

        (grads, input_grad.then_some(dxs))
    }
}

/// Per-channel statistics of one training batch.
#[derive(Clone, Debug)]
pub struct BatchStats {
    pub mean: DVector<f32>,
    /// Biased variance, as used for normalizing the batch.
    pub var: DVector<f32>,
    pub count: usize,
}

#[derive(Clone, Debug)]
pub struct NormCache {
    xhat: Vec<DMatrix<f32>>,
    inv_std: DVector<f32>,
    pub stats: Option<BatchStats>,
}

#[derive(Clone, Debug)]
pub struct NormGrads {
    pub gamma: DVector<f32>,
    pub beta: DVector<f32>,
}

#[derive(Clone, Debug)]
pub struct BatchNorm2d {
    pub gamma: DVector<f32>,
    pub beta: DVector<f32>,
    pub running_mean: DVector<f32>,
    pub running_var: DVector<f32>,
    pub epsilon: f32,
    pub momentum: f32,
}

impl BatchNorm2d {
    pub fn new(channels: usize, epsilon: f32, momentum: f32) -> Self {
        Self {
            gamma: DVector::from_element(channels, 1.0),
            beta: DVector::zeros(channels),
            running_mean: DVector::zeros(channels),
            running_var: DVector::from_element(channels, 1.0),
            epsilon,
            momentum,
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.len()
    }

    fn batch_stats(&self, input: &[DMatrix<f32>]) -> BatchStats {
        let channels = self.channels();
        let count = input.iter().map(DMatrix::ncols).sum::<usize>();
        let mut mean = DVector::zeros(channels);
        let mut var = DVector::zeros(channels);

        for x in input {
            mean += x.column_sum();
        }
        mean /= count as f32;

        for x in input {
            for (idx, v) in x.iter().enumerate() {
                let c = idx % channels;
                var[c] += (v - mean[c]).powi(2);
            }
        }
        var /= count as f32;

        BatchStats { mean, var, count }
    }

    pub fn forward(&self, input: &[DMatrix<f32>], mode: Mode) -> (Vec<DMatrix<f32>>, NormCache) {
        let (mean, var, stats) = match mode {
            Mode::Train => {
                let stats = self.batch_stats(input);
                (stats.mean.clone(), stats.var.clone(), Some(stats))
            }
            Mode::Eval => (self.running_mean.clone(), self.running_var.clone(), None),
        };

        let inv_std = var.map(|v| 1.0 / (v + self.epsilon).sqrt());
        let channels = self.channels();

        let (out, xhat): (Vec<_>, Vec<_>) = input
            .par_iter()
            .map(|x| {
                let mut xhat = x.clone();
                let mut y = x.clone();

                for (idx, (h, o)) in xhat.iter_mut().zip(y.iter_mut()).enumerate() {
                    let c = idx % channels;
                    *h = (*h - mean[c]) * inv_std[c];
                    *o = self.gamma[c] * *h + self.beta[c];
                }

                (y, xhat)
            })
            .unzip();

        (out, NormCache { xhat, inv_std, stats })
    }

    pub fn backward(&self, cache: &NormCache, grad: &[DMatrix<f32>]) -> (NormGrads, Vec<DMatrix<f32>>) {
        let channels = self.channels();
        let mut dgamma = DVector::zeros(channels);
        let mut dbeta = DVector::zeros(channels);

        for (g, h) in grad.iter().zip(&cache.xhat) {
            for (idx, (dy, xh)) in g.iter().zip(h.iter()).enumerate() {
                let c = idx % channels;
                dgamma[c] += dy * xh;
                dbeta[c] += dy;
            }
        }

        let dx = grad
            .par_iter()
            .zip(cache.xhat.par_iter())
            .map(|(g, h)| {
                let mut dx = g.clone();

                for (idx, (d, xh)) in dx.iter_mut().zip(h.iter()).enumerate() {
                    let c = idx % channels;
                    let scale = self.gamma[c] * cache.inv_std[c];

                    *d = match &cache.stats {
                        Some(stats) => {
                            let n = stats.count as f32;
                            scale * (*d - dbeta[c] / n - xh * dgamma[c] / n)
                        }
                        None => scale * *d,
                    };
                }

                dx
            })
            .collect();

        (NormGrads { gamma: dgamma, beta: dbeta }, dx)
    }

    pub fn update_running_stats(&mut self, stats: &BatchStats) {
        let m = self.momentum;
        let n = stats.count as f32;
        let unbiased = if stats.count > 1 {
            &stats.var * (n / (n - 1.0))
        } else {
            stats.var.clone()
        };

        self.running_mean = &self.running_mean * (1.0 - m) + &stats.mean * m;
        self.running_var = &self.running_var * (1.0 - m) + unbiased * m;
    }
}

pub fn relu_in_place(maps: &mut [DMatrix<f32>]) {
    maps.par_iter_mut().for_each(|m| m.apply(|v| *v = v.max(0.0)));
}

/// Zeroes gradient entries where the activation was clamped.
pub fn relu_backward(activated: &DMatrix<f32>, grad: &mut DMatrix<f32>) {
    grad.zip_apply(activated, |g, a| {
        if a <= 0.0 {
            *g = 0.0;
        }
    });
}

#[derive(Clone, Copy, Debug)]
pub struct MaxPool2d {
    pub size: usize,
}

impl MaxPool2d {
    pub fn output_dims(&self, (h, w): (usize, usize)) -> (usize, usize) {
        (h / self.size, w / self.size)
    }

    /// Pools one sample, returning the flat input index chosen for every output element.
    pub fn forward(&self, input: &DMatrix<f32>, dims: (usize, usize)) -> (DMatrix<f32>, Vec<usize>) {
        let (oh, ow) = self.output_dims(dims);
        let channels = input.nrows();
        let mut out = DMatrix::zeros(channels, oh * ow);
        let mut argmax = vec![0; channels * oh * ow];

        for oy in 0..oh {
            for ox in 0..ow {
                let col = oy * ow + ox;

                for c in 0..channels {
                    let mut best = (f32::NEG_INFINITY, 0);

                    for py in 0..self.size {
                        for px in 0..self.size {
                            let p = (oy * self.size + py) * dims.1 + ox * self.size + px;
                            let v = input[(c, p)];

                            if v > best.0 {
                                best = (v, p);
                            }
                        }
                    }

                    out[(c, col)] = best.0;
                    argmax[col * channels + c] = best.1;
                }
            }
        }

        (out, argmax)
    }

    pub fn backward(&self, grad: &DMatrix<f32>, argmax: &[usize], dims: (usize, usize)) -> DMatrix<f32> {
        let channels = grad.nrows();
        let mut dx = DMatrix::zeros(channels, dims.0 * dims.1);

        for (idx, g) in grad.iter().enumerate() {
            dx[(idx % channels, argmax[idx])] += g;
        }

        dx
    }
}

#[derive(Clone, Debug)]
pub struct Linear {
    /// `out_features × in_features`
    pub weight: DMatrix<f32>,
    pub bias: DVector<f32>,
}

#[derive(Clone, Debug)]
pub struct LinearGrads {
    pub weight: DMatrix<f32>,
    pub bias: DVector<f32>,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        Self {
            weight: kaiming_normal(out_features, in_features, in_features, rng),
            bias: uniform_bias(out_features, in_features, rng),
        }
    }

    pub fn forward(&self, input: &DMatrix<f32>) -> DMatrix<f32> {
        let mut out = &self.weight * input;

        for mut col in out.column_iter_mut() {
            col += &self.bias;
        }

        out
    }

    pub fn backward(&self, input: &DMatrix<f32>, grad: &DMatrix<f32>) -> (LinearGrads, DMatrix<f32>) {
        (
            LinearGrads {
                weight: grad * input.transpose(),
                bias: grad.column_sum(),
            },
            self.weight.transpose() * grad,
        )
    }
}

/// Column-wise log-softmax.
pub fn log_softmax(logits: &DMatrix<f32>) -> DMatrix<f32> {
    let mut out = logits.clone();

    for mut col in out.column_iter_mut() {
        let max = col.max();
        let log_sum = col.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;

        col.add_scalar_mut(-log_sum);
    }

    out
}

/// Summed negative log likelihood of `labels` under column-wise log-probabilities.
pub fn nll_loss_sum(log_probs: &DMatrix<f32>, labels: &[u8]) -> f32 {
    labels
        .iter()
        .enumerate()
        .map(|(col, &label)| -log_probs[(label as usize, col)])
        .sum()
}

/// Gradient of the mean NLL with respect to the logits feeding the log-softmax.
pub fn nll_logits_grad(log_probs: &DMatrix<f32>, labels: &[u8]) -> DMatrix<f32> {
    let scale = 1.0 / labels.len() as f32;
    let mut grad = log_probs.map(|v| v.exp() * scale);

    for (col, &label) in labels.iter().enumerate() {
        grad[(label as usize, col)] -= scale;
    }

    grad
}

/// Index of the largest entry in each column.
pub fn argmax_columns(m: &DMatrix<f32>) -> Vec<u8> {
    m.column_iter().map(|col| col.imax() as u8).collect()
}
