//! Hyperparameters and network topology.
//!
//! The defaults reproduce the fixed constants of the reference experiment. A JSON
//! file may override any subset of them:
//!
//! ```json
//! {
//!   "epochs": 10,
//!   "learning_rate": 0.05,
//!   "model": { "hidden": 64 }
//! }
//! ```

use std::{fs, path::Path};

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionsMode {
    /// Keep earlier rows and add new ones at the end of the file.
    Append,
    Truncate,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Normalization {
    pub mean: f32,
    pub std: f32,
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            mean: 0.1307,
            std: 0.3081,
        }
    }
}

impl Normalization {
    pub fn apply(&self, pixel: f32) -> f32 {
        (pixel - self.mean) / self.std
    }

    pub fn invert(&self, value: f32) -> f32 {
        value * self.std + self.mean
    }
}

/// One convolution + batch-norm + ReLU + max-pool stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct ConvStage {
    pub out_channels: usize,
    pub kernel: usize,
    #[serde(default = "ConvStage::default_stride")]
    pub stride: usize,
    pub padding: usize,
    pub pool: usize,
}

impl ConvStage {
    fn default_stride() -> usize {
        1
    }

    /// Spatial size after the convolution, before pooling.
    pub fn conv_size(&self, size: usize) -> Option<usize> {
        (size + 2 * self.padding)
            .checked_sub(self.kernel)
            .map(|s| s / self.stride + 1)
    }

    /// Spatial size after convolution and pooling.
    pub fn output_size(&self, size: usize) -> Option<usize> {
        self.conv_size(size)
            .map(|s| s / self.pool)
            .filter(|&s| s > 0)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub image_height: usize,
    pub image_width: usize,
    pub in_channels: usize,
    pub stages: Vec<ConvStage>,
    pub hidden: usize,
    pub classes: usize,
    pub bn_epsilon: f32,
    pub bn_momentum: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let stage = |out_channels| ConvStage {
            out_channels,
            kernel: 5,
            stride: 1,
            padding: 2,
            pool: 2,
        };

        Self {
            image_height: 28,
            image_width: 28,
            in_channels: 1,
            stages: vec![stage(16), stage(32)],
            hidden: 128,
            classes: 10,
            bn_epsilon: 1e-3,
            bn_momentum: 0.1,
        }
    }
}

/// Geometry of a stage's input as seen by the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageShape {
    pub in_channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ModelConfig {
    pub fn image_len(&self) -> usize {
        self.in_channels * self.image_height * self.image_width
    }

    /// Input shape of every stage followed by the shape of the last stage's output.
    pub fn stage_shapes(&self) -> Result<Vec<StageShape>> {
        let mut shape = StageShape {
            in_channels: self.in_channels,
            height: self.image_height,
            width: self.image_width,
        };
        let mut shapes = vec![shape];

        for (idx, stage) in self.stages.iter().enumerate() {
            let height = stage.output_size(shape.height);
            let width = stage.output_size(shape.width);

            shape = match (height, width) {
                (Some(height), Some(width)) => StageShape {
                    in_channels: stage.out_channels,
                    height,
                    width,
                },
                _ => {
                    return Err(Error::Config(format!(
                        "stage {} reduces a {}x{} input to nothing",
                        idx + 1,
                        shape.height,
                        shape.width
                    )))
                }
            };

            shapes.push(shape);
        }

        Ok(shapes)
    }

    /// Width of the flattened feature vector entering the first linear layer.
    pub fn flat_features(&self) -> Result<usize> {
        let shapes = self.stage_shapes()?;
        let last = shapes[shapes.len() - 1];

        Ok(last.in_channels * last.height * last.width)
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 || self.hidden == 0 || self.classes < 2 {
            return Err(Error::Config(
                "channels and hidden width must be positive, classes at least 2".into(),
            ));
        }

        if self.stages.is_empty() {
            return Err(Error::Config("at least one convolution stage is required".into()));
        }

        for stage in &self.stages {
            if stage.out_channels == 0 || stage.kernel == 0 || stage.stride == 0 || stage.pool == 0
            {
                return Err(Error::Config(format!("degenerate stage {:?}", stage)));
            }
        }

        if !(self.bn_epsilon > 0.0) || !(0.0..=1.0).contains(&self.bn_momentum) {
            return Err(Error::Config(
                "bn_epsilon must be positive and bn_momentum in [0, 1]".into(),
            ));
        }

        self.stage_shapes().map(|_| ())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    /// Batches between two recorded training-loss points.
    pub log_interval: usize,
    pub seed: Option<u64>,
    pub normalization: Normalization,
    pub predictions: PredictionsMode,
    pub model: ModelConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 64,
            learning_rate: 0.01,
            momentum: 0.9,
            log_interval: 20,
            seed: None,
            normalization: Normalization::default(),
            predictions: PredictionsMode::Append,
            model: ModelConfig::default(),
        }
    }
}

impl TrainingConfig {
    pub fn from_json(src: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(src)?;

        config.validate()?;

        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch_size == 0 || self.log_interval == 0 {
            return Err(Error::Config(
                "epochs, batch_size and log_interval must be positive".into(),
            ));
        }

        if !(self.learning_rate > 0.0) {
            return Err(Error::Config("learning_rate must be positive".into()));
        }

        if !(0.0..1.0).contains(&self.momentum) {
            return Err(Error::Config("momentum must be in [0, 1)".into()));
        }

        if !(self.normalization.std > 0.0) {
            return Err(Error::Config("normalization std must be positive".into()));
        }

        self.model.validate()
    }
}
