use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed idx file: {0}")]
    Idx(String),

    #[error("dataset file {0} not found (build with the `download` feature to fetch it)")]
    MissingDataset(PathBuf),

    #[cfg(feature = "download")]
    #[error("dataset download failed: {0}")]
    Download(String),

    #[error("malformed parameter file: {0}")]
    ParamFormat(String),

    #[error("parameter `{name}` has shape {found:?}, expected {expected:?}")]
    ParamShape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("parameter `{0}` missing from file")]
    MissingParam(String),

    #[error("unexpected parameter `{0}` in file")]
    UnexpectedParam(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("plotting failed: {0}")]
    Plot(String),

    #[error("reloaded parameters diverge from the saved model (max abs diff {0})")]
    RoundTrip(f32),
}

pub type Result<T> = std::result::Result<T, Error>;
