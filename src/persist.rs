//! Parameter files and prediction dumps.
//!
//! A parameter file is little-endian: the magic `FCNN`, a format version, the tensor
//! count, then for each tensor its name, rank, dimensions and `f32` data in row-major
//! order.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::DMatrix;
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    config::{ModelConfig, PredictionsMode},
    error::{Error, Result},
    mnist::{DataSet, Order},
    network::{NamedTensor, Network},
};

const MAGIC: &[u8; 4] = b"FCNN";
const VERSION: u32 = 1;
const MAX_RANK: u8 = 8;

pub fn write_tensors(dst: &mut impl Write, tensors: &[NamedTensor]) -> Result<()> {
    dst.write_all(MAGIC)?;
    dst.write_u32::<LittleEndian>(VERSION)?;
    dst.write_u32::<LittleEndian>(tensors.len() as u32)?;

    for t in tensors {
        dst.write_u16::<LittleEndian>(t.name.len() as u16)?;
        dst.write_all(t.name.as_bytes())?;
        dst.write_u8(t.shape.len() as u8)?;

        for &d in &t.shape {
            dst.write_u32::<LittleEndian>(d as u32)?;
        }

        for &v in &t.data {
            dst.write_f32::<LittleEndian>(v)?;
        }
    }

    Ok(())
}

pub fn read_tensors(src: &mut impl Read) -> Result<Vec<NamedTensor>> {
    let mut magic = [0; 4];
    src.read_exact(&mut magic)?;

    if &magic != MAGIC {
        return Err(Error::ParamFormat(format!("bad magic {:?}", magic)));
    }

    let version = src.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(Error::ParamFormat(format!("unsupported version {}", version)));
    }

    let count = src.read_u32::<LittleEndian>()?;
    let mut tensors = Vec::new();

    for _ in 0..count {
        let mut name = vec![0; src.read_u16::<LittleEndian>()? as usize];
        src.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| Error::ParamFormat("tensor name is not utf-8".into()))?;

        let rank = src.read_u8()?;
        if rank > MAX_RANK {
            return Err(Error::ParamFormat(format!("`{}` has rank {}", name, rank)));
        }

        let shape = (0..rank)
            .map(|_| Ok(src.read_u32::<LittleEndian>()? as usize))
            .collect::<Result<Vec<_>>>()?;
        let len = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| Error::ParamFormat(format!("`{}` is too large", name)))?;

        let mut data = vec![0.0; len];
        src.read_f32_into::<LittleEndian>(&mut data)?;

        tensors.push(NamedTensor { name, shape, data });
    }

    Ok(tensors)
}

/// Writes every parameter and running statistic of `network`, replacing `path`.
pub fn save_parameters(path: &Path, network: &Network) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);

    write_tensors(&mut out, &network.state())?;
    out.flush()?;

    tracing::info!("Saved parameters to {}", path.display());

    Ok(())
}

/// Builds a network for `config` and fills it from the tensors in `path`.
pub fn load_parameters(path: &Path, config: &ModelConfig) -> Result<Network> {
    let tensors = read_tensors(&mut BufReader::new(File::open(path)?))?;
    let mut by_name: HashMap<String, NamedTensor> =
        tensors.into_iter().map(|t| (t.name.clone(), t)).collect();

    let mut network = Network::new(config, &mut StdRng::seed_from_u64(0))?;
    let mut ordered = Vec::new();

    for expected in network.state() {
        let found = by_name
            .remove(&expected.name)
            .ok_or_else(|| Error::MissingParam(expected.name.clone()))?;

        if found.shape != expected.shape {
            return Err(Error::ParamShape {
                name: expected.name,
                expected: expected.shape,
                found: found.shape,
            });
        }

        ordered.push(found);
    }

    if let Some(extra) = by_name.into_keys().min() {
        return Err(Error::UnexpectedParam(extra));
    }

    network.set_state(&ordered);

    Ok(network)
}

/// Fails when `reloaded` does not reproduce `original` on `images`.
pub fn verify_round_trip(original: &Network, reloaded: &Network, images: &DMatrix<f32>) -> Result<()> {
    let diff = (original.predict(images) - reloaded.predict(images)).amax();

    if diff > 1e-6 || diff.is_nan() {
        return Err(Error::RoundTrip(diff));
    }

    tracing::info!("Parameter round trip verified on {} samples", images.ncols());

    Ok(())
}

/// Writes one row of class probabilities per sample of `data`, returning the row count.
pub fn write_predictions(
    path: &Path,
    network: &Network,
    data: &DataSet,
    batch_size: usize,
    mode: PredictionsMode,
) -> Result<usize> {
    let mut options = OpenOptions::new();
    options.create(true);

    match mode {
        PredictionsMode::Append => {
            let existing = path.metadata().map(|m| m.len()).unwrap_or(0);

            if existing > 0 {
                tracing::warn!(
                    "Appending to {} which already holds {} bytes of earlier predictions",
                    path.display(),
                    existing
                );
            }

            options.append(true)
        }
        PredictionsMode::Truncate => options.write(true).truncate(true),
    };

    let mut out = BufWriter::new(options.open(path)?);
    let mut rows = 0;

    for batch in data.batches(batch_size, Order::Sequential) {
        let probs = network.predict(&batch.images).map(f32::exp);

        for col in probs.column_iter() {
            let line = col
                .iter()
                .map(|p| format!("{:.18e}", p))
                .collect::<Vec<_>>()
                .join(" ");

            writeln!(out, "{}", line)?;
            rows += 1;
        }
    }

    out.flush()?;

    tracing::info!("Wrote {} prediction rows to {}", rows, path.display());

    Ok(rows)
}
