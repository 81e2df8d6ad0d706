use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use byteorder::{BigEndian, ReadBytesExt};
use nalgebra::DMatrix;
use permutation_iterator::Permutor;

use crate::{
    config::Normalization,
    error::{Error, Result},
};

pub const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
pub const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
pub const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
pub const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

pub const CLASS_NAMES: [&str; 10] = [
    "T-shirt/top",
    "Trouser",
    "Pullover",
    "Dress",
    "Coat",
    "Sandal",
    "Shirt",
    "Sneaker",
    "Bag",
    "Ankle boot",
];

pub fn class_name(label: u8) -> &'static str {
    CLASS_NAMES.get(label as usize).copied().unwrap_or("?")
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum DataType {
    UnsignedByte,
    SignedByte,
    Short,
    Int,
    Float,
    Double,
    Unknown,
}

impl From<u32> for DataType {
    fn from(v: u32) -> Self {
        match (v >> 8) & 0xFF {
            0x08 => Self::UnsignedByte,
            0x09 => Self::SignedByte,
            0x0B => Self::Short,
            0x0C => Self::Int,
            0x0D => Self::Float,
            0x0E => Self::Double,
            _ => Self::Unknown,
        }
    }
}

fn read_header(src: &mut impl Read, dims: u32) -> Result<Vec<usize>> {
    let magic = src.read_u32::<BigEndian>()?;

    let data_type = DataType::from(magic);
    let data_dims = magic & 0xFF;

    if magic >> 16 != 0 || data_type != DataType::UnsignedByte {
        return Err(Error::Idx(format!(
            "expected unsigned byte payload, found {:?} (magic {:#010x})",
            data_type, magic
        )));
    }

    if data_dims != dims {
        return Err(Error::Idx(format!(
            "expected {} dimensions, found {}",
            dims, data_dims
        )));
    }

    (0..dims)
        .map(|_| Ok(src.read_u32::<BigEndian>()? as usize))
        .collect()
}

fn read_payload(src: &mut impl Read, len: usize) -> Result<Vec<u8>> {
    let mut data = vec![0; len];

    src.read_exact(&mut data)
        .map_err(|e| Error::Idx(format!("payload of {} bytes: {}", len, e)))?;

    Ok(data)
}

#[derive(Debug)]
struct RawImages {
    dims: (usize, usize),
    data: Vec<u8>,
}

impl RawImages {
    pub fn parse(src: &mut impl Read) -> Result<Self> {
        let header = read_header(src, 3)?;
        let (count, d1, d2) = (header[0], header[1], header[2]);

        Ok(RawImages {
            dims: (d1, d2),
            data: read_payload(src, count * d1 * d2)?,
        })
    }

    fn count(&self) -> usize {
        self.data.len() / (self.dims.0 * self.dims.1).max(1)
    }
}

#[derive(Debug)]
struct RawLabels(Vec<u8>);

impl RawLabels {
    pub fn parse(src: &mut impl Read) -> Result<Self> {
        let header = read_header(src, 1)?;

        Ok(RawLabels(read_payload(src, header[0])?))
    }
}

/// One split of the corpus: a column per normalized image plus its label.
#[derive(Clone, Debug)]
pub struct DataSet {
    pub height: usize,
    pub width: usize,
    pub images: DMatrix<f32>,
    pub labels: Vec<u8>,
}

/// Images of a batch stored one per column, with matching labels.
#[derive(Clone, Debug)]
pub struct Batch {
    pub images: DMatrix<f32>,
    pub labels: Vec<u8>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Sequential,
    /// A fresh permutation for each key.
    Shuffled(u64),
}

impl DataSet {
    fn from_raw_parts(
        images: RawImages,
        labels: RawLabels,
        classes: usize,
        norm: &Normalization,
    ) -> Result<Self> {
        let count = images.count();

        if count != labels.0.len() {
            return Err(Error::Idx(format!(
                "{} images but {} labels",
                count,
                labels.0.len()
            )));
        }

        if let Some(bad) = labels.0.iter().find(|&&l| l as usize >= classes) {
            return Err(Error::Idx(format!("label {} out of range", bad)));
        }

        let im_size = images.dims.0 * images.dims.1;

        Ok(Self {
            height: images.dims.0,
            width: images.dims.1,
            images: DMatrix::from_iterator(
                im_size,
                count,
                images
                    .data
                    .into_iter()
                    .map(|v| norm.apply(v as f32 / 255.0)),
            ),
            labels: labels.0,
        })
    }

    pub fn parse(
        images: &mut impl Read,
        labels: &mut impl Read,
        classes: usize,
        norm: &Normalization,
    ) -> Result<Self> {
        let images = RawImages::parse(images)?;
        let labels = RawLabels::parse(labels)?;

        Self::from_raw_parts(images, labels, classes, norm)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Gathers the given samples into a batch.
    pub fn gather(&self, indices: &[usize]) -> Batch {
        Batch {
            images: self.images.select_columns(indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    pub fn batches(&self, batch_size: usize, order: Order) -> Batches<'_> {
        let order: Vec<usize> = match order {
            Order::Sequential => (0..self.len()).collect(),
            Order::Shuffled(_) if self.is_empty() => Vec::new(),
            Order::Shuffled(key) => Permutor::new_with_u64_key(self.len() as u64, key)
                .map(|i| i as usize)
                .collect(),
        };

        Batches {
            data: self,
            order,
            batch_size: batch_size.max(1),
            pos: 0,
        }
    }

    pub fn batch_count(&self, batch_size: usize) -> usize {
        (self.len() + batch_size - 1) / batch_size
    }
}

/// Lazily materialized batches over a split.
pub struct Batches<'a> {
    data: &'a DataSet,
    order: Vec<usize>,
    batch_size: usize,
    pos: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.pos >= self.order.len() {
            return None;
        }

        let end = (self.pos + self.batch_size).min(self.order.len());
        let batch = self.data.gather(&self.order[self.pos..end]);

        self.pos = end;

        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.pos + self.batch_size - 1) / self.batch_size;

        (left, Some(left))
    }
}

impl ExactSizeIterator for Batches<'_> {}

#[derive(Debug)]
pub struct FashionMNIST {
    pub training: DataSet,
    pub test: DataSet,
}

fn open(dir: &Path, name: &str) -> Result<BufReader<File>> {
    let path = dir.join(name);

    match File::open(&path) {
        Ok(file) => Ok(BufReader::new(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::MissingDataset(path)),
        Err(e) => Err(e.into()),
    }
}

impl FashionMNIST {
    pub fn parse(dir: &Path, classes: usize, norm: &Normalization) -> Result<Self> {
        let training = DataSet::parse(
            &mut open(dir, TRAIN_IMAGES)?,
            &mut open(dir, TRAIN_LABELS)?,
            classes,
            norm,
        )?;
        let test = DataSet::parse(
            &mut open(dir, TEST_IMAGES)?,
            &mut open(dir, TEST_LABELS)?,
            classes,
            norm,
        )?;

        Ok(Self { training, test })
    }

    pub fn missing_files(dir: &Path) -> Vec<PathBuf> {
        [TRAIN_IMAGES, TRAIN_LABELS, TEST_IMAGES, TEST_LABELS]
            .iter()
            .map(|name| dir.join(name))
            .filter(|path| !path.is_file())
            .collect()
    }

    /// Loads the corpus from `dir`, fetching it first when files are absent.
    pub fn load_or_fetch(dir: &Path, classes: usize, norm: &Normalization) -> Result<Self> {
        let missing = Self::missing_files(dir);

        if !missing.is_empty() {
            tracing::info!("{} dataset files missing in {}", missing.len(), dir.display());
            fetch(dir, missing)?;
        }

        Self::parse(dir, classes, norm)
    }
}

#[cfg(feature = "download")]
fn fetch(dir: &Path, _missing: Vec<PathBuf>) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let base = dir
        .to_str()
        .ok_or_else(|| Error::Download(format!("non utf-8 path {}", dir.display())))?;
    let base = format!("{}/", base.trim_end_matches('/'));

    tracing::info!("Downloading Fashion-MNIST into {}", base);

    // The builder loads the files after extracting them; only the files on disk are kept.
    std::panic::catch_unwind(|| {
        ::mnist::MnistBuilder::new()
            .base_path(&base)
            .use_fashion_data()
            .download_and_extract()
            .finalize();
    })
    .map_err(|_| Error::Download(format!("could not fetch Fashion-MNIST into {}", base)))
}

#[cfg(not(feature = "download"))]
fn fetch(_dir: &Path, mut missing: Vec<PathBuf>) -> Result<()> {
    Err(Error::MissingDataset(missing.swap_remove(0)))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use byteorder::WriteBytesExt;

    use super::*;

    pub(crate) fn idx_images(count: usize, h: usize, w: usize, pixel: impl Fn(usize) -> u8) -> Vec<u8> {
        let mut buf = Vec::new();

        buf.write_u32::<BigEndian>(0x0803).unwrap();
        for d in [count, h, w] {
            buf.write_u32::<BigEndian>(d as u32).unwrap();
        }
        buf.extend((0..count * h * w).map(pixel));

        buf
    }

    pub(crate) fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();

        buf.write_u32::<BigEndian>(0x0801).unwrap();
        buf.write_u32::<BigEndian>(labels.len() as u32).unwrap();
        buf.extend_from_slice(labels);

        buf
    }

    fn parse(images: Vec<u8>, labels: Vec<u8>) -> Result<DataSet> {
        DataSet::parse(
            &mut Cursor::new(images),
            &mut Cursor::new(labels),
            10,
            &Normalization::default(),
        )
    }

    #[test]
    fn parses_and_normalizes() {
        let data = parse(
            idx_images(3, 2, 2, |i| if i == 0 { 255 } else { 0 }),
            idx_labels(&[1, 2, 9]),
        )
        .unwrap();

        assert_eq!(data.len(), 3);
        assert_eq!(data.images.shape(), (4, 3));
        assert_eq!((data.height, data.width), (2, 2));
        approx::assert_relative_eq!(data.images[(0, 0)], (1.0 - 0.1307) / 0.3081, epsilon = 1e-5);
        approx::assert_relative_eq!(data.images[(1, 0)], -0.1307 / 0.3081, epsilon = 1e-5);
        assert_eq!(data.labels, vec![1, 2, 9]);
    }

    #[test]
    fn rejects_wrong_rank_and_type() {
        assert!(matches!(
            parse(idx_labels(&[0, 1]), idx_labels(&[0, 1])),
            Err(Error::Idx(_))
        ));

        let mut floats = idx_images(1, 1, 1, |_| 0);
        floats[2] = 0x0D;
        assert!(matches!(parse(floats, idx_labels(&[0])), Err(Error::Idx(_))));
    }

    #[test]
    fn rejects_truncated_and_mismatched_files() {
        let mut short = idx_images(2, 2, 2, |_| 0);
        short.truncate(short.len() - 1);
        assert!(matches!(parse(short, idx_labels(&[0, 1])), Err(Error::Idx(_))));

        assert!(matches!(
            parse(idx_images(2, 2, 2, |_| 0), idx_labels(&[0])),
            Err(Error::Idx(_))
        ));
        assert!(matches!(
            parse(idx_images(1, 2, 2, |_| 0), idx_labels(&[10])),
            Err(Error::Idx(_))
        ));
    }

    #[test]
    fn sequential_batches_keep_order_and_short_tail() {
        let labels: Vec<u8> = (0..10).map(|i| i % 10).collect();
        let data = parse(idx_images(10, 1, 1, |i| i as u8), idx_labels(&labels)).unwrap();

        let batches: Vec<_> = data.batches(4, Order::Sequential).collect();

        assert_eq!(data.batch_count(4), 3);
        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert_eq!(batches[0].labels, vec![0, 1, 2, 3]);
        assert_eq!(batches[2].labels, vec![8, 9]);
        assert_eq!(batches[1].images.shape(), (1, 4));
    }

    #[test]
    fn shuffled_batches_are_a_permutation() {
        let labels: Vec<u8> = (0..50).map(|i| i % 10).collect();
        let data = parse(idx_images(50, 1, 1, |i| i as u8), idx_labels(&labels)).unwrap();

        let mut seen: Vec<u8> = data
            .batches(8, Order::Shuffled(7))
            .flat_map(|b| b.labels)
            .collect();
        let again: Vec<u8> = data
            .batches(8, Order::Shuffled(7))
            .flat_map(|b| b.labels)
            .collect();

        assert_eq!(seen, again);

        seen.sort_unstable();
        let mut expected = labels.clone();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(FashionMNIST::missing_files(dir.path()).len(), 4);

        #[cfg(not(feature = "download"))]
        assert!(matches!(
            FashionMNIST::load_or_fetch(dir.path(), 10, &Normalization::default()),
            Err(Error::MissingDataset(_))
        ));
    }

    #[test]
    fn loads_from_directory() {
        let dir = tempfile::tempdir().unwrap();

        std::fs::write(dir.path().join(TRAIN_IMAGES), idx_images(6, 2, 2, |_| 10)).unwrap();
        std::fs::write(dir.path().join(TRAIN_LABELS), idx_labels(&[0, 1, 2, 3, 4, 5])).unwrap();
        std::fs::write(dir.path().join(TEST_IMAGES), idx_images(2, 2, 2, |_| 20)).unwrap();
        std::fs::write(dir.path().join(TEST_LABELS), idx_labels(&[6, 7])).unwrap();

        let data = FashionMNIST::load_or_fetch(dir.path(), 10, &Normalization::default()).unwrap();

        assert_eq!(data.training.len(), 6);
        assert_eq!(data.test.len(), 2);
        assert_eq!(class_name(data.test.labels[1]), "Sneaker");
    }
}
