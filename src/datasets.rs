//! Dataset loading
//!
//! Reads MNIST (IDX files) and CIFAR-10 (binary batches) from a data directory, and generates
//! small two dimensional classification sets for quick runs without any files.

use std::{
    f32::consts::PI,
    fmt::{self, Display},
    fs, io,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::tensor::Matrix;

const MNIST_IMAGE_MAGIC: u32 = 2051;
const MNIST_LABEL_MAGIC: u32 = 2049;
const CIFAR_RECORD_LEN: usize = 1 + 3072;
const CIFAR_DIR: &str = "cifar-10-batches-bin";

/// Errors while reading a dataset
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: expected magic number {expected}, found {found}", path.display())]
    BadMagic {
        path: PathBuf,
        expected: u32,
        found: u32,
    },
    #[error("{}: file is truncated", path.display())]
    Truncated { path: PathBuf },
    #[error("{images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },
    #[error("{}: label {label} is not below {n_classes}", path.display())]
    LabelOutOfRange {
        path: PathBuf,
        label: usize,
        n_classes: usize,
    },
}

/// Toggles between dataset types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Mnist,
    Cifar10,
    Line,
    Circle,
    XOR,
    Moon,
}

impl DatasetKind {
    pub fn n_classes(&self) -> usize {
        match self {
            DatasetKind::Mnist | DatasetKind::Cifar10 => 10,
            DatasetKind::Line | DatasetKind::Circle | DatasetKind::XOR | DatasetKind::Moon => 2,
        }
    }
}

impl Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetKind::Mnist => write!(f, "mnist"),
            DatasetKind::Cifar10 => write!(f, "cifar10"),
            DatasetKind::Line => write!(f, "line"),
            DatasetKind::Circle => write!(f, "circle"),
            DatasetKind::XOR => write!(f, "xor"),
            DatasetKind::Moon => write!(f, "moon"),
        }
    }
}

/// Features (one example per row) and their class labels
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub features: Matrix,
    pub labels: Vec<usize>,
}

impl Split {
    fn from_points(points: Vec<Vec<f32>>, labels: Vec<usize>) -> Self {
        let features = Matrix::from_rows(&points).unwrap_or_else(|| Matrix::zeros(0, 2));
        Self { features, labels }
    }
}

/// Train and test splits with their class count
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub train: Split,
    pub test: Split,
    pub n_classes: usize,
}

/// Loads a dataset. Files are read from `data_dir`, synthetic sets use `class_size` and `seed`.
pub fn load_dataset(
    kind: DatasetKind,
    data_dir: &Path,
    class_size: usize,
    seed: u64,
) -> Result<Dataset, DatasetError> {
    let dataset = match kind {
        DatasetKind::Mnist => load_mnist(data_dir)?,
        DatasetKind::Cifar10 => load_cifar10(data_dir)?,
        synthetic => {
            let test_size = (class_size / 4).max(1);
            Dataset {
                train: generate(synthetic, class_size, seed),
                test: generate(synthetic, test_size, seed.wrapping_add(1)),
                n_classes: synthetic.n_classes(),
            }
        }
    };
    log::info!(
        "loaded {}: {} train / {} test examples, {} features, {} classes",
        kind,
        dataset.train.labels.len(),
        dataset.test.labels.len(),
        dataset.train.features.cols(),
        dataset.n_classes
    );
    Ok(dataset)
}

fn read(path: &Path) -> Result<Vec<u8>, DatasetError> {
    log::debug!("reading {}", path.display());
    fs::read(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn be_u32(bytes: &[u8], offset: usize, path: &Path) -> Result<u32, DatasetError> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| DatasetError::Truncated {
            path: path.to_path_buf(),
        })
}

fn check_magic(bytes: &[u8], expected: u32, path: &Path) -> Result<(), DatasetError> {
    let found = be_u32(bytes, 0, path)?;
    if found != expected {
        return Err(DatasetError::BadMagic {
            path: path.to_path_buf(),
            expected,
            found,
        });
    }
    Ok(())
}

fn read_idx_images(path: &Path) -> Result<Matrix, DatasetError> {
    let bytes = read(path)?;
    check_magic(&bytes, MNIST_IMAGE_MAGIC, path)?;
    let n = be_u32(&bytes, 4, path)? as usize;
    let rows = be_u32(&bytes, 8, path)? as usize;
    let cols = be_u32(&bytes, 12, path)? as usize;
    let truncated = || DatasetError::Truncated {
        path: path.to_path_buf(),
    };
    // header sizes are untrusted
    let n_pixels = rows.checked_mul(cols).ok_or_else(truncated)?;
    let end = n
        .checked_mul(n_pixels)
        .and_then(|len| len.checked_add(16))
        .ok_or_else(truncated)?;
    let pixels = bytes.get(16..end).ok_or_else(truncated)?;
    let data = pixels.iter().map(|&p| p as f32 / 255.0).collect();
    Matrix::from_vec(n, n_pixels, data).ok_or_else(truncated)
}

fn read_idx_labels(path: &Path, n_classes: usize) -> Result<Vec<usize>, DatasetError> {
    let bytes = read(path)?;
    check_magic(&bytes, MNIST_LABEL_MAGIC, path)?;
    let n = be_u32(&bytes, 4, path)? as usize;
    let labels = bytes
        .get(8..n.saturating_add(8))
        .ok_or_else(|| DatasetError::Truncated {
            path: path.to_path_buf(),
        })?;
    labels
        .iter()
        .map(|&l| check_label(l as usize, n_classes, path))
        .collect()
}

fn check_label(label: usize, n_classes: usize, path: &Path) -> Result<usize, DatasetError> {
    if label >= n_classes {
        return Err(DatasetError::LabelOutOfRange {
            path: path.to_path_buf(),
            label,
            n_classes,
        });
    }
    Ok(label)
}

fn mnist_split(data_dir: &Path, prefix: &str) -> Result<Split, DatasetError> {
    let n_classes = DatasetKind::Mnist.n_classes();
    let features = read_idx_images(&data_dir.join(format!("{prefix}-images-idx3-ubyte")))?;
    let labels = read_idx_labels(
        &data_dir.join(format!("{prefix}-labels-idx1-ubyte")),
        n_classes,
    )?;
    if features.rows() != labels.len() {
        return Err(DatasetError::CountMismatch {
            images: features.rows(),
            labels: labels.len(),
        });
    }
    Ok(Split { features, labels })
}

/// Loads MNIST from the four uncompressed IDX files in `data_dir`, pixels scaled to [0, 1]
pub fn load_mnist(data_dir: &Path) -> Result<Dataset, DatasetError> {
    Ok(Dataset {
        train: mnist_split(data_dir, "train")?,
        test: mnist_split(data_dir, "t10k")?,
        n_classes: DatasetKind::Mnist.n_classes(),
    })
}

fn read_cifar_batches(paths: &[PathBuf]) -> Result<Split, DatasetError> {
    let n_classes = DatasetKind::Cifar10.n_classes();
    let mut data = Vec::new();
    let mut labels = Vec::new();
    for path in paths {
        let bytes = read(path)?;
        if bytes.is_empty() || bytes.len() % CIFAR_RECORD_LEN != 0 {
            return Err(DatasetError::Truncated { path: path.clone() });
        }
        for record in bytes.chunks_exact(CIFAR_RECORD_LEN) {
            labels.push(check_label(record[0] as usize, n_classes, path)?);
            data.extend(record[1..].iter().map(|&p| p as f32 / 255.0));
        }
    }
    let n = labels.len();
    let features = Matrix::from_vec(n, CIFAR_RECORD_LEN - 1, data).ok_or(
        DatasetError::CountMismatch {
            images: n,
            labels: n,
        },
    )?;
    Ok(Split { features, labels })
}

/// Loads the CIFAR-10 binary batches from `<data_dir>/cifar-10-batches-bin` (or `data_dir`
/// itself when that directory does not exist), pixels scaled to [0, 1]
pub fn load_cifar10(data_dir: &Path) -> Result<Dataset, DatasetError> {
    let nested = data_dir.join(CIFAR_DIR);
    let dir = if nested.is_dir() { nested } else { data_dir.to_path_buf() };
    let train_paths: Vec<PathBuf> = (1..=5)
        .map(|i| dir.join(format!("data_batch_{i}.bin")))
        .collect();
    Ok(Dataset {
        train: read_cifar_batches(&train_paths)?,
        test: read_cifar_batches(&[dir.join("test_batch.bin")])?,
        n_classes: DatasetKind::Cifar10.n_classes(),
    })
}

/// Generates one split of a synthetic set
pub fn generate(kind: DatasetKind, class_size: usize, seed: u64) -> Split {
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let (points, labels) = match kind {
        DatasetKind::Line => gen_linear_data(class_size, &mut rng),
        DatasetKind::Circle => gen_circle_data(class_size, &mut rng),
        DatasetKind::Moon => gen_moon_data(class_size, &mut rng),
        // file backed kinds never reach here, `load_dataset` reads them from disk
        DatasetKind::XOR | DatasetKind::Mnist | DatasetKind::Cifar10 => {
            gen_xor_data(class_size, &mut rng)
        }
    };
    Split::from_points(points, labels)
}

/// Generates a simple linearly separable dataset
pub fn gen_linear_data<R: Rng>(class_size: usize, rng: &mut R) -> (Vec<Vec<f32>>, Vec<usize>) {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..class_size {
        let x = rng.random_range(-5.0..5.0);
        let y = rng.random_range(-5.0..5.0);
        data.push(vec![x, y]);
        labels.push(if x > y { 0 } else { 1 });
    }

    (data, labels)
}

/// Generates a binary classification dataset of two concentric circles
pub fn gen_circle_data<R: Rng>(class_size: usize, rng: &mut R) -> (Vec<Vec<f32>>, Vec<usize>) {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for (label, radius) in [(0, 3.0f32), (1, 5.0f32)] {
        for _ in 0..class_size {
            let angle = rng.random_range(0.0..2.0 * PI);
            let radius_delta = radius * rng.random_range(-0.25..0.25);
            data.push(vec![
                (radius + radius_delta) * angle.cos(),
                (radius + radius_delta) * angle.sin(),
            ]);
            labels.push(label);
        }
    }

    (data, labels)
}

pub fn gen_xor_data<R: Rng>(class_size: usize, rng: &mut R) -> (Vec<Vec<f32>>, Vec<usize>) {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..class_size {
        let x: f32 = rng.random_range(-5.0..5.0);
        let y: f32 = rng.random_range(-5.0..5.0);
        data.push(vec![x, y]);
        labels.push(if x > 0.0 && y > 0.0 || x < 0.0 && y < 0.0 { 0 } else { 1 });
    }

    (data, labels)
}

/// Generates a moons dataset (two interleaving partial circles) for binary classification
pub fn gen_moon_data<R: Rng>(class_size: usize, rng: &mut R) -> (Vec<Vec<f32>>, Vec<usize>) {
    let mut data = Vec::new();
    let mut labels = Vec::new();
    let radius = 3.0;

    for (label, sign, dx, dy) in [(0, 1.0f32, 0.0f32, 0.0f32), (1, -1.0, 2.0, -0.2)] {
        for _ in 0..class_size {
            let theta: f32 = rng.random_range(PI * -1.0 / 4.0..PI * 5.0 / 4.0);
            let x = radius * theta.cos() + dx;
            let y = sign * radius * theta.sin() + dy;
            let noise_x: f32 = rng.random_range(-0.1..0.1);
            let noise_y: f32 = rng.random_range(-0.1..0.1);
            data.push(vec![x + noise_x, y + noise_y]);
            labels.push(label);
        }
    }

    (data, labels)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Fresh directory under the system temp dir
    pub(crate) fn temp_dir(name: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "experiment-runner-{}-{}-{}",
            name,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn idx_images(n: usize, side: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in [MNIST_IMAGE_MAGIC, n as u32, side as u32, side as u32] {
            bytes.extend(v.to_be_bytes());
        }
        bytes.extend((0..n * side * side).map(|i| (i % 256) as u8));
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(MNIST_LABEL_MAGIC.to_be_bytes());
        bytes.extend((labels.len() as u32).to_be_bytes());
        bytes.extend(labels);
        bytes
    }

    /// Writes a tiny MNIST in IDX format where each image's label is its index mod 10
    pub(crate) fn write_mnist(dir: &Path, n_train: usize, n_test: usize) {
        for (prefix, n) in [("train", n_train), ("t10k", n_test)] {
            let labels: Vec<u8> = (0..n).map(|i| (i % 10) as u8).collect();
            fs::write(dir.join(format!("{prefix}-images-idx3-ubyte")), idx_images(n, 4)).unwrap();
            fs::write(
                dir.join(format!("{prefix}-labels-idx1-ubyte")),
                idx_labels(&labels),
            )
            .unwrap();
        }
    }

    fn cifar_records(labels: &[u8]) -> Vec<u8> {
        labels
            .iter()
            .flat_map(|&l| std::iter::once(l).chain(std::iter::repeat_n(255, 3072)))
            .collect()
    }

    #[test]
    fn test_load_mnist() {
        let dir = temp_dir("mnist");
        write_mnist(&dir, 12, 5);
        let dataset = load_dataset(DatasetKind::Mnist, &dir, 0, 0).unwrap();
        assert_eq!(dataset.n_classes, 10);
        assert_eq!(dataset.train.features.rows(), 12);
        assert_eq!(dataset.train.features.cols(), 16);
        assert_eq!(dataset.test.labels, vec![0, 1, 2, 3, 4]);
        assert_eq!(dataset.train.features.get(0, 1), 1.0 / 255.0);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_mnist_errors() {
        let dir = temp_dir("mnist-missing");
        assert!(matches!(
            load_mnist(&dir),
            Err(DatasetError::Io { path, .. }) if path.ends_with("train-images-idx3-ubyte")
        ));

        write_mnist(&dir, 3, 3);
        fs::write(dir.join("train-labels-idx1-ubyte"), idx_images(3, 4)).unwrap();
        assert!(matches!(
            load_mnist(&dir),
            Err(DatasetError::BadMagic {
                expected: MNIST_LABEL_MAGIC,
                found: MNIST_IMAGE_MAGIC,
                ..
            })
        ));

        fs::write(dir.join("train-labels-idx1-ubyte"), idx_labels(&[1, 2])).unwrap();
        assert!(matches!(
            load_mnist(&dir),
            Err(DatasetError::CountMismatch {
                images: 3,
                labels: 2
            })
        ));

        let mut truncated = idx_images(3, 4);
        truncated.truncate(20);
        fs::write(dir.join("train-images-idx3-ubyte"), truncated).unwrap();
        assert!(matches!(
            load_mnist(&dir),
            Err(DatasetError::Truncated { .. })
        ));

        let oversized: Vec<u8> = [MNIST_IMAGE_MAGIC, u32::MAX, u32::MAX, u32::MAX]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();
        fs::write(dir.join("train-images-idx3-ubyte"), oversized).unwrap();
        assert!(matches!(
            load_mnist(&dir),
            Err(DatasetError::Truncated { path }) if path.ends_with("train-images-idx3-ubyte")
        ));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_load_cifar10() {
        let dir = temp_dir("cifar");
        let nested = dir.join(CIFAR_DIR);
        fs::create_dir_all(&nested).unwrap();
        for i in 1..=5 {
            fs::write(nested.join(format!("data_batch_{i}.bin")), cifar_records(&[i, 0])).unwrap();
        }
        fs::write(nested.join("test_batch.bin"), cifar_records(&[9])).unwrap();

        let dataset = load_dataset(DatasetKind::Cifar10, &dir, 0, 0).unwrap();
        assert_eq!(dataset.train.labels, vec![1, 0, 2, 0, 3, 0, 4, 0, 5, 0]);
        assert_eq!(dataset.train.features.cols(), 3072);
        assert_eq!(dataset.test.labels, vec![9]);
        assert_eq!(dataset.test.features.get(0, 3071), 1.0);

        let mut bad = cifar_records(&[12]);
        fs::write(nested.join("test_batch.bin"), &bad).unwrap();
        assert!(matches!(
            load_cifar10(&dir),
            Err(DatasetError::LabelOutOfRange { label: 12, .. })
        ));
        bad.pop();
        fs::write(nested.join("test_batch.bin"), &bad).unwrap();
        assert!(matches!(
            load_cifar10(&dir),
            Err(DatasetError::Truncated { .. })
        ));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_synthetic_is_seeded() {
        for kind in [
            DatasetKind::Line,
            DatasetKind::Circle,
            DatasetKind::XOR,
            DatasetKind::Moon,
        ] {
            let a = load_dataset(kind, Path::new("unused"), 40, 3).unwrap();
            let b = load_dataset(kind, Path::new("unused"), 40, 3).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.n_classes, 2);
            assert_eq!(a.train.features.cols(), 2);
            assert_eq!(a.test.labels.len() * 4, a.train.labels.len());
            assert!(a.train.labels.iter().all(|&l| l < 2));
        }
    }
}
