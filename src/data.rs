//! In-memory classification datasets and batch iteration.

// class index fits in u32
#![allow(clippy::cast_possible_truncation)]

use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{LoraError, Result};
use crate::init;

/// Features of shape `(n, num_features)` (`f32`) with one `u32` class index
/// per row.
#[derive(Debug, Clone)]
pub struct Dataset {
    features: Tensor,
    labels: Tensor,
}

impl Dataset {
    /// Build a dataset, converting features to `f32` and labels to `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`LoraError::Dataset`] if the dataset is empty, features are
    /// not 2-D, or labels are not one per row.
    pub fn new(features: Tensor, labels: Tensor) -> Result<Self> {
        let n = match *features.dims() {
            [n, _] => n,
            _ => {
                return Err(LoraError::Dataset(format!(
                    "features must be (n, num_features), got {:?}",
                    features.dims()
                )))
            }
        };
        if n == 0 {
            return Err(LoraError::Dataset("dataset is empty".into()));
        }
        if labels.dims() != [n] {
            return Err(LoraError::Dataset(format!(
                "expected {n} labels, got shape {:?}",
                labels.dims()
            )));
        }
        Ok(Self {
            features: features.to_dtype(DType::F32)?,
            labels: labels.to_dtype(DType::U32)?,
        })
    }

    /// Flatten `(n, ...)` images into `(n, prod(...))` feature rows.
    ///
    /// # Errors
    ///
    /// Returns an error if `images` has no batch dimension.
    pub fn flatten_images(images: &Tensor) -> Result<Tensor> {
        if images.rank() < 2 {
            return Err(LoraError::Dataset(format!(
                "images must be (n, ...), got {:?}",
                images.dims()
            )));
        }
        Ok(images.flatten_from(1)?)
    }

    /// A learnable synthetic set: one `N(0, 1)` prototype per class, each
    /// example its class prototype plus `N(0, noise²)` noise. Classes cycle
    /// `0, 1, …, num_classes - 1, 0, …`.
    ///
    /// # Errors
    ///
    /// Returns an error if any size is zero or `noise` is negative.
    pub fn synthetic<R: Rng + ?Sized>(
        n: usize,
        num_features: usize,
        num_classes: usize,
        noise: f64,
        rng: &mut R,
        device: &Device,
    ) -> Result<Self> {
        if n == 0 || num_features == 0 || num_classes == 0 {
            return Err(LoraError::Dataset(format!(
                "synthetic sizes must be > 0, got n={n} features={num_features} \
                 classes={num_classes}"
            )));
        }
        let prototypes = init::randn((num_classes, num_features), 1.0, rng, device)?;
        let labels: Vec<u32> = (0..n).map(|i| (i % num_classes) as u32).collect();
        let labels = Tensor::from_vec(labels, n, device)?;
        let noise = init::randn((n, num_features), noise, rng, device)?;
        let features = prototypes.index_select(&labels, 0)?.add(&noise)?;
        Self::new(features, labels)
    }

    /// Number of examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    /// Always `false`: empty datasets are rejected at construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Width of a feature row.
    #[must_use]
    pub fn num_features(&self) -> usize {
        self.features.dims()[1]
    }

    /// Feature matrix `(n, num_features)`.
    #[must_use]
    pub fn features(&self) -> &Tensor {
        &self.features
    }

    /// Class indices `(n,)`.
    #[must_use]
    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    /// Iterate over `(features, labels)` batches of at most `batch_size`
    /// rows. Every example appears in exactly one batch; the order is the
    /// dataset order unless `shuffle` supplies a generator.
    ///
    /// # Errors
    ///
    /// Returns [`LoraError::InvalidConfig`] if `batch_size` is zero.
    pub fn iterate_batches<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        shuffle: Option<&mut R>,
    ) -> Result<Batches<'_>> {
        if batch_size == 0 {
            return Err(LoraError::InvalidConfig("batch size must be > 0".into()));
        }
        let order = shuffle.map(|rng| {
            let mut order: Vec<u32> = (0..self.len() as u32).collect();
            order.shuffle(rng);
            order
        });
        Ok(Batches {
            dataset: self,
            order,
            batch_size,
            pos: 0,
        })
    }

    /// [`Dataset::iterate_batches`] in dataset order.
    ///
    /// # Errors
    ///
    /// Returns [`LoraError::InvalidConfig`] if `batch_size` is zero.
    pub fn batches(&self, batch_size: usize) -> Result<Batches<'_>> {
        self.iterate_batches::<rand::rngs::StdRng>(batch_size, None)
    }
}

/// Iterator over the batches of a [`Dataset`].
#[derive(Debug)]
pub struct Batches<'a> {
    dataset: &'a Dataset,
    order: Option<Vec<u32>>,
    batch_size: usize,
    pos: usize,
}

impl Batches<'_> {
    /// Total number of batches, including a final partial one.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn batch_at(&self, start: usize, len: usize) -> Result<(Tensor, Tensor)> {
        let ds = self.dataset;
        match &self.order {
            None => Ok((
                ds.features.narrow(0, start, len)?,
                ds.labels.narrow(0, start, len)?,
            )),
            Some(order) => {
                let rows = &order[start..start + len];
                let idx = Tensor::from_slice(rows, len, ds.features.device())?;
                Ok((
                    ds.features.index_select(&idx, 0)?,
                    ds.labels.index_select(&idx, 0)?,
                ))
            }
        }
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.dataset.len();
        if self.pos >= n {
            return None;
        }
        let len = self.batch_size.min(n - self.pos);
        let batch = self.batch_at(self.pos, len);
        self.pos += len;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.dataset.len().saturating_sub(self.pos).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

/// Load the MNIST train and test splits from a directory holding the four
/// uncompressed IDX files (`train-images-idx3-ubyte`, …).
///
/// # Errors
///
/// Returns [`LoraError::Dataset`] if the files cannot be read.
#[cfg(feature = "mnist")]
pub fn load_mnist<P: AsRef<std::path::Path>>(dir: P) -> Result<(Dataset, Dataset)> {
    let mnist = candle_datasets::vision::mnist::load_dir(dir)
        .map_err(|e| LoraError::Dataset(format!("failed to load MNIST: {e}")))?;
    let train = Dataset::new(
        Dataset::flatten_images(&mnist.train_images)?,
        mnist.train_labels,
    )?;
    let test = Dataset::new(
        Dataset::flatten_images(&mnist.test_images)?,
        mnist.test_labels,
    )?;
    Ok((train, test))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn toy(n: usize) -> Dataset {
        let device = Device::Cpu;
        let features: Vec<f32> = (0..n * 2).map(|v| v as f32).collect();
        let labels: Vec<u32> = (0..n as u32).collect();
        Dataset::new(
            Tensor::from_vec(features, (n, 2), &device).unwrap(),
            Tensor::from_vec(labels, n, &device).unwrap(),
        )
        .unwrap()
    }

    fn collect_labels(batches: Batches<'_>) -> Vec<Vec<u32>> {
        batches
            .map(|b| b.unwrap().1.to_vec1::<u32>().unwrap())
            .collect()
    }

    #[test]
    fn test_batches_in_order_with_partial_tail() -> Result<()> {
        let ds = toy(10);
        let batches = ds.batches(4)?;
        assert_eq!(batches.num_batches(), 3);
        assert_eq!(batches.size_hint(), (3, Some(3)));
        assert_eq!(
            collect_labels(batches),
            vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]
        );
        Ok(())
    }

    #[test]
    fn test_batches_step_through_mutable_borrow() -> Result<()> {
        let ds = toy(7);
        let mut batches = ds.batches(3)?;
        let (features, labels) = batches.next().unwrap()?;
        assert_eq!(features.dims(), &[3, 2]);
        assert_eq!(labels.to_vec1::<u32>()?, vec![0, 1, 2]);
        assert_eq!(batches.size_hint(), (2, Some(2)));
        assert_eq!(batches.by_ref().count(), 2);
        assert!(batches.next().is_none());
        Ok(())
    }

    #[test]
    fn test_shuffled_batches_cover_each_example_once() -> Result<()> {
        let ds = toy(17);
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen: Vec<u32> = collect_labels(ds.iterate_batches(5, Some(&mut rng))?)
            .into_iter()
            .flatten()
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..17).collect::<Vec<u32>>());
        Ok(())
    }

    #[test]
    fn test_batch_rows_stay_paired() -> Result<()> {
        let ds = toy(6);
        let mut rng = StdRng::seed_from_u64(1);
        for batch in ds.iterate_batches(4, Some(&mut rng))? {
            let (features, labels) = batch?;
            let features: Vec<Vec<f32>> = features.to_vec2()?;
            for (row, label) in features.iter().zip(labels.to_vec1::<u32>()?) {
                assert_eq!(row[0], (2 * label) as f32);
            }
        }
        Ok(())
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(toy(3).batches(0).is_err());
    }

    #[test]
    fn test_label_count_mismatch() {
        let device = Device::Cpu;
        let features = Tensor::zeros((4, 3), DType::F32, &device).unwrap();
        let labels = Tensor::zeros(3, DType::U32, &device).unwrap();
        assert!(matches!(
            Dataset::new(features, labels),
            Err(LoraError::Dataset(_))
        ));
    }

    #[test]
    fn test_flatten_images() -> Result<()> {
        let images = Tensor::zeros((3, 28, 28), DType::F32, &Device::Cpu)?;
        assert_eq!(Dataset::flatten_images(&images)?.dims(), &[3, 784]);
        Ok(())
    }

    #[test]
    fn test_synthetic_dataset() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let ds = Dataset::synthetic(20, 8, 4, 0.1, &mut rng, &Device::Cpu)?;
        assert_eq!(ds.len(), 20);
        assert_eq!(ds.num_features(), 8);
        assert_eq!(ds.labels().dtype(), DType::U32);
        assert_eq!(ds.labels().to_vec1::<u32>()?[..5], [0, 1, 2, 3, 0]);
        Ok(())
    }
}
