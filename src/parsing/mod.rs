use ndarray::{Array1, Array4, ArrayView1, ArrayView4};
use std::path::PathBuf;
use thiserror::Error;

pub mod mnist;

/// One split of a dataset: images laid out as (object, channel, row, column)
/// and one label per object
pub struct Dataset {
    pub data: Array4<f64>,
    pub target: Array1<f64>,
}

impl Dataset {
    /// A dataset holding no objects, with the given image geometry
    pub fn empty(channels: usize, height: usize, width: usize) -> Dataset {
        Dataset::zeros(0, channels, height, width)
    }

    /// Zero filled tensors for `count` objects. The zeros double as the margin padding
    pub fn zeros(count: usize, channels: usize, height: usize, width: usize) -> Dataset {
        Dataset {
            data: Array4::zeros((count, channels, height, width)),
            target: Array1::zeros(count),
        }
    }
}

/// Where a split lives on disk and how many objects to take from it
#[derive(Clone, Debug, Default)]
pub struct Batch {
    pub data_path: PathBuf,
    pub labels_path: PathBuf,
    pub count: usize,
}

impl Batch {
    pub fn new(
        data_path: impl Into<PathBuf>,
        labels_path: impl Into<PathBuf>,
        count: usize,
    ) -> Batch {
        Batch {
            data_path: data_path.into(),
            labels_path: labels_path.into(),
            count,
        }
    }
}

/// Reads a train and a test split into tensors.
/// New file formats are supported by adding implementers of this trait
pub trait DatasetReader {
    fn set_train_batch(&mut self, batch: Batch);
    fn set_test_batch(&mut self, batch: Batch);

    /// Record both splits. No I/O happens until `read`
    fn configure(&mut self, train: Batch, test: Batch) {
        self.set_train_batch(train);
        self.set_test_batch(test);
    }

    fn read(&mut self) -> Result<(), DatasetError>;

    fn train_data(&self) -> ArrayView4<'_, f64>;
    fn train_labels(&self) -> ArrayView1<'_, f64>;
    fn test_data(&self) -> ArrayView4<'_, f64>;
    fn test_labels(&self) -> ArrayView1<'_, f64>;
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Can't open file {}: {source}", path.display())]
    FileUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error while reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid data file format in {}: magic number {found:#010x}, expected {expected:#010x}", path.display())]
    BadMagic { path: PathBuf, expected: u32, found: u32 },

    #[error("Batch {} contains invalid images: {axis} is {found}, expected {expected}", path.display())]
    DimensionMismatch {
        path: PathBuf,
        axis: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Number of objects too large: {} declares {declared}, {requested} requested", path.display())]
    NotEnoughObjects {
        path: PathBuf,
        declared: usize,
        requested: usize,
    },

    #[error("File {} ends inside its header", path.display())]
    TruncatedHeader { path: PathBuf },

    #[error("File {} ends after {read} of {requested} objects", path.display())]
    Truncated {
        path: PathBuf,
        read: usize,
        requested: usize,
    },
}

impl DatasetError {
    /// True for errors caused by the file contents rather than by the file system
    pub fn is_format_error(&self) -> bool {
        !matches!(
            self,
            DatasetError::FileUnavailable { .. } | DatasetError::Io { .. }
        )
    }
}
