use super::{Batch, Dataset, DatasetError, DatasetReader};
use ndarray::{s, Array1, Array4, ArrayView1, ArrayView4};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use tracing::{debug, warn};

const DATA_MAGIC_NUMBER: u32 = 0x0000_0803;
const LABELS_MAGIC_NUMBER: u32 = 0x0000_0801;
const ORIGINAL_SIDE: usize = 28;
const NUM_CHANNELS: usize = 1;
const GREYSCALE_SIZE: f64 = 255f64;

/// Reader for the IDX files MNIST ships in.
/// Images are centered inside a zero border `margin` pixels wide
pub struct MnistReader {
    pub margin: usize,
    original_height: usize,
    original_width: usize,
    // Refuse files that end before the requested number of objects
    strict: bool,
    train_batch: Batch,
    test_batch: Batch,
    train: Dataset,
    test: Dataset,
}

impl Default for MnistReader {
    fn default() -> Self {
        MnistReader::new(0)
    }
}

impl MnistReader {
    pub fn new(margin: usize) -> MnistReader {
        let side = ORIGINAL_SIDE + 2 * margin;

        MnistReader {
            margin,
            original_height: ORIGINAL_SIDE,
            original_width: ORIGINAL_SIDE,
            strict: false,
            train_batch: Batch::default(),
            test_batch: Batch::default(),
            train: Dataset::empty(NUM_CHANNELS, side, side),
            test: Dataset::empty(NUM_CHANNELS, side, side),
        }
    }

    pub fn strict(mut self, strict: bool) -> MnistReader {
        self.strict = strict;
        self
    }

    pub fn object_height(&self) -> usize {
        self.original_height + 2 * self.margin
    }

    pub fn object_width(&self) -> usize {
        self.original_width + 2 * self.margin
    }

    fn empty_dataset(&self) -> Dataset {
        Dataset::empty(NUM_CHANNELS, self.object_height(), self.object_width())
    }

    /// Both headers are checked before anything is allocated, so a count the
    /// files can't hold fails with a format error
    fn read_split(&self, batch: &Batch) -> Result<Dataset, DatasetError> {
        if batch.count == 0 {
            return Ok(self.empty_dataset());
        }

        let mut data_stream = open(&batch.data_path)?;
        self.read_data_header(&mut data_stream, &batch.data_path, batch.count)?;

        let mut labels_stream = open(&batch.labels_path)?;
        read_labels_header(&mut labels_stream, &batch.labels_path, batch.count)?;

        let mut dataset = Dataset::zeros(
            batch.count,
            NUM_CHANNELS,
            self.object_height(),
            self.object_width(),
        );
        self.fill_data(&mut data_stream, &batch.data_path, &mut dataset.data)?;
        self.fill_labels(&mut labels_stream, &batch.labels_path, &mut dataset.target)?;

        Ok(dataset)
    }

    fn read_data_header<R: Read>(
        &self,
        stream: &mut R,
        path: &Path,
        num_objects: usize,
    ) -> Result<(), DatasetError> {
        let magic_number = read_dword(stream, path)?;
        check_magic(path, DATA_MAGIC_NUMBER, magic_number)?;

        let number_of_images = read_dword(stream, path)? as usize;
        check_object_count(path, number_of_images, num_objects)?;

        let number_of_rows = read_dword(stream, path)? as usize;
        check_dimension(path, "row count", self.original_height, number_of_rows)?;

        let number_of_columns = read_dword(stream, path)? as usize;
        check_dimension(path, "column count", self.original_width, number_of_columns)
    }

    /// Copy one image per object of `data`, centered inside the margin
    fn fill_data<R: Read>(
        &self,
        stream: &mut R,
        path: &Path,
        data: &mut Array4<f64>,
    ) -> Result<(), DatasetError> {
        let num_objects = data.dim().0;
        let (height, width) = (self.original_height, self.original_width);
        let margin = self.margin;
        let mut channel_buffer = vec![0u8; height * width];

        let mut objects_read = 0;
        while objects_read < num_objects {
            if !read_record(stream, &mut channel_buffer, path)? {
                break;
            }

            let mut image = data.slice_mut(s![
                objects_read,
                0,
                margin..margin + height,
                margin..margin + width
            ]);
            let rows = image.rows_mut().into_iter();
            for (mut row, pixels) in rows.zip(channel_buffer.chunks_exact(width)) {
                for (value, &pixel) in row.iter_mut().zip(pixels) {
                    *value = normalize(pixel);
                }
            }

            objects_read += 1;
        }

        self.check_complete(path, objects_read, num_objects)
    }

    fn fill_labels<R: Read>(
        &self,
        stream: &mut R,
        path: &Path,
        labels: &mut Array1<f64>,
    ) -> Result<(), DatasetError> {
        let num_objects = labels.len();
        let mut class_number = [0u8; 1];
        let mut objects_read = 0;

        while objects_read < num_objects {
            if !read_record(stream, &mut class_number, path)? {
                break;
            }

            // The label byte is a plain numeric value, taken as a signed byte
            labels[objects_read] = f64::from(class_number[0] as i8);
            objects_read += 1;
        }

        self.check_complete(path, objects_read, num_objects)
    }

    /// Short files leave the remaining objects zero filled, unless the reader is strict
    fn check_complete(
        &self,
        path: &Path,
        read: usize,
        requested: usize,
    ) -> Result<(), DatasetError> {
        if read == requested {
            debug!("read {} objects from {}", read, path.display());
            return Ok(());
        }

        if self.strict {
            return Err(DatasetError::Truncated {
                path: path.to_owned(),
                read,
                requested,
            });
        }

        warn!(
            "{} ended after {} of {} objects, the rest are left as zeros",
            path.display(),
            read,
            requested
        );

        Ok(())
    }
}

impl DatasetReader for MnistReader {
    fn set_train_batch(&mut self, batch: Batch) {
        self.train_batch = batch;
    }

    fn set_test_batch(&mut self, batch: Batch) {
        self.test_batch = batch;
    }

    fn read(&mut self) -> Result<(), DatasetError> {
        // Nothing from a failed read must stay visible through the accessors
        self.train = self.empty_dataset();
        self.test = self.empty_dataset();

        let train = self.read_split(&self.train_batch)?;
        let test = self.read_split(&self.test_batch)?;

        self.train = train;
        self.test = test;

        Ok(())
    }

    fn train_data(&self) -> ArrayView4<'_, f64> {
        self.train.data.view()
    }

    fn train_labels(&self) -> ArrayView1<'_, f64> {
        self.train.target.view()
    }

    fn test_data(&self) -> ArrayView4<'_, f64> {
        self.test.data.view()
    }

    fn test_labels(&self) -> ArrayView1<'_, f64> {
        self.test.target.view()
    }
}

fn open(path: &Path) -> Result<BufReader<File>, DatasetError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| DatasetError::FileUnavailable {
            path: path.to_owned(),
            source,
        })
}

fn normalize(pixel: u8) -> f64 {
    f64::from(pixel) / GREYSCALE_SIZE
}

/// Header words are stored big-endian
fn read_dword<R: Read>(stream: &mut R, path: &Path) -> Result<u32, DatasetError> {
    let mut dword = [0u8; 4];

    match stream.read_exact(&mut dword) {
        Ok(()) => Ok(u32::from_be_bytes(dword)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(DatasetError::TruncatedHeader {
            path: path.to_owned(),
        }),
        Err(source) => Err(DatasetError::Io {
            path: path.to_owned(),
            source,
        }),
    }
}

/// Fill `buffer` with the next record. Returns false once the stream is exhausted
fn read_record<R: Read>(
    stream: &mut R,
    buffer: &mut [u8],
    path: &Path,
) -> Result<bool, DatasetError> {
    match stream.read_exact(buffer) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(source) => Err(DatasetError::Io {
            path: path.to_owned(),
            source,
        }),
    }
}

fn check_object_count(path: &Path, declared: usize, requested: usize) -> Result<(), DatasetError> {
    if declared < requested {
        return Err(DatasetError::NotEnoughObjects {
            path: path.to_owned(),
            declared,
            requested,
        });
    }

    Ok(())
}

fn read_labels_header<R: Read>(
    stream: &mut R,
    path: &Path,
    num_objects: usize,
) -> Result<(), DatasetError> {
    let magic_number = read_dword(stream, path)?;
    check_magic(path, LABELS_MAGIC_NUMBER, magic_number)?;

    let number_of_items = read_dword(stream, path)? as usize;
    check_object_count(path, number_of_items, num_objects)
}

fn check_magic(path: &Path, expected: u32, found: u32) -> Result<(), DatasetError> {
    if expected != found {
        return Err(DatasetError::BadMagic {
            path: path.to_owned(),
            expected,
            found,
        });
    }

    Ok(())
}

fn check_dimension(
    path: &Path,
    axis: &'static str,
    expected: usize,
    found: usize,
) -> Result<(), DatasetError> {
    if expected != found {
        return Err(DatasetError::DimensionMismatch {
            path: path.to_owned(),
            axis,
            expected,
            found,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Cursor;
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    const SIDE: usize = ORIGINAL_SIDE;

    fn pixel(object: usize, row: usize, column: usize) -> u8 {
        ((object * 31 + row * SIDE + column) % 256) as u8
    }

    fn image_file(magic: u32, declared: u32, rows: u32, columns: u32, objects: usize) -> Vec<u8> {
        let mut bytes = vec![];
        for word in [magic, declared, rows, columns] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        for object in 0..objects {
            for row in 0..rows as usize {
                for column in 0..columns as usize {
                    bytes.push(pixel(object, row, column));
                }
            }
        }
        bytes
    }

    fn label_file(magic: u32, declared: u32, labels: &[u8]) -> Vec<u8> {
        let mut bytes = vec![];
        bytes.extend_from_slice(&magic.to_be_bytes());
        bytes.extend_from_slice(&declared.to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    fn write(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    /// Writes a well formed train split and an empty test split
    fn train_only(dir: &TempDir, images: &[u8], labels: &[u8], count: usize) -> (Batch, Batch) {
        let train = Batch::new(
            write(dir, "train-images", images),
            write(dir, "train-labels", labels),
            count,
        );
        (train, Batch::default())
    }

    #[test]
    fn reads_normalized_pixels() {
        let dir = tempdir().unwrap();
        let images = image_file(DATA_MAGIC_NUMBER, 3, 28, 28, 3);
        let labels = label_file(LABELS_MAGIC_NUMBER, 3, &[5, 0, 4]);
        let (train, test) = train_only(&dir, &images, &labels, 3);

        let mut reader = MnistReader::new(0);
        reader.configure(train, test);
        reader.read().unwrap();

        let data = reader.train_data();
        assert_eq!(data.dim(), (3, 1, 28, 28));
        for object in 0..3 {
            for row in 0..SIDE {
                for column in 0..SIDE {
                    let expected = pixel(object, row, column) as f64 / 255.0;
                    assert!((data[[object, 0, row, column]] - expected).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn margin_pads_with_zeros() {
        let dir = tempdir().unwrap();
        let margin = 2;
        let images = image_file(DATA_MAGIC_NUMBER, 2, 28, 28, 2);
        let labels = label_file(LABELS_MAGIC_NUMBER, 2, &[1, 2]);
        let (train, test) = train_only(&dir, &images, &labels, 2);

        let mut reader = MnistReader::new(margin);
        reader.configure(train, test);
        reader.read().unwrap();

        let side = SIDE + 2 * margin;
        let data = reader.train_data();
        assert_eq!(data.dim(), (2, 1, side, side));

        for object in 0..2 {
            for row in 0..side {
                for column in 0..side {
                    let value = data[[object, 0, row, column]];
                    let inside = (margin..margin + SIDE).contains(&row)
                        && (margin..margin + SIDE).contains(&column);
                    if inside {
                        let expected = pixel(object, row - margin, column - margin) as f64 / 255.0;
                        assert!((value - expected).abs() < 1e-12);
                    } else {
                        assert_eq!(value, 0.0);
                    }
                }
            }
        }
    }

    #[test]
    fn labels_are_raw_signed_bytes() {
        let dir = tempdir().unwrap();
        let images = image_file(DATA_MAGIC_NUMBER, 4, 28, 28, 4);
        let labels = label_file(LABELS_MAGIC_NUMBER, 4, &[0, 7, 9, 200]);
        let (train, test) = train_only(&dir, &images, &labels, 4);

        let mut reader = MnistReader::new(0);
        reader.configure(train, test);
        reader.read().unwrap();

        let labels = reader.train_labels();
        assert_eq!(labels.len(), 4);
        assert_eq!(labels.to_vec(), vec![0.0, 7.0, 9.0, -56.0]);
    }

    #[test]
    fn takes_only_requested_objects() {
        let dir = tempdir().unwrap();
        let images = image_file(DATA_MAGIC_NUMBER, 5, 28, 28, 5);
        let labels = label_file(LABELS_MAGIC_NUMBER, 5, &[1, 2, 3, 4, 5]);
        let (train, test) = train_only(&dir, &images, &labels, 2);

        let mut reader = MnistReader::new(0);
        reader.configure(train, test);
        reader.read().unwrap();

        assert_eq!(reader.train_data().dim().0, 2);
        assert_eq!(reader.train_labels().to_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn reads_both_splits() {
        let dir = tempdir().unwrap();
        let train = Batch::new(
            write(&dir, "train-images", &image_file(DATA_MAGIC_NUMBER, 3, 28, 28, 3)),
            write(&dir, "train-labels", &label_file(LABELS_MAGIC_NUMBER, 3, &[3, 1, 4])),
            3,
        );
        let test = Batch::new(
            write(&dir, "test-images", &image_file(DATA_MAGIC_NUMBER, 1, 28, 28, 1)),
            write(&dir, "test-labels", &label_file(LABELS_MAGIC_NUMBER, 1, &[9])),
            1,
        );

        let mut reader = MnistReader::new(1);
        reader.configure(train, test);
        reader.read().unwrap();

        assert_eq!(reader.train_data().dim(), (3, 1, 30, 30));
        assert_eq!(reader.test_data().dim(), (1, 1, 30, 30));
        assert_eq!(reader.test_labels().to_vec(), vec![9.0]);
    }

    #[test]
    fn swapped_magic_is_a_format_error() {
        let dir = tempdir().unwrap();
        let images = image_file(LABELS_MAGIC_NUMBER, 2, 28, 28, 2);
        let labels = label_file(LABELS_MAGIC_NUMBER, 2, &[1, 2]);
        let (train, test) = train_only(&dir, &images, &labels, 2);

        let mut reader = MnistReader::new(0);
        reader.configure(train, test);
        let err = reader.read().unwrap_err();

        assert!(err.is_format_error());
        assert!(matches!(
            err,
            DatasetError::BadMagic { expected: DATA_MAGIC_NUMBER, found: LABELS_MAGIC_NUMBER, .. }
        ));
        assert_eq!(reader.train_data().dim().0, 0);
        assert_eq!(reader.train_labels().len(), 0);
    }

    #[test]
    fn bad_label_magic_is_a_format_error() {
        let dir = tempdir().unwrap();
        let images = image_file(DATA_MAGIC_NUMBER, 2, 28, 28, 2);
        let labels = label_file(DATA_MAGIC_NUMBER, 2, &[1, 2]);
        let (train, test) = train_only(&dir, &images, &labels, 2);

        let mut reader = MnistReader::new(0);
        reader.configure(train, test);

        let err = reader.read().unwrap_err();
        assert!(matches!(err, DatasetError::BadMagic { expected: LABELS_MAGIC_NUMBER, .. }));
        assert_eq!(reader.train_data().dim().0, 0);
    }

    #[test]
    fn rejects_more_objects_than_declared() {
        let dir = tempdir().unwrap();
        let images = image_file(DATA_MAGIC_NUMBER, 2, 28, 28, 2);
        let labels = label_file(LABELS_MAGIC_NUMBER, 2, &[1, 2]);
        let (train, test) = train_only(&dir, &images, &labels, 3);

        let mut reader = MnistReader::new(0);
        reader.configure(train, test);

        let err = reader.read().unwrap_err();
        assert!(matches!(
            err,
            DatasetError::NotEnoughObjects { declared: 2, requested: 3, .. }
        ));
    }

    #[test]
    fn huge_count_fails_before_allocating() {
        let dir = tempdir().unwrap();
        let images = image_file(DATA_MAGIC_NUMBER, 2, 28, 28, 2);
        let labels = label_file(LABELS_MAGIC_NUMBER, 2, &[1, 2]);
        let (train, test) = train_only(&dir, &images, &labels, 1 << 60);

        let mut reader = MnistReader::new(0);
        reader.configure(train, test);

        let err = reader.read().unwrap_err();
        assert!(err.is_format_error());
        let huge = 1usize << 60;
        assert!(matches!(
            err,
            DatasetError::NotEnoughObjects { declared: 2, requested, .. } if requested == huge
        ));
        assert_eq!(reader.train_data().dim().0, 0);
    }

    #[test]
    fn label_header_is_checked_before_allocating() {
        let dir = tempdir().unwrap();
        let images = image_file(DATA_MAGIC_NUMBER, 5, 28, 28, 5);
        let labels = label_file(LABELS_MAGIC_NUMBER, 2, &[1, 2]);
        let (train, test) = train_only(&dir, &images, &labels, 4);

        let mut reader = MnistReader::new(0);
        reader.configure(train, test);

        let err = reader.read().unwrap_err();
        assert!(matches!(
            err,
            DatasetError::NotEnoughObjects { declared: 2, requested: 4, .. }
        ));
    }

    #[test]
    fn rejects_unexpected_image_size() {
        let dir = tempdir().unwrap();
        let images = image_file(DATA_MAGIC_NUMBER, 1, 28, 27, 1);
        let labels = label_file(LABELS_MAGIC_NUMBER, 1, &[1]);
        let (train, test) = train_only(&dir, &images, &labels, 1);

        let mut reader = MnistReader::new(0);
        reader.configure(train, test);

        let err = reader.read().unwrap_err();
        assert!(err.is_format_error());
        assert!(matches!(
            err,
            DatasetError::DimensionMismatch { axis: "column count", expected: 28, found: 27, .. }
        ));
    }

    #[test]
    fn short_stream_leaves_zero_tail() {
        let dir = tempdir().unwrap();
        // Header promises three objects, only two are present
        let images = image_file(DATA_MAGIC_NUMBER, 3, 28, 28, 2);
        let labels = label_file(LABELS_MAGIC_NUMBER, 3, &[6, 8]);
        let (train, test) = train_only(&dir, &images, &labels, 3);

        let mut reader = MnistReader::new(0);
        reader.configure(train, test);
        reader.read().unwrap();

        let data = reader.train_data();
        assert!(data[[1, 0, 5, 5]] > 0.0);
        assert!(data.slice(s![2, .., .., ..]).iter().all(|&v| v == 0.0));
        assert_eq!(reader.train_labels().to_vec(), vec![6.0, 8.0, 0.0]);
    }

    #[test]
    fn strict_reader_rejects_short_stream() {
        let dir = tempdir().unwrap();
        let images = image_file(DATA_MAGIC_NUMBER, 3, 28, 28, 2);
        let labels = label_file(LABELS_MAGIC_NUMBER, 3, &[6, 8, 1]);
        let (train, test) = train_only(&dir, &images, &labels, 3);

        let mut reader = MnistReader::new(0).strict(true);
        reader.configure(train, test);

        let err = reader.read().unwrap_err();
        assert!(matches!(err, DatasetError::Truncated { read: 2, requested: 3, .. }));
        assert_eq!(reader.train_data().dim().0, 0);
    }

    #[test]
    fn truncated_header_is_a_format_error() {
        let reader = MnistReader::new(0);
        let mut stream = Cursor::new(vec![0u8, 0, 8, 3, 0, 0]);

        let err = reader
            .read_data_header(&mut stream, Path::new("short"), 1)
            .unwrap_err();
        assert!(matches!(err, DatasetError::TruncatedHeader { .. }));
        assert!(err.is_format_error());
    }

    #[test]
    fn missing_file_is_unavailable() {
        let dir = tempdir().unwrap();
        let train = Batch::new(dir.path().join("nope"), dir.path().join("nope-labels"), 1);

        let mut reader = MnistReader::new(0);
        reader.configure(train, Batch::default());

        let err = reader.read().unwrap_err();
        assert!(matches!(err, DatasetError::FileUnavailable { .. }));
        assert!(!err.is_format_error());
    }

    #[test]
    fn accessors_are_empty_before_read() {
        let reader = MnistReader::new(2);

        assert_eq!(reader.train_data().dim(), (0, 1, 32, 32));
        assert_eq!(reader.train_labels().len(), 0);
        assert_eq!(reader.test_data().dim().0, 0);
        assert_eq!(reader.test_labels().len(), 0);
    }

    #[test]
    fn zero_count_split_opens_nothing() {
        let dir = tempdir().unwrap();
        let images = image_file(DATA_MAGIC_NUMBER, 1, 28, 28, 1);
        let labels = label_file(LABELS_MAGIC_NUMBER, 1, &[3]);
        let (train, _) = train_only(&dir, &images, &labels, 1);
        let test = Batch::new("/does/not/exist", "/does/not/exist/either", 0);

        let mut reader = MnistReader::new(0);
        reader.configure(train, test);
        reader.read().unwrap();

        assert_eq!(reader.test_data().dim().0, 0);
        assert_eq!(reader.train_labels().to_vec(), vec![3.0]);
    }
}
