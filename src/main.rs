use clap::Parser;
use json::object;
use rust_lenet::evaluation::print_predicted_classes;
use rust_lenet::{
    build_topology, evaluate, Batch, DatasetError, DatasetReader, DenseEngine, DenseModel, Engine,
    EngineError, MnistReader, DEFAULT_THRESHOLD,
};
use std::fs::File;
use std::io::Write;
use std::process::ExitCode;
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_DATASET_FILE_NAMES: [&str; 4] = [
    "./data/train-images-idx3-ubyte",
    "./data/train-labels-idx1-ubyte",
    "./data/t10k-images-idx3-ubyte",
    "./data/t10k-labels-idx1-ubyte",
];

/// Exit status when a dataset file can't be opened
const FILE_ERROR_EXIT_CODE: u8 = 2;
/// Exit status when the accuracy threshold is missed or the run fails
const FAILURE_EXIT_CODE: u8 = 255;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Dataset files: <train-images> <train-labels> <test-images> <test-labels>.
    /// The files under ./data are used when these are not given
    #[arg(value_name = "FILE")]
    files: Vec<String>,

    /// Number of training images to read
    #[arg(long, default_value_t = 50000)]
    train_count: usize,

    /// Number of test images to read
    #[arg(long, default_value_t = 100)]
    test_count: usize,

    /// Zero padding added around every image
    #[arg(short, long, default_value_t = 0)]
    margin: usize,

    /// Batch size of the network
    #[arg(short, long, default_value_t = 10)]
    batch_size: usize,

    /// Learning rate of the network
    #[arg(short, long, default_value_t = 0.01)]
    learning_rate: f64,

    /// Number of passes over the training set
    #[arg(short, long, default_value_t = 1)]
    num_epochs: usize,

    /// Accuracy the test set has to exceed
    #[arg(short, long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: f64,

    /// Fail when a dataset file holds fewer objects than its header declares
    #[arg(long)]
    strict: bool,

    /// Seed for weight initialization
    #[arg(long)]
    seed: Option<u64>,

    /// Print the class scores of every test object
    #[arg(short, long)]
    print_predictions: bool,

    /// Whether or not to export the model's weights
    /// Weights are exported in JSON format
    #[arg(short, long, default_value = None)]
    weight_path: Option<String>,
}

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("could not write weights: {0}")]
    Weights(#[from] std::io::Error),
}

fn check_file_is_available(path: &str) -> bool {
    if File::open(path).is_ok() {
        return true;
    }

    println!("Can't open file {}", path);
    false
}

/// Pick the dataset files to read. Returns None if a file that has to be read is missing
fn dataset_file_names(files: Vec<String>) -> Option<[String; 4]> {
    match files.len() {
        0 => {}
        4 if files.iter().all(|path| check_file_is_available(path)) => {
            return files.try_into().ok();
        }
        4 => println!("Warning: Try to open default datasetFileNames"),
        _ => {
            let program = std::env::args().next().unwrap_or_default();
            println!(
                "Usage: {} [ <filename_0> <filename_1> <filename_2> <filename_3> ]",
                program
            );
            println!("Warning: Try to open default datasetFileNames");
        }
    }

    let defaults = DEFAULT_DATASET_FILE_NAMES.map(String::from);
    defaults
        .iter()
        .all(|path| check_file_is_available(path))
        .then_some(defaults)
}

/// Write the weights of the model in JSON formats
/// The keys are e.g. W0, b0, W1, b1. The values are provided in an array of the weights
fn write_weights(weight_path: &str, model: &DenseModel) -> std::io::Result<()> {
    let mut data = object! {};
    let mut file = File::create(weight_path)?;

    for (i, layer) in model.layers().iter().enumerate() {
        let w: Vec<f64> = layer.weights.iter().copied().collect();
        let b: Vec<f64> = layer.biases.iter().copied().collect();
        let w_key = format!("W{}", i);
        let b_key = format!("b{}", i);

        data[w_key] = w.into();
        data[b_key] = b.into();
    }

    file.write_all(data.dump().as_bytes())?;

    Ok(())
}

/// Load the data, train LeNet and score the test set.
/// Returns whether the accuracy threshold was met
fn run(args: &Args, file_names: &[String; 4]) -> Result<bool, RunError> {
    info!("Data loading started...");

    let mut reader = MnistReader::new(args.margin).strict(args.strict);
    reader.configure(
        Batch::new(&file_names[0], &file_names[1], args.train_count),
        Batch::new(&file_names[2], &file_names[3], args.test_count),
    );
    reader.read()?;

    info!("Data loaded");

    let topology = build_topology();
    debug!("LeNet topology:\n{}", topology);

    let mut engine = DenseEngine::new(args.num_epochs);
    if let Some(seed) = args.seed {
        engine = engine.with_seed(seed);
    }

    info!("LeNet training started...");

    let model = engine.train(
        &topology,
        reader.train_data(),
        reader.train_labels(),
        args.batch_size,
        args.learning_rate,
    )?;

    info!("LeNet training completed");

    if let Some(weight_path) = &args.weight_path {
        write_weights(weight_path, &model)?;
        info!("Weights written to {}", weight_path);
    }

    info!("LeNet testing started");

    let scores = engine.predict(&model, reader.test_data())?;
    if args.print_predictions {
        print_predicted_classes(scores.view(), reader.test_labels());
    }

    let evaluation = evaluate(
        scores.view(),
        reader.test_labels(),
        args.test_count,
        args.threshold,
    );
    info!(
        "{} of {} test objects classified correctly, accuracy {:.4} (threshold {})",
        evaluation.matches, evaluation.total, evaluation.accuracy, args.threshold
    );

    Ok(evaluation.passed)
}

/// Process status for the outcome of a run
fn exit_status(result: Result<bool, RunError>) -> u8 {
    match result {
        Ok(true) => 0,
        Ok(false) => FAILURE_EXIT_CODE,
        Err(RunError::Dataset(e @ DatasetError::FileUnavailable { .. })) => {
            error!("{}", e);
            FILE_ERROR_EXIT_CODE
        }
        Err(e) => {
            error!("{}", e);
            FAILURE_EXIT_CODE
        }
    }
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let Some(file_names) = dataset_file_names(args.files.clone()) else {
        return ExitCode::from(FILE_ERROR_EXIT_CODE);
    };

    ExitCode::from(exit_status(run(&args, &file_names)))
}
