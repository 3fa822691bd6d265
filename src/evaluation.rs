use ndarray::{ArrayView1, ArrayView2, Axis};
use tracing::warn;

/// Accuracy a run must exceed to count as a success
pub const DEFAULT_THRESHOLD: f64 = 0.9;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    pub matches: usize,
    pub total: usize,
    pub accuracy: f64,
    pub passed: bool,
}

/// Index of the largest score. Equal scores keep the lowest index
pub fn argmax(row: ArrayView1<f64>) -> usize {
    let mut best = 0;

    for (idx, &score) in row.iter().enumerate() {
        if score > row[best] {
            best = idx;
        }
    }

    best
}

/// Number of score rows whose arg-max equals the label on the same row
pub fn count_matches(scores: ArrayView2<f64>, labels: ArrayView1<f64>) -> usize {
    scores
        .axis_iter(Axis(0))
        .zip(labels.iter())
        .filter(|(row, label)| argmax(row.view()) as f64 == **label)
        .count()
}

/// Accuracy is taken over `total`, the number of test objects the run asked
/// for, not over the number of score rows
pub fn evaluate(
    scores: ArrayView2<f64>,
    labels: ArrayView1<f64>,
    total: usize,
    threshold: f64,
) -> Evaluation {
    if scores.nrows() != total {
        warn!(
            "scoring {} predictions against {} requested test objects",
            scores.nrows(),
            total
        );
    }

    let matches = count_matches(scores, labels);
    let accuracy = if total == 0 {
        0f64
    } else {
        matches as f64 / total as f64
    };

    Evaluation {
        matches,
        total,
        accuracy,
        passed: accuracy > threshold,
    }
}

/// Print every score row followed by the predicted and the actual class
pub fn print_predicted_classes(scores: ArrayView2<f64>, labels: ArrayView1<f64>) {
    for (row, label) in scores.axis_iter(Axis(0)).zip(labels.iter()) {
        let line: Vec<String> = row.iter().map(|p| format!("{:.4}", p)).collect();
        println!("{}  -> {} | {}", line.join(" "), argmax(row), label);
    }
}
