use ndarray::{Array1, Array2, ArrayView1, Zip};
use crate::drivers::AcquisitionError;
/// Fixed-length analog output buffer, one row per output channel.
#[derive(Clone, Debug, PartialEq)]
pub struct WaveformBuffer {
    channel_labels: Vec<String>,
    sample_rate_hz: u64,
    samples: Array2<f64>, // channels x samples
}
impl WaveformBuffer {
    pub fn new(
        channel_labels: Vec<String>,
        sample_rate_hz: u64,
        samples: Array2<f64>,
    ) -> Result<Self, AcquisitionError> {
        if sample_rate_hz == 0 {
            return Err(AcquisitionError::InvalidConfig(
                "sample rate must be greater than zero".into(),
            ));
        }
        if samples.nrows() != channel_labels.len() {
            return Err(AcquisitionError::ShapeMismatch {
                expected: (channel_labels.len(), samples.ncols()),
                actual: samples.dim(),
            });
        }
        Ok(Self {
            channel_labels,
            sample_rate_hz,
            samples,
        })
    }
    pub fn channel_labels(&self) -> &[String] {
        &self.channel_labels
    }
    pub fn sample_rate_hz(&self) -> u64 {
        self.sample_rate_hz
    }
    pub fn samples(&self) -> &Array2<f64> {
        &self.samples
    }
    pub fn channel_count(&self) -> usize {
        self.samples.nrows()
    }
    pub fn sample_count(&self) -> usize {
        self.samples.ncols()
    }
    /// Row `idx`; panics if `idx >= channel_count()`.
    pub fn channel(&self, idx: usize) -> ArrayView1<'_, f64> {
        self.samples.row(idx)
    }
    pub fn duration_seconds(&self) -> f64 {
        self.sample_count() as f64 / self.sample_rate_hz as f64
    }
}
/// Snapshot of the running average of one iteration.
#[derive(Clone, Debug)]
pub struct AveragedTrace {
    /// 0-based iteration this trace belongs to.
    pub iteration: usize,
    /// Number of raw captures folded into `samples` so far.
    pub averages: usize,
    pub sample_rate_hz: u64,
    pub channel_labels: Vec<String>,
    pub samples: Array2<f64>, // channels x samples
}
impl AveragedTrace {
    pub fn sample_count(&self) -> usize {
        self.samples.ncols()
    }
    pub fn channel_index(&self, label: &str) -> Option<usize> {
        self.channel_labels.iter().position(|l| l == label)
    }
    pub fn channel(&self, label: &str) -> Option<ArrayView1<'_, f64>> {
        self.channel_index(label).map(|idx| self.samples.row(idx))
    }
    pub fn time_axis(&self) -> Array1<f64> {
        let n = self.sample_count();
        Array1::linspace(0.0, n as f64 / self.sample_rate_hz as f64, n)
    }
    pub fn nyquist_hz(&self) -> f64 {
        self.sample_rate_hz as f64 / 2.0
    }
}
/// Incremental mean of repeated captures.
///
/// After `k` pushes every element equals the arithmetic mean of the `k`
/// captures at that position. Each push folds the new capture in with
/// `A_k = (k * A_{k-1} + x_k) / (k + 1)`; history is never re-summed.
#[derive(Clone, Debug)]
pub struct RunningAverage {
    mean: Array2<f64>,
    count: usize,
}
impl RunningAverage {
    pub fn new(channels: usize, samples: usize) -> Self {
        Self {
            mean: Array2::zeros((channels, samples)),
            count: 0,
        }
    }
    pub fn reset(&mut self) {
        self.mean.fill(0.0);
        self.count = 0;
    }
    pub fn push(&mut self, capture: &Array2<f64>) -> Result<&Array2<f64>, AcquisitionError> {
        if capture.dim() != self.mean.dim() {
            return Err(AcquisitionError::ShapeMismatch {
                expected: self.mean.dim(),
                actual: capture.dim(),
            });
        }
        let k = self.count as f64;
        Zip::from(&mut self.mean)
            .and(capture)
            .for_each(|avg, &x| *avg = (k * *avg + x) / (k + 1.0));
        self.count += 1;
        Ok(&self.mean)
    }
    pub fn count(&self) -> usize {
        self.count
    }
    pub fn mean(&self) -> &Array2<f64> {
        &self.mean
    }
    pub fn dim(&self) -> (usize, usize) {
        self.mean.dim()
    }
}
